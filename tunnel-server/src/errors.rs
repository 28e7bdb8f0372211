//! Error-kind → HTTP response mapping (`spec.md` §7 "Error handling
//! design").
//!
//! Each [`ErrorKind`] already carries its HTTP status
//! (`ErrorKind::http_status`); this module adds the styled HTML error
//! page the distilled spec's Non-goals do not exclude (dashboards/email
//! are out of scope, but the 404/503/502 error *pages* are explicitly
//! part of `spec.md` §4.5).

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use tunnel_protocol::ErrorKind;

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn page(title: &str, heading: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
  body {{ font-family: -apple-system, BlinkMacSystemFont, sans-serif; background: #0b0c10; color: #e4e6eb; display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
  .card {{ max-width: 32rem; padding: 2rem; border-radius: 0.75rem; background: #15171c; box-shadow: 0 10px 30px rgba(0,0,0,0.4); }}
  h1 {{ font-size: 1.25rem; margin: 0 0 0.5rem; }}
  p {{ color: #9aa0ac; line-height: 1.5; }}
  code {{ background: #20232b; padding: 0.1rem 0.35rem; border-radius: 0.25rem; }}
</style>
</head>
<body>
  <div class="card">
    <h1>{heading}</h1>
    <p>{body}</p>
  </div>
</body>
</html>"#
    )
}

/// Renders the styled error page for a 404: no tunnel registered for
/// this host at all.
pub fn not_found_page(host: &str) -> Response {
    let body = page(
        "Not Found",
        "No tunnel here",
        &format!(
            "No tunnel is registered for <code>{}</code>.",
            escape(host)
        ),
    );
    (StatusCode::NOT_FOUND, Html(body)).into_response()
}

/// Renders the styled error page for a 503: a tunnel record exists but
/// no live session is connected.
pub fn endpoint_offline_page(host: &str) -> Response {
    let body = page(
        "Endpoint Offline",
        "This tunnel's client is offline",
        &format!(
            "<code>{}</code> is registered but its client agent is not currently connected.",
            escape(host)
        ),
    );
    (StatusCode::SERVICE_UNAVAILABLE, Html(body)).into_response()
}

/// Renders the styled error page for a 400: the matched tunnel exists
/// but is not an HTTP tunnel.
pub fn protocol_mismatch_page(host: &str) -> Response {
    let body = page(
        "Protocol Mismatch",
        "Not an HTTP tunnel",
        &format!(
            "<code>{}</code> is registered for a non-HTTP protocol and cannot serve this request.",
            escape(host)
        ),
    );
    (StatusCode::BAD_REQUEST, Html(body)).into_response()
}

/// Renders the styled error page for a connection-refused 502, including
/// both the public and local URLs as `spec.md` §8 scenario 3 requires.
pub fn connection_refused_page(public_url: &str, local_url: &str) -> Response {
    let body = page(
        "Bad Gateway",
        "Connection Refused",
        &format!(
            "The tunnel client for <code>{}</code> could not reach the local service at <code>{}</code>. Connection Refused.",
            escape(public_url),
            escape(local_url)
        ),
    );
    (StatusCode::BAD_GATEWAY, Html(body)).into_response()
}

pub fn rate_limited_page() -> Response {
    let body = page(
        "Too Many Requests",
        "Rate limit exceeded",
        "This tunnel has exceeded its configured request rate. Try again shortly.",
    );
    (StatusCode::TOO_MANY_REQUESTS, Html(body)).into_response()
}

pub fn timeout_page() -> Response {
    let body = page(
        "Gateway Timeout",
        "The tunnel client did not respond in time",
        "The request was forwarded to the tunnel client but no response arrived within the budget.",
    );
    (StatusCode::GATEWAY_TIMEOUT, Html(body)).into_response()
}

/// Generic fallback for any other `ErrorKind`, using its mapped status.
pub fn generic_error_page(kind: ErrorKind, message: &str) -> Response {
    let status = StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = page("Error", &format!("{kind}"), &escape(message));
    (status, Html(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_special_characters() {
        assert_eq!(escape("<script>"), "&lt;script&gt;");
    }
}
