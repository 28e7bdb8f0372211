//! HTTP ingress dispatcher (`spec.md` §4.5).
//!
//! Virtual-host routing plus the WebSocket-upgrade passthrough, both
//! mounted as the fallback route on the same `axum::Router` the control
//! channel is served from (the teacher puts `/ws` and `/api/agents` on
//! one router the same way).

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use tunnel_protocol::message::{Envelope, Headers};
use tunnel_protocol::{ErrorKind, Protocol};

use crate::errors;
use crate::session::TunnelSession;
use crate::state::AppState;
use crate::tracker::TrackerOutcome;

const REQUEST_BUDGET: Duration = Duration::from_secs(120);
const HANDLER_READY_BUDGET: Duration = Duration::from_millis(500);
const MAX_BODY: usize = 10 * 1024 * 1024;
const FAILURE_THRESHOLD: u32 = 3;
const RECOVERY_THRESHOLD: u32 = 2;

/// The fallback handler mounted on every host/path not otherwise routed.
pub async fn dispatch(State(state): State<AppState>, mut req: Request) -> Response {
    let host_header = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let host = strip_port(&host_header).to_string();

    if host.is_empty() {
        return errors::not_found_page(&host_header);
    }

    let session = match resolve_session(&state, &host).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    if session.protocol != Protocol::Http {
        return errors::protocol_mismatch_page(&host);
    }

    let deadline = tokio::time::Instant::now() + HANDLER_READY_BUDGET;
    while !session.is_handler_ready() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    if !state.rate_limiter.check(session.id, session.per_minute, session.per_day) {
        return errors::rate_limited_page();
    }

    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let header_map = to_single_valued_headers(&req);

    if is_websocket_upgrade(&req) {
        let sec_ws_key = req
            .headers()
            .get("sec-websocket-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        return handle_websocket_passthrough(session, on_upgrade, &host, path, query, header_map, sec_ws_key).await;
    }

    let method = req.method().to_string();

    let body = req.into_body();
    let body_bytes = match to_bytes(body, MAX_BODY).await {
        Ok(b) => b.to_vec(),
        Err(_) => {
            return errors::generic_error_page(ErrorKind::Validation, "request body too large");
        }
    };

    forward_request(&state, &session, &host, method, path, query, header_map, body_bytes).await
}

async fn resolve_session(state: &AppState, host: &str) -> Result<Arc<TunnelSession>, Response> {
    if let Some(session) = state.find_session_by_host(host).await {
        if session.is_alive() {
            return Ok(session);
        }
        return Err(errors::endpoint_offline_page(host));
    }

    let known = state
        .registry
        .get_by_subdomain(host)
        .await
        .or(state.registry.get_by_custom_domain(host).await);
    match known {
        Some(_) => Err(errors::endpoint_offline_page(host)),
        None => Err(errors::not_found_page(host)),
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_request(
    state: &AppState,
    session: &Arc<TunnelSession>,
    host: &str,
    method: String,
    path: String,
    query: String,
    headers: Headers,
    body: Vec<u8>,
) -> Response {
    let request_id = Uuid::new_v4();
    let rx = match state.tracker.register(request_id, REQUEST_BUDGET) {
        Ok(rx) => rx,
        Err(_) => return errors::generic_error_page(ErrorKind::Internal, "duplicate request id"),
    };

    let envelope = Envelope::HttpRequest {
        request_id: request_id.to_string(),
        method: method.clone(),
        path: path.clone(),
        query,
        headers,
        body,
    };

    if session.send(envelope).await.is_err() {
        state.tracker.cancel(request_id);
        return errors::endpoint_offline_page(host);
    }

    let local_url = session.local_url.read().await.clone();
    let outcome = state.tracker.wait(request_id, rx, REQUEST_BUDGET).await;
    state
        .request_log
        .log_http_request(session.id, &method, &path, status_of(&outcome));

    match outcome {
        TrackerOutcome::Response(resp) => {
            state.registry.update_activity(session.id, 1).await;
            state
                .stats
                .record_request(session.id, Protocol::Http, resp.status, 0);
            build_response(host, resp)
        }
        TrackerOutcome::Error { kind, message } => {
            if kind == ErrorKind::ConnectionRefused {
                errors::connection_refused_page(&public_authority(host), &local_url)
            } else {
                errors::generic_error_page(kind, &message)
            }
        }
        TrackerOutcome::Timeout => errors::timeout_page(),
        TrackerOutcome::Cancelled => errors::endpoint_offline_page(host),
    }
}

fn status_of(outcome: &TrackerOutcome) -> u16 {
    match outcome {
        TrackerOutcome::Response(r) => r.status,
        TrackerOutcome::Error { kind, .. } => kind.http_status(),
        TrackerOutcome::Timeout => 504,
        TrackerOutcome::Cancelled => 503,
    }
}

fn build_response(host: &str, resp: crate::tracker::HttpResponse) -> Response {
    let public_authority = public_authority(host);
    let is_html = resp
        .headers
        .get("content-type")
        .map(|v| v.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false);

    let body = if is_html {
        rewrite_html_body(&resp.body, &public_authority)
    } else {
        resp.body
    };

    let mut builder = Response::builder().status(
        StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );

    for (name, value) in resp.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" {
            continue;
        }
        if lower == "content-security-policy" && is_html {
            continue;
        }
        let rewritten;
        let value = if lower == "location" {
            rewritten = rewrite_location(value, &public_authority);
            rewritten.as_deref().unwrap_or(value)
        } else {
            value.as_str()
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }

    if is_html {
        builder = builder.header(
            "content-security-policy",
            "default-src 'self' 'unsafe-inline' 'unsafe-eval' data: blob: https: wss:",
        );
    }

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| errors::generic_error_page(ErrorKind::Internal, "response build failed"))
}

fn public_authority(host: &str) -> String {
    format!("http://{host}")
}

/// Rewrites `Location` headers whose authority is `localhost` or
/// `127.0.0.1` (any port) to the tunnel's public authority, preserving
/// path/query/fragment; external authorities pass through unchanged.
fn rewrite_location(value: &str, public_authority: &str) -> Option<String> {
    let mut url = url::Url::parse(value).ok()?;
    let host = url.host_str()?;
    if host != "localhost" && host != "127.0.0.1" {
        return None;
    }
    let (scheme, authority) = public_authority.split_once("://").unwrap_or(("http", public_authority));
    url.set_scheme(scheme).ok()?;
    url.set_host(Some(authority)).ok()?;
    url.set_port(None).ok();
    Some(url.to_string())
}

const LOCAL_PREFIXES: [&str; 4] = [
    "http://localhost:",
    "https://localhost:",
    "http://127.0.0.1:",
    "https://127.0.0.1:",
];

/// Substitutes `http(s)://localhost:PORT` / `127.0.0.1:PORT` occurrences
/// in an HTML body with the tunnel's public authority and injects the
/// reconnect-monitor script before `</body>`.
fn rewrite_html_body(body: &[u8], public_authority: &str) -> Vec<u8> {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(_) => return body.to_vec(),
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'outer: while !rest.is_empty() {
        for prefix in LOCAL_PREFIXES {
            if let Some(tail) = rest.strip_prefix(prefix) {
                let digits = tail.bytes().take_while(|b| b.is_ascii_digit()).count();
                out.push_str(public_authority);
                rest = &tail[digits..];
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        out.push(chars.next().expect("rest is non-empty"));
        rest = chars.as_str();
    }

    inject_monitor_script(out).into_bytes()
}

fn inject_monitor_script(html: String) -> String {
    let script = monitor_script();
    match html.rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + script.len());
            out.push_str(&html[..idx]);
            out.push_str(script);
            out.push_str(&html[idx..]);
            out
        }
        None => format!("{html}{script}"),
    }
}

/// Polls the current URL and reloads once, on recovery after an outage —
/// never while the endpoint is still down (`spec.md` §4.5: "reloads on
/// recovery after repeated failures").
fn monitor_script() -> String {
    format!(
        r#"<script>
(function() {{
  var failures = 0, successes = 0, wasDown = false;
  setInterval(function() {{
    fetch(window.location.href, {{ method: "HEAD", cache: "no-store" }})
      .then(function(r) {{
        if (r.ok) {{
          failures = 0;
          successes++;
          if (wasDown && successes >= {recovery}) {{ window.location.reload(); }}
        }} else {{
          successes = 0;
          failures++;
          if (failures >= {failure}) {{ wasDown = true; }}
        }}
      }})
      .catch(function() {{
        successes = 0;
        failures++;
        if (failures >= {failure}) {{ wasDown = true; }}
      }});
  }}, 5000);
}})();
</script>"#,
        recovery = RECOVERY_THRESHOLD,
        failure = FAILURE_THRESHOLD
    )
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

fn to_single_valued_headers(req: &Request) -> Headers {
    let mut map = Headers::new();
    for (name, value) in req.headers().iter() {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_string(), v.to_string());
        }
    }
    map
}

fn is_websocket_upgrade(req: &Request) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_is_websocket = req
        .headers()
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers that must not be forwarded verbatim to the local service's own
/// WebSocket dial: connection-management fields plus the public side's own
/// handshake fields, since the client performs an independent handshake of
/// its own against `local_url` (`spec.md` §4.5 "forwarded headers minus
/// hop-by-hop").
const HOP_BY_HOP_HEADERS: [&str; 13] = [
    "connection",
    "upgrade",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

fn strip_hop_by_hop(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// `Sec-WebSocket-Accept` per RFC 6455 §1.3: base64(SHA-1(key + GUID)).
fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Completes a real RFC 6455 handshake on the public side, then tells the
/// client to dial `local_url + path ± query` as its own independent
/// WebSocket client handshake (`spec.md` §4.5). Once both handshakes have
/// completed, frames are opaque bytes relayed as `tcp_data` — the
/// multiplexing engine has no separate data-carrying WebSocket frame tag,
/// so post-handshake bytes are pumped exactly like a TCP/TLS stream
/// ("pump frames bidirectionally until either side closes").
#[allow(clippy::too_many_arguments)]
async fn handle_websocket_passthrough(
    session: Arc<TunnelSession>,
    on_upgrade: Option<OnUpgrade>,
    host: &str,
    path: String,
    query: String,
    headers: Headers,
    sec_ws_key: Option<String>,
) -> Response {
    let Some(on_upgrade) = on_upgrade else {
        return errors::generic_error_page(ErrorKind::BadGateway, "connection is not upgradable");
    };
    let Some(sec_ws_key) = sec_ws_key else {
        return errors::generic_error_page(ErrorKind::Validation, "missing Sec-WebSocket-Key");
    };

    let stream_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    session.tcp_streams.register(stream_id.clone(), tx);

    if session
        .send(Envelope::WsOpen {
            stream_id: stream_id.clone(),
            path,
            query,
            headers: strip_hop_by_hop(&headers),
        })
        .await
        .is_err()
    {
        session.tcp_streams.remove(&stream_id);
        return errors::endpoint_offline_page(host);
    }

    let session_for_pump = session.clone();
    let stream_id_for_pump = stream_id.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                pump_upgraded(io, session_for_pump, stream_id_for_pump, rx).await;
            }
            Err(e) => {
                warn!(error = %e, "websocket upgrade failed");
                session_for_pump.tcp_streams.remove(&stream_id_for_pump);
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(axum::http::header::CONNECTION, "upgrade")
        .header(axum::http::header::UPGRADE, "websocket")
        .header("sec-websocket-accept", compute_accept_key(&sec_ws_key))
        .body(Body::empty())
        .unwrap_or_else(|_| errors::generic_error_page(ErrorKind::Internal, "upgrade response failed"))
}

async fn pump_upgraded(
    io: TokioIo<hyper::upgrade::Upgraded>,
    session: Arc<TunnelSession>,
    stream_id: String,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut read_half, mut write_half) = tokio::io::split(io);

    let reader_session = session.clone();
    let reader_stream_id = stream_id.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = Envelope::TcpData {
                        stream_id: reader_stream_id.clone(),
                        data: buf[..n].to_vec(),
                    };
                    if reader_session.send(data).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = reader_session
            .send(Envelope::TcpError {
                stream_id: reader_stream_id.clone(),
                error: ErrorKind::Internal,
                message: "connection_closed".into(),
            })
            .await;
        reader_session.tcp_streams.remove(&reader_stream_id);
        debug!(stream_id = %reader_stream_id, "websocket passthrough stream closed");
    });

    while let Some(chunk) = rx.recv().await {
        if write_half.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    let _ = reader.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 §1.3's own worked example.
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn strip_hop_by_hop_drops_connection_management_and_handshake_headers() {
        let mut headers = Headers::new();
        headers.insert("connection".into(), "upgrade".into());
        headers.insert("upgrade".into(), "websocket".into());
        headers.insert("host".into(), "example.test".into());
        headers.insert("sec-websocket-key".into(), "abc".into());
        headers.insert("sec-websocket-version".into(), "13".into());
        headers.insert("cookie".into(), "session=1".into());
        headers.insert("authorization".into(), "Bearer xyz".into());

        let stripped = strip_hop_by_hop(&headers);
        assert_eq!(stripped.len(), 2);
        assert_eq!(stripped.get("cookie").map(String::as_str), Some("session=1"));
        assert_eq!(stripped.get("authorization").map(String::as_str), Some("Bearer xyz"));
    }
}
