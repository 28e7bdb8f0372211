//! Local HTTP delivery (`spec.md` §4.3 "Local delivery (HTTP)").
//!
//! Each `http_request` envelope is turned into a request against
//! `local_url + path + "?" + query`, executed with a 30 s timeout, and
//! answered with an `http_response` or a classified `http_error`.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;
use tunnel_protocol::message::Headers;
use tunnel_protocol::ErrorKind;

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Extensions and exact paths that must not be surfaced to the optional
/// request-event observer (`spec.md` §4.3): static-asset noise that would
/// otherwise drown out meaningful request events.
const STATIC_ASSET_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".map", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2",
    ".ttf", ".eot",
];
const STATIC_ASSET_PATHS: &[&str] = &["/favicon.ico", "/robots.txt"];

pub fn is_static_asset(path: &str) -> bool {
    if STATIC_ASSET_PATHS.contains(&path) {
        return true;
    }
    STATIC_ASSET_EXTENSIONS
        .iter()
        .any(|ext| path.ends_with(ext))
}

/// An optional observer for local HTTP delivery events. The core ships a
/// no-op default; a host application can supply its own to drive a
/// terminal UI or metrics sink.
pub trait RequestObserver: Send + Sync {
    fn on_request(&self, method: &str, path: &str, status: Option<u16>) {
        let _ = (method, path, status);
    }
}

pub struct NoopObserver;
impl RequestObserver for NoopObserver {}

pub struct LocalHttpResult {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

pub enum LocalHttpError {
    ConnectionRefused(String),
    Other(String),
}

impl LocalHttpError {
    pub fn into_envelope_parts(self) -> (ErrorKind, String) {
        match self {
            LocalHttpError::ConnectionRefused(msg) => (ErrorKind::ConnectionRefused, msg),
            LocalHttpError::Other(msg) => (ErrorKind::BadGateway, msg),
        }
    }
}

/// Executes one HTTP request against the local service.
pub async fn dial_http(
    client: &reqwest::Client,
    local_url: &str,
    method: &str,
    path: &str,
    query: &str,
    headers: &Headers,
    body: Vec<u8>,
    observer: &dyn RequestObserver,
) -> Result<LocalHttpResult, LocalHttpError> {
    let mut url = format!("{}{}", local_url.trim_end_matches('/'), path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let method = method
        .parse::<reqwest::Method>()
        .map_err(|e| LocalHttpError::Other(format!("invalid method: {e}")))?;

    let mut header_map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            header_map.insert(name, value);
        }
    }

    if !is_static_asset(path) {
        observer.on_request(method.as_str(), path, None);
    }

    let response = client
        .request(method.clone(), &url)
        .headers(header_map)
        .body(body)
        .timeout(LOCAL_DIAL_TIMEOUT)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(e))?;

    let status = response.status().as_u16();
    let mut out_headers = Headers::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            out_headers.insert(name.as_str().to_string(), v.to_string());
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| LocalHttpError::Other(e.to_string()))?
        .to_vec();

    if !is_static_asset(path) {
        observer.on_request(method.as_str(), path, Some(status));
    }
    debug!(%url, status, "local http dial complete");

    Ok(LocalHttpResult {
        status,
        headers: out_headers,
        body,
    })
}

fn classify_reqwest_error(e: reqwest::Error) -> LocalHttpError {
    if e.is_connect() {
        LocalHttpError::ConnectionRefused(e.to_string())
    } else {
        LocalHttpError::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_static_asset_paths_and_extensions() {
        assert!(is_static_asset("/favicon.ico"));
        assert!(is_static_asset("/assets/app.js"));
        assert!(is_static_asset("/img/logo.png"));
        assert!(!is_static_asset("/api/users"));
    }
}
