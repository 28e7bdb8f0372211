//! Local TCP/TLS delivery (`spec.md` §4.3 "Local delivery (TCP/TLS)").
//!
//! On the first envelope for a new stream id (empty payload = "open"),
//! dials the local address — plain for `tcp`, with certificate
//! verification skipped for `tls` per the documented policy — and stores
//! the write side under the stream id. A reader task pumps local→server
//! in 4 KiB chunks; on EOF or error it emits a `connection_closed` error
//! envelope and tears the stream down.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use tunnel_protocol::message::{Envelope, Headers};
use tunnel_protocol::{ErrorKind, Protocol};

use crate::session::ClientSession;

const CHUNK_SIZE: usize = 4096;

/// Certificate verifier that accepts anything, per `spec.md` §4.3's
/// documented policy of skipping certificate verification for local TLS
/// dials (the local service is reached over loopback/private network;
/// the public side never sees this connection).
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
        ]
    }
}

fn insecure_tls_connector() -> tokio_rustls::TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Dials the local address and spawns reader/writer tasks for one
/// TCP/TLS stream, returning the channel subsequent `tcp_data`/`tls_data`
/// envelopes should be forwarded through.
pub async fn open_stream(
    session: Arc<ClientSession>,
    protocol: Protocol,
    stream_id: String,
) -> std::io::Result<mpsc::UnboundedSender<Vec<u8>>> {
    let local_addr = session.config.local_url.clone();
    let tcp = TcpStream::connect(&local_addr).await?;
    tcp.set_nodelay(true).ok();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    if protocol == Protocol::Tls {
        let connector = insecure_tls_connector();
        let host = local_addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(&local_addr)
            .to_string();
        let server_name = rustls_pki_types::ServerName::try_from(host)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
            .to_owned();
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let (mut read_half, mut write_half) = tokio::io::split(tls_stream);

        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let sid = stream_id.clone();
        let sess = session.clone();
        tokio::spawn(async move {
            pump_local_to_server(&mut read_half, &sess, &sid, true).await;
        });
    } else {
        let (mut read_half, mut write_half) = tokio::io::split(tcp);

        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let sid = stream_id.clone();
        let sess = session.clone();
        tokio::spawn(async move {
            pump_local_to_server(&mut read_half, &sess, &sid, false).await;
        });
    }

    Ok(tx)
}

/// Dials the local service's own WebSocket endpoint for a passthrough
/// stream (`spec.md` §4.5): `local_url` is a URL here (the HTTP-tunnel
/// data model), not a `host:port` pair, so it's parsed rather than used
/// directly as a connect address. Performs a fresh client-side handshake
/// to `path ± query` carrying the forwarded headers, independent of the
/// public side's own already-completed handshake; once the local 101
/// response is seen, the rest of the connection is pumped as raw
/// `tcp_data` bytes the same way `open_stream` pumps a plain TCP stream.
pub async fn open_ws_stream(
    session: Arc<ClientSession>,
    stream_id: String,
    path: String,
    query: String,
    headers: Headers,
) -> std::io::Result<mpsc::UnboundedSender<Vec<u8>>> {
    let url = url::Url::parse(&session.config.local_url)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let host = url
        .host_str()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "local_url has no host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "local_url has no resolvable port"))?;
    let is_tls = url.scheme() == "https";

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    tcp.set_nodelay(true).ok();

    let target = if query.is_empty() { path } else { format!("{path}?{query}") };
    let ws_key = BASE64.encode(Uuid::new_v4().as_bytes());
    let mut request = format!(
        "GET {target} HTTP/1.1\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {ws_key}\r\n"
    );
    for (name, value) in &headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    if is_tls {
        let connector = insecure_tls_connector();
        let server_name = rustls_pki_types::ServerName::try_from(host)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
            .to_owned();
        let mut tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        tls_stream.write_all(request.as_bytes()).await?;
        let leftover = read_handshake_response(&mut tls_stream).await?;
        let (mut read_half, mut write_half) = tokio::io::split(tls_stream);

        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let sid = stream_id.clone();
        let sess = session.clone();
        tokio::spawn(async move {
            if !leftover.is_empty() && sess.send(Envelope::TcpData { stream_id: sid.clone(), data: leftover }).await.is_err() {
                return;
            }
            pump_local_to_server(&mut read_half, &sess, &sid, false).await;
        });
    } else {
        let mut tcp = tcp;
        tcp.write_all(request.as_bytes()).await?;
        let leftover = read_handshake_response(&mut tcp).await?;
        let (mut read_half, mut write_half) = tokio::io::split(tcp);

        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let sid = stream_id.clone();
        let sess = session.clone();
        tokio::spawn(async move {
            if !leftover.is_empty() && sess.send(Envelope::TcpData { stream_id: sid.clone(), data: leftover }).await.is_err() {
                return;
            }
            pump_local_to_server(&mut read_half, &sess, &sid, false).await;
        });
    }

    Ok(tx)
}

/// Reads until the blank line ending the handshake response, verifies a
/// `101` status, and returns any bytes read past the blank line so they
/// aren't lost if the local server pipelined data right after its
/// handshake response.
async fn read_handshake_response<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_subslice(&collected, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "local server closed before websocket handshake completed",
            ));
        }
        collected.extend_from_slice(&buf[..n]);
    };

    let status_line = String::from_utf8_lossy(&collected[..header_end]);
    let status_line = status_line.lines().next().unwrap_or("");
    if !status_line.contains(" 101") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("local websocket handshake rejected: {status_line}"),
        ));
    }

    Ok(collected[header_end..].to_vec())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn pump_local_to_server<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    session: &Arc<ClientSession>,
    stream_id: &str,
    is_tls: bool,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(stream_id, "local connection closed (EOF)");
                let _ = session.send(close_envelope(is_tls, stream_id)).await;
                session.remove_stream(stream_id).await;
                return;
            }
            Ok(n) => {
                let env = if is_tls {
                    Envelope::TlsData {
                        stream_id: stream_id.to_string(),
                        data: buf[..n].to_vec(),
                    }
                } else {
                    Envelope::TcpData {
                        stream_id: stream_id.to_string(),
                        data: buf[..n].to_vec(),
                    }
                };
                if session.send(env).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(stream_id, "local read error: {e}");
                let _ = session.send(close_envelope(is_tls, stream_id)).await;
                session.remove_stream(stream_id).await;
                return;
            }
        }
    }
}

fn close_envelope(is_tls: bool, stream_id: &str) -> Envelope {
    if is_tls {
        Envelope::TlsError {
            stream_id: stream_id.to_string(),
            error: ErrorKind::Internal,
            message: "connection_closed".into(),
        }
    } else {
        Envelope::TcpError {
            stream_id: stream_id.to_string(),
            error: ErrorKind::Internal,
            message: "connection_closed".into(),
        }
    }
}
