//! HTTP/HTTPS proxy ingress
//!
//! CONNECT requests become plain tunnels. Anything else is treated as
//! a proxied HTTP/1.1 request: the absolute URI is rewritten to a
//! relative one, proxy-specific headers are stripped, and the rebuilt
//! request (plus up to 10 MiB of body) rides to the relay as the OPEN
//! frame's first-frame bytes, so the origin sees a normal request with
//! no extra round trip.

use super::{pipe_upstream, tune_socket, IngressError, HANDSHAKE_TIMEOUT};
use crate::pool::{wait_connected, EchPool, SharedWriter, CONNECT_TIMEOUT};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Cap on a request body shipped inside the first frame
const MAX_BODY: usize = 10 * 1024 * 1024;

const RESPONSE_200: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_407: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n";
const RESPONSE_504: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";

/// A parsed request head: request line pieces plus ordered headers.
struct RequestHead {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Exact-key lookup (header keys are kept as received).
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Handle one HTTP proxy connection.
pub(crate) async fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    auth: Option<(String, String)>,
    pool: Arc<EchPool>,
) -> Result<(), IngressError> {
    tune_socket(&stream);
    let (read_half, write_half) = stream.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut reader = BufReader::new(read_half);

    let head = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_head(&mut reader)).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            write_response(&writer, RESPONSE_400).await;
            return Err(e);
        }
        Err(_) => {
            return Err(IngressError::BadRequest(
                "request head timed out".to_string(),
            ))
        }
    };

    if let Some((user, pass)) = &auth {
        let authorized = head
            .get("Proxy-Authorization")
            .map(|value| validate_basic(value, user, pass))
            .unwrap_or(false);
        if !authorized {
            warn!(%peer, "proxy authentication failed");
            write_response(&writer, RESPONSE_407).await;
            return Err(IngressError::AuthenticationFailed);
        }
    }

    if head.method == "CONNECT" {
        info!(%peer, target = %head.uri, "http CONNECT");
        handle_connect(reader, writer, head.uri, pool).await
    } else {
        info!(%peer, method = %head.method, uri = %head.uri, "http forward");
        handle_forward(reader, writer, head, pool).await
    }
}

/// Read the request line and headers up to the first empty line.
async fn read_head(reader: &mut BufReader<OwnedReadHalf>) -> Result<RequestHead, IngressError> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Err(IngressError::BadRequest("empty request".to_string()));
    }

    let mut parts = request_line.trim().splitn(3, ' ');
    let (method, uri, _version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) if !m.is_empty() && !u.is_empty() && !v.is_empty() => {
            (m.to_string(), u.to_string(), v)
        }
        _ => {
            return Err(IngressError::BadRequest(format!(
                "bad request line: {}",
                request_line.trim()
            )))
        }
    };

    // Keys stay case-sensitive as received; a repeated key overwrites
    // the earlier value.
    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(IngressError::BadRequest(
                "connection closed inside headers".to_string(),
            ));
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            match headers.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => headers.push((key, value)),
            }
        }
    }

    Ok(RequestHead {
        method,
        uri,
        headers,
    })
}

/// CONNECT: the URI is `host:port`; open the tunnel and pipe raw bytes.
async fn handle_connect(
    reader: BufReader<OwnedReadHalf>,
    writer: SharedWriter,
    target: String,
    pool: Arc<EchPool>,
) -> Result<(), IngressError> {
    let cid = Uuid::new_v4().to_string();

    let signal = match pool
        .register_and_claim(&cid, &target, &[], Arc::clone(&writer))
        .await
    {
        Ok(signal) => signal,
        Err(e) => {
            warn!(%cid, %target, error = %e, "CONNECT rejected");
            write_response(&writer, RESPONSE_504).await;
            return Err(e.into());
        }
    };

    if !wait_connected(signal, CONNECT_TIMEOUT).await {
        warn!(%cid, %target, "CONNECT timed out");
        pool.send_close(&cid).await;
        pool.remove(&cid);
        write_response(&writer, RESPONSE_504).await;
        return Err(IngressError::ConnectTimeout);
    }

    write_response(&writer, RESPONSE_200).await;
    drop(writer);

    pipe_upstream(reader, &pool, &cid).await;
    Ok(())
}

/// Plain request: rebuild it origin-style and send it as the first
/// frame; the origin's response flows back over the same socket.
async fn handle_forward(
    mut reader: BufReader<OwnedReadHalf>,
    writer: SharedWriter,
    head: RequestHead,
    pool: Arc<EchPool>,
) -> Result<(), IngressError> {
    let url = match Url::parse(&head.uri) {
        Ok(url) => url,
        Err(e) => {
            write_response(&writer, RESPONSE_400).await;
            return Err(IngressError::BadRequest(format!(
                "bad request URI '{}': {}",
                head.uri, e
            )));
        }
    };

    // Body travels with the rebuilt head when it is small enough;
    // anything larger (or chunked) streams through the pipe loop.
    let body_len = head
        .get("Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = Vec::new();
    if body_len > 0 && body_len <= MAX_BODY {
        body.resize(body_len, 0);
        if let Err(e) = reader.read_exact(&mut body).await {
            write_response(&writer, RESPONSE_400).await;
            return Err(e.into());
        }
    }

    let (target, first_frame) = match assemble_forward(&head, &url, &body) {
        Ok(assembled) => assembled,
        Err(e) => {
            write_response(&writer, RESPONSE_400).await;
            return Err(e);
        }
    };

    let cid = Uuid::new_v4().to_string();
    let signal = match pool
        .register_and_claim(&cid, &target, &first_frame, Arc::clone(&writer))
        .await
    {
        Ok(signal) => signal,
        Err(e) => {
            warn!(%cid, %target, error = %e, "forward rejected");
            write_response(&writer, RESPONSE_504).await;
            return Err(e.into());
        }
    };

    if !wait_connected(signal, CONNECT_TIMEOUT).await {
        warn!(%cid, %target, "forward connect timed out");
        pool.send_close(&cid).await;
        pool.remove(&cid);
        write_response(&writer, RESPONSE_504).await;
        return Err(IngressError::ConnectTimeout);
    }

    debug!(%cid, %target, "request forwarded");
    drop(writer);

    // Any extra client bytes (pipelined requests, streamed bodies)
    // keep flowing to the same origin connection.
    pipe_upstream(reader, &pool, &cid).await;
    Ok(())
}

/// Rebuild a proxied request as an origin-form HTTP/1.1 request and
/// resolve the target `host:port`.
fn assemble_forward(
    head: &RequestHead,
    url: &Url,
    body: &[u8],
) -> Result<(String, Vec<u8>), IngressError> {
    let host = url
        .host_str()
        .ok_or_else(|| IngressError::BadRequest("request URI has no host".to_string()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
    let target = format!("{}:{}", host, port);

    let mut path = url.path().to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    if let Some(query) = url.query() {
        path = format!("{}?{}", path, query);
    }

    let mut request = format!("{} {} HTTP/1.1\r\n", head.method, path);
    for (key, value) in &head.headers {
        if key.eq_ignore_ascii_case("Proxy-Authorization")
            || key.eq_ignore_ascii_case("Proxy-Connection")
        {
            continue;
        }
        request.push_str(key);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    if !head
        .headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("Host"))
    {
        // The URI's authority (including any explicit port) becomes
        // the Host header.
        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        request.push_str("Host: ");
        request.push_str(&host_header);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    let mut first_frame = request.into_bytes();
    first_frame.extend_from_slice(body);
    Ok((target, first_frame))
}

/// Byte-exact check of a `Proxy-Authorization: Basic <base64>` value.
fn validate_basic(value: &str, user: &str, pass: &str) -> bool {
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    decoded == format!("{}:{}", user, pass).into_bytes()
}

async fn write_response(writer: &SharedWriter, response: &[u8]) {
    let _ = writer.lock().await.write_all(response).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: &str, uri: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_assemble_strips_proxy_headers_and_relativizes() {
        let head = head(
            "GET",
            "http://h/p?q",
            &[("Host", "h"), ("Proxy-Authorization", "Basic Zm9vOmJhcg==")],
        );
        let url = Url::parse(&head.uri).unwrap();

        let (target, first_frame) = assemble_forward(&head, &url, &[]).unwrap();
        assert_eq!(target, "h:80");
        assert_eq!(
            first_frame,
            b"GET /p?q HTTP/1.1\r\nHost: h\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_assemble_adds_missing_host() {
        let head = head("GET", "http://example.com:8080/x", &[("Accept", "*/*")]);
        let url = Url::parse(&head.uri).unwrap();

        let (target, first_frame) = assemble_forward(&head, &url, &[]).unwrap();
        assert_eq!(target, "example.com:8080");
        let text = String::from_utf8(first_frame).unwrap();
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
    }

    #[test]
    fn test_assemble_https_default_port() {
        let head = head("GET", "https://secure.example.com/", &[]);
        let url = Url::parse(&head.uri).unwrap();
        let (target, _) = assemble_forward(&head, &url, &[]).unwrap();
        assert_eq!(target, "secure.example.com:443");
    }

    #[test]
    fn test_assemble_appends_body() {
        let head = head(
            "POST",
            "http://h/submit",
            &[("Host", "h"), ("Content-Length", "4")],
        );
        let url = Url::parse(&head.uri).unwrap();
        let (_, first_frame) = assemble_forward(&head, &url, b"ping").unwrap();
        assert!(first_frame.ends_with(b"\r\n\r\nping"));
    }

    #[test]
    fn test_assemble_strips_proxy_connection() {
        let head = head(
            "GET",
            "http://h/",
            &[("Proxy-Connection", "keep-alive"), ("Host", "h")],
        );
        let url = Url::parse(&head.uri).unwrap();
        let (_, first_frame) = assemble_forward(&head, &url, &[]).unwrap();
        let text = String::from_utf8(first_frame).unwrap();
        assert!(!text.contains("Proxy-Connection"));
    }

    #[test]
    fn test_validate_basic() {
        // foo:bar
        assert!(validate_basic("Basic Zm9vOmJhcg==", "foo", "bar"));
        assert!(!validate_basic("Basic Zm9vOmJhcg==", "foo", "baz"));
        assert!(!validate_basic("Bearer Zm9vOmJhcg==", "foo", "bar"));
        assert!(!validate_basic("Basic not-base64!!", "foo", "bar"));
    }
}
