//! Ingress surfaces
//!
//! Provides:
//! - Static TCP port forwarders
//! - A SOCKS5 server (CONNECT + UDP ASSOCIATE)
//! - An HTTP/HTTPS proxy (CONNECT + request forward)
//!
//! All three speak to the relay exclusively through the pool: assign a
//! connection id, register with any already-buffered "first frame"
//! bytes, wait for the relay's CONNECTED, then stream. The SOCKS5 and
//! HTTP surfaces share one listener and are told apart by the first
//! byte of the connection.

pub mod forward;
pub(crate) mod http;
pub(crate) mod socks5;
pub(crate) mod udp;

use crate::config::ProxyConfig;
use crate::pool::EchPool;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Deadline for finishing a proxy protocol handshake
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the TCP forwarder's initial client bytes
pub(crate) const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort window for capturing a SOCKS5 CONNECT first frame
/// (long enough for an immediately-following TLS ClientHello)
pub(crate) const SOCKS_FIRST_FRAME_TIMEOUT: Duration = Duration::from_millis(100);

/// Cap on a captured first frame
pub(crate) const FIRST_FRAME_LIMIT: usize = 32 * 1024;

/// TCP keepalive period applied to tunneled sockets
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Ingress errors
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("pool error: {0}")]
    Pool(#[from] crate::pool::PoolError),

    #[error("invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("remote connect timed out")]
    ConnectTimeout,
}

/// Proxy target address (SOCKS5 ATYP shapes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                write!(f, "[{}]:{}", std::net::Ipv6Addr::from(*ip), port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Whether an IO error is ordinary connection teardown (EOF, resets,
/// broken pipes) that should not be logged as a failure.
pub(crate) fn is_normal_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    ) || {
        let text = err.to_string();
        text.contains("use of closed network connection") || text.contains("normal closure")
    }
}

/// Tune an accepted ingress socket for bulk relaying: no Nagle,
/// keepalive, large kernel buffers.
pub(crate) fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "keepalive tuning failed");
    }
    if let Err(e) = sock.set_recv_buffer_size(crate::DATA_BUF_SIZE) {
        debug!(error = %e, "recv buffer tuning failed");
    }
    if let Err(e) = sock.set_send_buffer_size(crate::DATA_BUF_SIZE) {
        debug!(error = %e, "send buffer tuning failed");
    }
}

/// Read from the local socket and push everything into the pool until
/// EOF or error, then tear the logical connection down.
pub(crate) async fn pipe_upstream<R>(mut reader: R, pool: &EchPool, cid: &str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; crate::DATA_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = pool.send_data(cid, &buf[..n]).await {
                    debug!(cid, error = %e, "upstream send failed");
                    break;
                }
            }
            Err(e) => {
                if !is_normal_close(&e) {
                    debug!(cid, error = %e, "local read failed");
                }
                break;
            }
        }
    }
    pool.send_close(cid).await;
    pool.remove(cid);
}

/// Run the dual SOCKS5/HTTP proxy listener.
pub async fn run_proxy(cfg: ProxyConfig, pool: Arc<EchPool>) -> crate::Result<()> {
    let listener = TcpListener::bind(&cfg.listen).await.map_err(|e| {
        crate::Error::Config(format!("cannot listen on {}: {}", cfg.listen, e))
    })?;
    info!(listen = %cfg.listen, auth = cfg.auth.is_some(), "proxy listening (SOCKS5 + HTTP)");
    serve_proxy(listener, cfg.auth, pool).await
}

/// Accept loop of the dual proxy, over an already-bound listener.
pub async fn serve_proxy(
    listener: TcpListener,
    auth: Option<(String, String)>,
    pool: Arc<EchPool>,
) -> crate::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "proxy accept failed");
                continue;
            }
        };

        let auth = auth.clone();
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(e) = dispatch(stream, peer, auth, pool).await {
                debug!(%peer, error = %e, "proxy connection ended");
            }
        });
    }
}

/// Peek the first byte and hand the connection to the matching
/// protocol handler.
async fn dispatch(
    stream: TcpStream,
    peer: SocketAddr,
    auth: Option<(String, String)>,
    pool: Arc<EchPool>,
) -> Result<(), IngressError> {
    let mut first = [0u8; 1];
    let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.peek(&mut first))
        .await
        .map_err(|_| IngressError::BadRequest("timed out waiting for first byte".to_string()))??;
    if n == 0 {
        return Ok(());
    }

    match first[0] {
        0x05 => {
            debug!(%peer, "socks5 connection");
            socks5::handle(stream, peer, auth, pool).await
        }
        b'G' | b'P' | b'C' | b'H' | b'D' | b'O' => {
            debug!(%peer, "http connection");
            http::handle(stream, peer, auth, pool).await
        }
        other => {
            warn!(%peer, first_byte = other, "unknown ingress protocol");
            Ok(())
        }
    }
}
