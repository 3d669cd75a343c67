//! # ECH Tunnel
//!
//! A client-side tunneling proxy that multiplexes TCP (and
//! SOCKS5-associated UDP) traffic over a fixed-size pool of long-lived
//! WebSocket connections, always carried over TLS 1.3 with Encrypted
//! Client Hello. Plaintext or downgraded TLS is never used.
//!
//! ## Features
//!
//! - **ECH-only transport**: the relay's `ECHConfigList` is discovered
//!   from DNS HTTPS records (DoH first, UDP DNS fallback) and a server
//!   that rejects ECH aborts the dial instead of falling back
//! - **Carrier pool**: many logical connections share a handful of
//!   WebSocket channels, with transparent rebinding when a carrier dies
//! - **Three ingress surfaces**: static TCP port forwarding, SOCKS5
//!   (CONNECT + UDP ASSOCIATE), and an HTTP/HTTPS proxy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Ingress Layer                      │
//! │       (TCP forwarder, SOCKS5, HTTP proxy)            │
//! ├─────────────────────────────────────────────────────┤
//! │                    ECH Pool                          │
//! │   (registry, carrier selection, frame mux/demux)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Frame Protocol                      │
//! │        (opcode + connection id + payload)            │
//! ├─────────────────────────────────────────────────────┤
//! │                 Carrier Transport                    │
//! │        (WebSocket over TLS 1.3 + ECH)                │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod ech;
pub mod ingress;
pub mod pool;
pub mod transport;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default carrier pool size
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Large data buffer size (streaming reads, socket buffers)
pub const DATA_BUF_SIZE: usize = 1024 * 1024;

/// Small buffer size for protocol headers
pub const HEADER_BUF_SIZE: usize = 4096;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ECH error: {0}")]
    Ech(#[from] ech::EchError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Ingress error: {0}")]
    Ingress(#[from] ingress::IngressError),

    #[error("Configuration error: {0}")]
    Config(String),
}
