//! Carrier transport
//!
//! A carrier is a WebSocket connection to the relay, always carried
//! over TLS 1.3 with Encrypted Client Hello. The pool does not dial
//! sockets itself; it goes through the [`RelayDialer`] trait so tests
//! can hand it carriers over plain TCP while production always uses
//! the ECH dialer.

mod tls;
mod ws;

pub use tls::build_ech_client_config;
pub use ws::EchDialer;

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// The concrete stream type carriers run on
pub type CarrierStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("ECH error: {0}")]
    Ech(#[from] crate::ech::EchError),

    #[error("handshake timed out")]
    Timeout,
}

/// Dials one new carrier to the relay.
#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self) -> Result<CarrierStream, TransportError>;
}
