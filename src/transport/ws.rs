//! WebSocket dial over the ECH TLS stream
//!
//! The TCP connect, TLS handshake and WebSocket upgrade are done
//! explicitly (rather than through `connect_async`) so the TLS layer
//! can carry the ECH configuration and the TCP layer can honor an
//! operator-supplied IP override while SNI and `Host` stay on the URL
//! hostname.

use super::{build_ech_client_config, CarrierStream, RelayDialer, TransportError};
use crate::config::RelayConfig;
use crate::ech::EchCache;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{client_async_with_config, MaybeTlsStream};
use tracing::{debug, warn};

/// Covers TCP connect + TLS handshake + WebSocket upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before retrying after a suspected ECH key rotation
const ECH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Dialer that brings up one carrier: TCP → TLS 1.3 + ECH → WebSocket.
pub struct EchDialer {
    relay: RelayConfig,
    ech: Arc<EchCache>,
    max_retries: usize,
}

impl EchDialer {
    pub fn new(relay: RelayConfig, ech: Arc<EchCache>) -> Self {
        Self {
            relay,
            ech,
            max_retries: 3,
        }
    }

    async fn dial_once(&self) -> Result<CarrierStream, TransportError> {
        let ech_list = self.ech.get()?;
        let tls_config = build_ech_client_config(&ech_list)?;

        // The IP override redirects only the TCP connect; SNI (and the
        // encrypted inner SNI) remain on the relay hostname.
        let tcp = match self.relay.override_ip {
            Some(ip) => TcpStream::connect(SocketAddr::new(ip, self.relay.port)).await?,
            None => TcpStream::connect((self.relay.host.as_str(), self.relay.port)).await?,
        };
        tcp.set_nodelay(true)?;

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(self.relay.host.clone())
            .map_err(|e| TransportError::Tls(format!("invalid SNI: {}", e)))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let mut request = self
            .relay
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        if let Some(token) = &self.relay.token {
            // The relay authenticates on the subprotocol token
            let value = HeaderValue::from_str(token)
                .map_err(|e| TransportError::WebSocket(format!("bad token: {}", e)))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.write_buffer_size = crate::DATA_BUF_SIZE;

        let (ws, response) =
            client_async_with_config(request, MaybeTlsStream::Rustls(tls), Some(ws_config))
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        debug!(status = %response.status(), host = %self.relay.host, "carrier established");
        Ok(ws)
    }
}

#[async_trait]
impl RelayDialer for EchDialer {
    async fn dial(&self) -> Result<CarrierStream, TransportError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.dial_once()).await {
                Err(_) => return Err(TransportError::Timeout),
                Ok(Ok(ws)) => return Ok(ws),
                Ok(Err(e)) => {
                    if attempt < self.max_retries && is_ech_error(&e) {
                        warn!(
                            error = %e,
                            attempt,
                            max = self.max_retries,
                            "dial failed, refreshing ECH config and retrying"
                        );
                        self.ech.refresh().await;
                        tokio::time::sleep(ECH_RETRY_DELAY).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Heuristic for handshake failures caused by a stale/rejected ECH key
/// set, which are worth a discovery refresh before the next attempt.
fn is_ech_error(err: &TransportError) -> bool {
    let text = err.to_string();
    text.contains("ECH") || text.contains("ech")
}
