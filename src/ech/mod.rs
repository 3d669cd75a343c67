//! ECH bootstrap
//!
//! Before the first carrier can be dialed, the relay host's
//! `ECHConfigList` has to be discovered out-of-band. It is published in
//! the DNS HTTPS (type 65) record of a designated domain, under
//! SvcParamKey 5. Discovery goes through DNS-over-HTTPS first (which
//! survives networks that intercept port 53) and falls back to plain
//! UDP DNS.
//!
//! The cached list is process-wide, read-mostly state: the dialer reads
//! it for every carrier handshake, and it is only rewritten by the
//! initial preparation or an explicit refresh after a suspected key
//! rotation.

mod dns;

pub use dns::{build_query, parse_response, TYPE_HTTPS};

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// DoH request timeout
const DOH_TIMEOUT: Duration = Duration::from_secs(5);
/// UDP DNS query timeout
const UDP_DNS_TIMEOUT: Duration = Duration::from_secs(2);
/// Sleep between failed discovery rounds
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// ECH discovery errors
#[derive(Debug, Error)]
pub enum EchError {
    #[error("ECH config list not prepared yet")]
    NotPrepared,

    #[error("DoH query failed: {0}")]
    Doh(String),

    #[error("DNS query failed: {0}")]
    Dns(String),

    #[error("no HTTPS record with an ech SvcParam found")]
    NoEchParam,

    #[error("malformed DNS response: {0}")]
    Malformed(String),
}

/// Process-wide cache of the relay's `ECHConfigList`, plus the
/// resolver settings used to (re)populate it.
pub struct EchCache {
    /// Domain whose HTTPS RR carries the ECH config
    domain: String,
    /// DoH endpoint (wireformat POST)
    doh_url: String,
    /// Fallback UDP DNS server (`host:port`)
    dns_server: String,
    /// The cached list; non-empty once prepared
    list: RwLock<Option<Bytes>>,
}

impl EchCache {
    pub fn new(domain: String, doh_url: String, dns_server: String) -> Self {
        Self {
            domain,
            doh_url,
            dns_server,
            list: RwLock::new(None),
        }
    }

    /// Fetch and cache the `ECHConfigList`, retrying until it succeeds.
    ///
    /// Every round tries DoH first and falls back to UDP DNS; an empty
    /// or unparseable answer sleeps and retries. This only returns once
    /// a non-empty list is cached, so callers can treat a completed
    /// `prepare` as a hard guarantee that ECH material is available.
    pub async fn prepare(&self) {
        loop {
            match self.lookup().await {
                Ok(raw) if !raw.is_empty() => {
                    info!(
                        domain = %self.domain,
                        len = raw.len(),
                        "cached ECHConfigList"
                    );
                    *self.list.write().expect("ech cache lock poisoned") = Some(Bytes::from(raw));
                    return;
                }
                Ok(_) => {
                    warn!(domain = %self.domain, "HTTPS record carried an empty ech value, retrying");
                }
                Err(e) => {
                    warn!(domain = %self.domain, error = %e, "ECH discovery failed, retrying");
                }
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    /// Re-run discovery; used by the dialer when a handshake error
    /// looks ECH-related (key rotation on the server side).
    pub async fn refresh(&self) {
        info!(domain = %self.domain, "refreshing ECHConfigList");
        self.prepare().await;
    }

    /// Read the cached list. Fails if `prepare` has never completed —
    /// dialing without ECH material is never allowed.
    pub fn get(&self) -> Result<Bytes, EchError> {
        self.list
            .read()
            .expect("ech cache lock poisoned")
            .clone()
            .ok_or(EchError::NotPrepared)
    }

    /// One discovery round: DoH, then UDP DNS.
    async fn lookup(&self) -> Result<Vec<u8>, EchError> {
        let query = build_query(&self.domain, TYPE_HTTPS);

        match self.query_doh(&query).await {
            Ok(raw) => return Ok(raw),
            Err(e) => {
                debug!(error = %e, "DoH lookup failed, falling back to UDP DNS");
            }
        }

        self.query_udp(&query).await
    }

    /// DNS wireformat over HTTPS POST (RFC 8484).
    async fn query_doh(&self, query: &[u8]) -> Result<Vec<u8>, EchError> {
        // DoH must not loop back through the proxy we are part of.
        let client = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|e| EchError::Doh(e.to_string()))?;

        let response = client
            .post(&self.doh_url)
            .header(CONTENT_TYPE, "application/dns-message")
            .header(ACCEPT, "application/dns-message")
            .body(query.to_vec())
            .send()
            .await
            .map_err(|e| EchError::Doh(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EchError::Doh(format!(
                "server returned status {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| EchError::Doh(e.to_string()))?;

        parse_response(&body)
    }

    /// Plain UDP DNS query against the configured server.
    async fn query_udp(&self, query: &[u8]) -> Result<Vec<u8>, EchError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| EchError::Dns(e.to_string()))?;
        socket
            .connect(&self.dns_server)
            .await
            .map_err(|e| EchError::Dns(format!("connect {}: {}", self.dns_server, e)))?;
        socket
            .send(query)
            .await
            .map_err(|e| EchError::Dns(e.to_string()))?;

        let mut buf = vec![0u8; crate::HEADER_BUF_SIZE];
        let n = tokio::time::timeout(UDP_DNS_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| EchError::Dns("query timed out".to_string()))?
            .map_err(|e| EchError::Dns(e.to_string()))?;

        parse_response(&buf[..n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_before_prepare_fails() {
        let cache = EchCache::new(
            "cloudflare-ech.com".to_string(),
            "https://doh.pub/dns-query".to_string(),
            "119.29.29.29:53".to_string(),
        );
        assert!(matches!(cache.get(), Err(EchError::NotPrepared)));
    }

    #[test]
    fn test_get_returns_cached_bytes() {
        let cache = EchCache::new(
            "cloudflare-ech.com".to_string(),
            "https://doh.pub/dns-query".to_string(),
            "119.29.29.29:53".to_string(),
        );
        *cache.list.write().unwrap() = Some(Bytes::from_static(b"\x00\x08configs"));
        assert_eq!(cache.get().unwrap(), Bytes::from_static(b"\x00\x08configs"));
    }
}
