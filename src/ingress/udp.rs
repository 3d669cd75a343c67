//! SOCKS5 UDP association
//!
//! Owns the local UDP socket handed to the client by UDP ASSOCIATE.
//! The first datagram pins the authorized client address and opens the
//! remote flow through the pool; datagrams from any other source are
//! dropped silently. Replies coming back from the relay are re-wrapped
//! in the SOCKS5 UDP header and sent to the pinned client.
//!
//! Teardown is driven from three directions — control TCP close, UDP
//! socket failure, or a pool-side UDP_CLOSE — and is idempotent.

use super::socks5::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use super::{is_normal_close, Address, IngressError};
use crate::pool::{wait_connected, EchPool, UdpSink, CONNECT_TIMEOUT};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// Maximum UDP datagram we accept from the client
const MAX_DATAGRAM: usize = 65535;

pub(crate) struct UdpAssociation {
    cid: String,
    socket: UdpSocket,
    pool: Arc<EchPool>,
    /// First datagram source wins; everyone else is ignored
    client_addr: Mutex<Option<SocketAddr>>,
    /// Whether OPEN_UDP has been sent
    opened: AtomicBool,
    closed: AtomicBool,
    shutdown_notify: Notify,
    connected: Mutex<Option<oneshot::Receiver<()>>>,
    weak_self: Weak<UdpAssociation>,
}

impl UdpAssociation {
    pub(crate) fn new(cid: String, socket: UdpSocket, pool: Arc<EchPool>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            cid,
            socket,
            pool,
            client_addr: Mutex::new(None),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            connected: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("association still alive")
    }

    /// Stash the CONNECTED one-shot; it is raced against the timeout
    /// once the first datagram triggers OPEN_UDP.
    pub(crate) fn set_connected_signal(&self, signal: oneshot::Receiver<()>) {
        *self.connected.lock().expect("signal lock") = Some(signal);
    }

    /// Start the datagram relay task.
    pub(crate) fn spawn_relay(&self) {
        let assoc = self.arc();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = assoc.shutdown_notify.notified() => break,
                    received = assoc.socket.recv_from(&mut buf) => match received {
                        Ok((n, src)) => {
                            if !assoc.authorize(src) {
                                debug!(cid = %assoc.cid, %src, "dropping datagram from unauthorized source");
                                continue;
                            }
                            if let Err(e) = assoc.handle_datagram(&buf[..n]).await {
                                debug!(cid = %assoc.cid, error = %e, "datagram dropped");
                            }
                        }
                        Err(e) => {
                            if !is_normal_close(&e) {
                                debug!(cid = %assoc.cid, error = %e, "udp socket failed");
                            }
                            break;
                        }
                    }
                }
            }
            assoc.close_inner().await;
        });
    }

    /// End the association from the control-connection side.
    pub(crate) async fn shutdown(&self) {
        self.close_inner().await;
    }

    /// Pin the first source address; reject every other sender.
    fn authorize(&self, src: SocketAddr) -> bool {
        let mut pinned = self.client_addr.lock().expect("client addr lock");
        match *pinned {
            Some(addr) => addr == src,
            None => {
                debug!(cid = %self.cid, client = %src, "udp client address pinned");
                *pinned = Some(src);
                true
            }
        }
    }

    async fn handle_datagram(&self, packet: &[u8]) -> Result<(), IngressError> {
        let (target, payload) = parse_udp_packet(packet)?;
        let target = target.to_string();

        if !self.opened.swap(true, Ordering::SeqCst) {
            self.pool.send_udp_connect(&self.cid, &target).await?;
            if let Some(signal) = self.connected.lock().expect("signal lock").take() {
                let assoc = self.arc();
                tokio::spawn(async move {
                    if !wait_connected(signal, CONNECT_TIMEOUT).await {
                        warn!(cid = %assoc.cid, "udp connect timed out");
                        assoc.close_inner().await;
                    }
                });
            }
        }

        self.pool.send_udp_data(&self.cid, payload).await?;
        Ok(())
    }

    async fn close_inner(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_notify.notify_waiters();
        self.pool.send_udp_close(&self.cid).await;
        self.pool.remove(&self.cid);
        debug!(cid = %self.cid, "udp association closed");
    }
}

#[async_trait]
impl UdpSink for UdpAssociation {
    async fn deliver(&self, from: &str, datagram: Bytes) {
        let client = match *self.client_addr.lock().expect("client addr lock") {
            Some(addr) => addr,
            None => {
                debug!(cid = %self.cid, "udp reply before any client datagram, dropped");
                return;
            }
        };

        let Some((host, port)) = split_host_port(from) else {
            warn!(cid = %self.cid, from, "bad source address on udp reply");
            return;
        };

        match build_udp_packet(host, port, &datagram) {
            Ok(packet) => {
                if let Err(e) = self.socket.send_to(&packet, client).await {
                    debug!(cid = %self.cid, error = %e, "udp reply delivery failed");
                }
            }
            Err(e) => warn!(cid = %self.cid, error = %e, "cannot wrap udp reply"),
        }
    }

    async fn close(&self) {
        self.close_inner().await;
    }
}

/// Split `host:port` (with optional `[...]` around IPv6 hosts).
fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host, port))
}

/// Parse a SOCKS5 UDP request header: RSV(2) FRAG(1) ATYP ADDR PORT,
/// followed by the payload. Fragmented packets are rejected.
pub(crate) fn parse_udp_packet(packet: &[u8]) -> Result<(Address, &[u8]), IngressError> {
    if packet.len() < 10 {
        return Err(IngressError::BadRequest("udp packet too short".to_string()));
    }
    if packet[0] != 0 || packet[1] != 0 {
        return Err(IngressError::BadRequest("non-zero RSV field".to_string()));
    }
    if packet[2] != 0 {
        return Err(IngressError::BadRequest(format!(
            "udp fragmentation not supported (FRAG={})",
            packet[2]
        )));
    }

    let atyp = packet[3];
    let mut offset = 4;

    let address = match atyp {
        ATYP_IPV4 => {
            if packet.len() < offset + 6 {
                return Err(IngressError::BadRequest("truncated IPv4 address".to_string()));
            }
            let mut ip = [0u8; 4];
            ip.copy_from_slice(&packet[offset..offset + 4]);
            offset += 4;
            let port = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
            offset += 2;
            Address::Ipv4(ip, port)
        }
        ATYP_DOMAIN => {
            let len = packet[offset] as usize;
            offset += 1;
            if packet.len() < offset + len + 2 {
                return Err(IngressError::BadRequest("truncated domain".to_string()));
            }
            let domain = String::from_utf8_lossy(&packet[offset..offset + len]).to_string();
            offset += len;
            let port = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
            offset += 2;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            if packet.len() < offset + 18 {
                return Err(IngressError::BadRequest("truncated IPv6 address".to_string()));
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&packet[offset..offset + 16]);
            offset += 16;
            let port = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
            offset += 2;
            Address::Ipv6(ip, port)
        }
        other => return Err(IngressError::UnsupportedAddressType(other)),
    };

    Ok((address, &packet[offset..]))
}

/// Build a SOCKS5 UDP reply packet around a relayed datagram. The
/// ATYP is inferred from the address shape.
pub(crate) fn build_udp_packet(
    host: &str,
    port: u16,
    payload: &[u8],
) -> Result<Vec<u8>, IngressError> {
    let mut packet = Vec::with_capacity(22 + payload.len());
    packet.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV + FRAG

    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        packet.push(ATYP_IPV4);
        packet.extend_from_slice(&v4.octets());
    } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
        packet.push(ATYP_IPV6);
        packet.extend_from_slice(&v6.octets());
    } else {
        if host.len() > 255 {
            return Err(IngressError::BadRequest("domain too long".to_string()));
        }
        packet.push(ATYP_DOMAIN);
        packet.push(host.len() as u8);
        packet.extend_from_slice(host.as_bytes());
    }

    packet.extend_from_slice(&port.to_be_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_packet() {
        let mut packet = vec![0, 0, 0, ATYP_IPV4, 8, 8, 8, 8];
        packet.extend_from_slice(&53u16.to_be_bytes());
        packet.extend_from_slice(b"query");

        let (addr, payload) = parse_udp_packet(&packet).unwrap();
        assert_eq!(addr, Address::Ipv4([8, 8, 8, 8], 53));
        assert_eq!(payload, b"query");
    }

    #[test]
    fn test_parse_domain_packet() {
        let mut packet = vec![0, 0, 0, ATYP_DOMAIN, 11];
        packet.extend_from_slice(b"example.com");
        packet.extend_from_slice(&443u16.to_be_bytes());
        packet.extend_from_slice(b"data");

        let (addr, payload) = parse_udp_packet(&packet).unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 443));
        assert_eq!(payload, b"data");
    }

    #[test]
    fn test_parse_rejects_fragments() {
        let mut packet = vec![0, 0, 1, ATYP_IPV4, 1, 2, 3, 4];
        packet.extend_from_slice(&53u16.to_be_bytes());
        assert!(parse_udp_packet(&packet).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_rsv() {
        let mut packet = vec![0, 1, 0, ATYP_IPV4, 1, 2, 3, 4];
        packet.extend_from_slice(&53u16.to_be_bytes());
        assert!(parse_udp_packet(&packet).is_err());
    }

    #[test]
    fn test_build_packet_round_trip() {
        let packet = build_udp_packet("8.8.4.4", 53, b"answer").unwrap();
        let (addr, payload) = parse_udp_packet(&packet).unwrap();
        assert_eq!(addr, Address::Ipv4([8, 8, 4, 4], 53));
        assert_eq!(payload, b"answer");
    }

    #[test]
    fn test_build_packet_infers_atyp() {
        assert_eq!(build_udp_packet("1.2.3.4", 1, b"").unwrap()[3], ATYP_IPV4);
        assert_eq!(build_udp_packet("2001:db8::1", 1, b"").unwrap()[3], ATYP_IPV6);
        assert_eq!(build_udp_packet("example.com", 1, b"").unwrap()[3], ATYP_DOMAIN);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("8.8.8.8:53"), Some(("8.8.8.8", 53)));
        assert_eq!(
            split_host_port("[2001:db8::1]:53"),
            Some(("2001:db8::1", 53))
        );
        assert_eq!(split_host_port("no-port"), None);
    }
}
