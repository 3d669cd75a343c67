//! The ECH Pool: connection registry and carrier multiplexing
//!
//! The pool owns N carrier slots and a registry of logical
//! connections keyed by connection id. Outbound frames pick a carrier
//! (sticky per connection, rebinding only when the bound carrier is
//! gone); inbound frames are demultiplexed by the per-carrier reader
//! tasks straight onto the local sink registered for their cid.
//!
//! The registry lock is only ever held for lookups and inserts —
//! never across socket I/O. Socket writes serialize on the chosen
//! carrier's own send lock.

use super::carrier::Carrier;
use super::{
    Frame, Opcode, PoolError, REBIND_GRACE, REBIND_POLL, REDIAL_BACKOFF_MAX, REDIAL_BACKOFF_MIN,
};
use crate::transport::{CarrierStream, RelayDialer};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// Sentinel for "no carrier hint"
const NO_HINT: usize = usize::MAX;

/// Receiving side of a SOCKS5 UDP association, as the pool sees it.
///
/// The pool stays unaware of SOCKS5 UDP packet wrapping; it hands the
/// datagram and its source address to whatever implements this.
#[async_trait]
pub trait UdpSink: Send + Sync {
    /// The relay delivered a datagram originating from `from`
    /// (`host:port`).
    async fn deliver(&self, from: &str, datagram: Bytes);

    /// Pool-side teardown (UDP_CLOSE, ERROR, or shutdown). Must be
    /// idempotent.
    async fn close(&self);
}

/// Write half of an accepted TCP connection, shared between the pool
/// (relayed data) and the ingress handler (protocol replies).
pub type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Local byte sink of a logical connection
enum LocalSink {
    /// Write half of the accepted TCP connection
    Tcp(SharedWriter),
    /// SOCKS5 UDP association
    Udp(Arc<dyn UdpSink>),
}

/// One registered logical connection
struct ConnRecord {
    cid: String,
    target: String,
    local: LocalSink,
    /// Completed once when the relay confirms CONNECTED
    connected: Mutex<Option<oneshot::Sender<()>>>,
    /// Index of the carrier that took the most recent outbound frame
    hint: AtomicUsize,
}

impl ConnRecord {
    fn hint(&self) -> Option<usize> {
        match self.hint.load(Ordering::Acquire) {
            NO_HINT => None,
            index => Some(index),
        }
    }

    fn complete_connected(&self) {
        if let Some(tx) = self.connected.lock().expect("connected lock").take() {
            let _ = tx.send(());
        }
    }
}

/// Race a CONNECTED signal against a timeout.
pub async fn wait_connected(signal: oneshot::Receiver<()>, timeout: Duration) -> bool {
    matches!(tokio::time::timeout(timeout, signal).await, Ok(Ok(())))
}

/// Fixed-size pool of TLS+ECH WebSocket carriers multiplexing logical
/// TCP/UDP connections.
pub struct EchPool {
    dialer: Arc<dyn RelayDialer>,
    carriers: Vec<Arc<Carrier>>,
    conns: Mutex<HashMap<String, Arc<ConnRecord>>>,
    weak_self: Weak<EchPool>,
}

impl EchPool {
    pub fn new(dialer: Arc<dyn RelayDialer>, size: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new_cyclic(|weak| Self {
            dialer,
            carriers: (0..size).map(|i| Arc::new(Carrier::new(i))).collect(),
            conns: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("pool dropped while in use")
    }

    /// Dial every carrier in parallel. Returns once each slot has
    /// finished its first attempt; slots that failed keep redialing
    /// with backoff in the background.
    pub async fn start(&self) {
        let mut attempts = Vec::with_capacity(self.carriers.len());
        for carrier in &self.carriers {
            let pool = self.arc();
            let carrier = Arc::clone(carrier);
            attempts.push(tokio::spawn(async move {
                match pool.dialer.dial().await {
                    Ok(ws) => pool.attach(&carrier, ws).await,
                    Err(e) => {
                        warn!(carrier = carrier.index, error = %e, "initial carrier dial failed");
                        let epoch = carrier.epoch();
                        if carrier.mark_dead(epoch) {
                            let pool = Arc::clone(&pool);
                            tokio::spawn(async move { pool.redial(carrier).await });
                        }
                    }
                }
            }));
        }
        for attempt in attempts {
            let _ = attempt.await;
        }
        info!(
            ready = self.ready_carriers(),
            total = self.carriers.len(),
            "carrier pool started"
        );
    }

    /// Number of carriers currently Ready.
    pub fn ready_carriers(&self) -> usize {
        self.carriers
            .iter()
            .filter(|c| c.ready_epoch().is_some())
            .count()
    }

    /// Number of registered logical connections.
    pub fn connection_count(&self) -> usize {
        self.conns.lock().expect("registry lock").len()
    }

    /// Whether a connection id is currently registered.
    pub fn is_registered(&self, cid: &str) -> bool {
        self.conns.lock().expect("registry lock").contains_key(cid)
    }

    /// Register a TCP connection and claim a carrier for it by sending
    /// `OPEN_TCP(target ‖ first_frame)`. Fails fast when no carrier is
    /// Ready. Returns the one-shot the relay's CONNECTED completes.
    pub async fn register_and_claim(
        &self,
        cid: &str,
        target: &str,
        first_frame: &[u8],
        local: SharedWriter,
    ) -> Result<oneshot::Receiver<()>, PoolError> {
        let (rx, record) = self.insert_record(cid, target, LocalSink::Tcp(local))?;

        let frame = Frame::open_tcp(cid, target, first_frame);
        if let Err(e) = self.send_frame(&record, frame, Duration::ZERO).await {
            self.remove(cid);
            return Err(e);
        }
        debug!(cid, target, "tcp connection registered");
        Ok(rx)
    }

    /// Register a UDP association. No frame is sent yet; the first
    /// datagram triggers [`EchPool::send_udp_connect`].
    pub fn register_udp(
        &self,
        cid: &str,
        sink: Arc<dyn UdpSink>,
    ) -> Result<oneshot::Receiver<()>, PoolError> {
        let (rx, _) = self.insert_record(cid, "", LocalSink::Udp(sink))?;
        debug!(cid, "udp association registered");
        Ok(rx)
    }

    /// Send `OPEN_UDP(target)` for a registered UDP association.
    pub async fn send_udp_connect(&self, cid: &str, target: &str) -> Result<(), PoolError> {
        let record = self.lookup(cid)?;
        self.send_frame(&record, Frame::open_udp(cid, target), Duration::ZERO)
            .await
    }

    /// Send stream bytes for a TCP connection. The carrier that took
    /// the previous frame is preferred; when it is gone, the frame
    /// transparently rebinds to any Ready carrier within the grace
    /// window.
    pub async fn send_data(&self, cid: &str, data: &[u8]) -> Result<(), PoolError> {
        let record = self.lookup(cid)?;
        self.send_frame(
            &record,
            Frame::data(cid, Bytes::copy_from_slice(data)),
            REBIND_GRACE,
        )
        .await
    }

    /// Send one UDP datagram (client → relay).
    pub async fn send_udp_data(&self, cid: &str, datagram: &[u8]) -> Result<(), PoolError> {
        let record = self.lookup(cid)?;
        self.send_frame(
            &record,
            Frame::udp_data(cid, Bytes::copy_from_slice(datagram)),
            REBIND_GRACE,
        )
        .await
    }

    /// Best-effort CLOSE notification; idempotent. The registry entry
    /// itself is removed by the demux path (or by [`EchPool::remove`]).
    pub async fn send_close(&self, cid: &str) {
        self.send_control(cid, Frame::close(cid)).await;
    }

    /// Best-effort UDP_CLOSE notification; idempotent.
    pub async fn send_udp_close(&self, cid: &str) {
        self.send_control(cid, Frame::udp_close(cid)).await;
    }

    /// Drop a connection record. Safe to call repeatedly.
    pub fn remove(&self, cid: &str) {
        if let Some(record) = self.conns.lock().expect("registry lock").remove(cid) {
            self.clear_hint(&record);
        }
    }

    fn insert_record(
        &self,
        cid: &str,
        target: &str,
        local: LocalSink,
    ) -> Result<(oneshot::Receiver<()>, Arc<ConnRecord>), PoolError> {
        let (tx, rx) = oneshot::channel();
        let record = Arc::new(ConnRecord {
            cid: cid.to_string(),
            target: target.to_string(),
            local,
            connected: Mutex::new(Some(tx)),
            hint: AtomicUsize::new(NO_HINT),
        });

        let mut conns = self.conns.lock().expect("registry lock");
        if conns.contains_key(cid) {
            return Err(PoolError::DuplicateConnection(cid.to_string()));
        }
        conns.insert(cid.to_string(), Arc::clone(&record));
        Ok((rx, record))
    }

    fn lookup(&self, cid: &str) -> Result<Arc<ConnRecord>, PoolError> {
        self.conns
            .lock()
            .expect("registry lock")
            .get(cid)
            .cloned()
            .ok_or_else(|| PoolError::UnknownConnection(cid.to_string()))
    }

    fn lookup_opt(&self, cid: &str) -> Option<Arc<ConnRecord>> {
        self.conns.lock().expect("registry lock").get(cid).cloned()
    }

    fn take(&self, cid: &str) -> Option<Arc<ConnRecord>> {
        let record = self.conns.lock().expect("registry lock").remove(cid);
        if let Some(record) = &record {
            self.clear_hint(record);
        }
        record
    }

    fn clear_hint(&self, record: &ConnRecord) {
        let old = record.hint.swap(NO_HINT, Ordering::AcqRel);
        if old != NO_HINT {
            self.carriers[old].dec_outstanding();
        }
    }

    fn bind_hint(&self, record: &ConnRecord, index: usize) {
        let old = record.hint.swap(index, Ordering::AcqRel);
        if old == index {
            return;
        }
        if old != NO_HINT {
            self.carriers[old].dec_outstanding();
        }
        self.carriers[index].inc_outstanding();
    }

    /// Pick the carrier for the next outbound frame: the hinted one if
    /// it is still Ready, otherwise the Ready carrier with the fewest
    /// outstanding connections (ties to the least recently used).
    fn pick_carrier(&self, hint: Option<usize>) -> Option<(Arc<Carrier>, u64)> {
        if let Some(index) = hint {
            if let Some(epoch) = self.carriers[index].ready_epoch() {
                return Some((Arc::clone(&self.carriers[index]), epoch));
            }
        }
        self.carriers
            .iter()
            .filter_map(|c| c.ready_epoch().map(|epoch| (c, epoch)))
            .min_by_key(|(c, _)| (c.outstanding(), c.last_used()))
            .map(|(c, epoch)| (Arc::clone(c), epoch))
    }

    /// Send one frame, rebinding across carrier deaths. A zero grace
    /// window fails fast as soon as no carrier is Ready.
    async fn send_frame(
        &self,
        record: &Arc<ConnRecord>,
        frame: Frame,
        grace: Duration,
    ) -> Result<(), PoolError> {
        let encoded = frame.encode();
        let deadline = Instant::now() + grace;

        loop {
            match self.pick_carrier(record.hint()) {
                Some((carrier, epoch)) => {
                    match carrier.send(Message::Binary(encoded.to_vec())).await {
                        Ok(()) => {
                            self.bind_hint(record, carrier.index);
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(
                                cid = %record.cid,
                                carrier = carrier.index,
                                error = %e,
                                "send failed, rebinding"
                            );
                            if !self.carrier_down(&carrier, epoch).await {
                                // Slot was already re-established; avoid
                                // spinning against a flapping sink.
                                tokio::time::sleep(REBIND_POLL).await;
                            }
                        }
                    }
                }
                None => {
                    if Instant::now() >= deadline {
                        return Err(PoolError::NoReadyCarrier);
                    }
                    tokio::time::sleep(REBIND_POLL).await;
                }
            }
        }
    }

    /// Fire a control frame without caring about delivery failures.
    async fn send_control(&self, cid: &str, frame: Frame) {
        let Some(record) = self.lookup_opt(cid) else {
            return;
        };
        if let Err(e) = self.send_frame(&record, frame, Duration::ZERO).await {
            debug!(cid, error = %e, "close notification not delivered");
        }
    }

    async fn attach(&self, carrier: &Arc<Carrier>, ws: CarrierStream) {
        let (sink, stream) = ws.split();
        let epoch = carrier.install(sink).await;
        info!(carrier = carrier.index, "carrier ready");
        self.spawn_reader(Arc::clone(carrier), epoch, stream);
    }

    /// Mark a carrier dead (if the epoch still matches) and hand the
    /// slot to a redialer. Returns whether this call did the killing.
    async fn carrier_down(&self, carrier: &Arc<Carrier>, epoch: u64) -> bool {
        if !carrier.mark_dead(epoch) {
            return false;
        }
        carrier.discard_sink().await;
        warn!(carrier = carrier.index, "carrier lost, redialing");

        let pool = self.arc();
        let carrier = Arc::clone(carrier);
        tokio::spawn(async move { pool.redial(carrier).await });
        true
    }

    async fn redial(self: Arc<Self>, carrier: Arc<Carrier>) {
        let mut backoff = REDIAL_BACKOFF_MIN;
        loop {
            tokio::time::sleep(backoff).await;
            match self.dialer.dial().await {
                Ok(ws) => {
                    self.attach(&carrier, ws).await;
                    return;
                }
                Err(e) => {
                    warn!(carrier = carrier.index, error = %e, "redial failed");
                    backoff = (backoff * 2).min(REDIAL_BACKOFF_MAX);
                }
            }
        }
    }

    fn spawn_reader(
        &self,
        carrier: Arc<Carrier>,
        epoch: u64,
        mut stream: SplitStream<CarrierStream>,
    ) {
        let pool = self.arc();
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                        Ok(frame) => pool.dispatch(frame).await,
                        Err(e) => {
                            warn!(carrier = carrier.index, error = %e, "dropping undecodable frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(carrier = carrier.index, "carrier closed by relay");
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong/text: nothing to do
                    Some(Err(e)) => {
                        if is_normal_ws_close(&e) {
                            debug!(carrier = carrier.index, "carrier connection ended");
                        } else {
                            warn!(carrier = carrier.index, error = %e, "carrier read failed");
                        }
                        break;
                    }
                }
            }
            pool.carrier_down(&carrier, epoch).await;
        });
    }

    /// Demultiplex one inbound frame onto its registered connection.
    async fn dispatch(&self, frame: Frame) {
        match frame.opcode {
            Opcode::Connected => match self.lookup_opt(&frame.cid) {
                Some(record) => record.complete_connected(),
                None => debug!(cid = %frame.cid, "CONNECTED for unknown connection"),
            },

            Opcode::Data => {
                let Some(record) = self.lookup_opt(&frame.cid) else {
                    debug!(cid = %frame.cid, "DATA for unknown connection dropped");
                    return;
                };
                match &record.local {
                    LocalSink::Tcp(writer) => {
                        let failed = {
                            let mut writer = writer.lock().await;
                            writer.write_all(&frame.payload).await.is_err()
                        };
                        if failed {
                            debug!(cid = %frame.cid, "local sink gone, tearing down");
                            self.send_close(&frame.cid).await;
                            self.remove(&frame.cid);
                        }
                    }
                    LocalSink::Udp(_) => {
                        warn!(cid = %frame.cid, "DATA frame for udp association dropped")
                    }
                }
            }

            Opcode::UdpData => {
                let Some(record) = self.lookup_opt(&frame.cid) else {
                    debug!(cid = %frame.cid, "UDP_DATA for unknown connection dropped");
                    return;
                };
                match &record.local {
                    LocalSink::Udp(sink) => match frame.split_udp_data() {
                        Ok((from, datagram)) => sink.deliver(&from, datagram).await,
                        Err(e) => warn!(cid = %frame.cid, error = %e, "bad UDP_DATA payload"),
                    },
                    LocalSink::Tcp(_) => {
                        warn!(cid = %frame.cid, "UDP_DATA frame for tcp connection dropped")
                    }
                }
            }

            Opcode::Close | Opcode::Error => {
                if frame.opcode == Opcode::Error {
                    warn!(
                        cid = %frame.cid,
                        reason = %String::from_utf8_lossy(&frame.payload),
                        "relay reported connection error"
                    );
                }
                if let Some(record) = self.take(&frame.cid) {
                    close_local(&record).await;
                }
            }

            Opcode::UdpClose => {
                if let Some(record) = self.take(&frame.cid) {
                    close_local(&record).await;
                }
            }

            Opcode::OpenTcp | Opcode::OpenUdp => {
                warn!(cid = %frame.cid, opcode = ?frame.opcode, "unexpected OPEN from relay");
            }
        }
    }
}

/// Shut the local side of a connection whose record was just removed.
async fn close_local(record: &ConnRecord) {
    match &record.local {
        LocalSink::Tcp(writer) => {
            let _ = writer.lock().await.shutdown().await;
        }
        LocalSink::Udp(sink) => sink.close().await,
    }
    debug!(cid = %record.cid, target = %record.target, "connection closed");
}

/// Carrier read errors that are ordinary connection teardown, not
/// worth an error-level log.
fn is_normal_ws_close(err: &tungstenite::Error) -> bool {
    use std::io::ErrorKind;
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => true,
        tungstenite::Error::Io(e) => matches!(
            e.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
        ),
        _ => false,
    }
}
