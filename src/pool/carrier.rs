//! Carrier channel state
//!
//! One `Carrier` per pool slot. The slot itself is permanent; the
//! WebSocket behind it comes and goes as transports die and redials
//! succeed. Writes go through a per-carrier async mutex so frames are
//! never interleaved on the wire; the read half lives in a dedicated
//! reader task owned by the pool.
//!
//! Every successful (re)dial bumps the slot's epoch. Death reports
//! carry the epoch they observed, so a stale reader or sender cannot
//! kill a slot that has already been re-established.

use super::PoolError;
use crate::transport::CarrierStream;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio_tungstenite::tungstenite::Message;

pub(crate) type CarrierSink = SplitSink<CarrierStream, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CarrierState {
    /// Initial dial in progress
    Dialing,
    /// Connected; may be selected for outbound frames
    Ready,
    /// Transport failed; a redialer owns this slot
    Dead,
}

struct SlotState {
    state: CarrierState,
    epoch: u64,
}

pub(crate) struct Carrier {
    pub(crate) index: usize,
    slot: Mutex<SlotState>,
    sink: tokio::sync::Mutex<Option<CarrierSink>>,
    /// For least-recently-used tie-breaking between equally loaded slots
    last_used: Mutex<Instant>,
    /// Number of registered connections whose carrier hint points here
    outstanding: AtomicUsize,
}

impl Carrier {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            slot: Mutex::new(SlotState {
                state: CarrierState::Dialing,
                epoch: 0,
            }),
            sink: tokio::sync::Mutex::new(None),
            last_used: Mutex::new(Instant::now()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Current epoch if the slot is Ready, else `None`.
    pub(crate) fn ready_epoch(&self) -> Option<u64> {
        let slot = self.slot.lock().expect("carrier slot lock");
        (slot.state == CarrierState::Ready).then_some(slot.epoch)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.slot.lock().expect("carrier slot lock").epoch
    }

    /// Transition to Dead, but only if the slot still belongs to the
    /// reported epoch. The caller that wins is responsible for
    /// spawning the redialer.
    pub(crate) fn mark_dead(&self, epoch: u64) -> bool {
        let mut slot = self.slot.lock().expect("carrier slot lock");
        if slot.epoch != epoch || slot.state == CarrierState::Dead {
            return false;
        }
        slot.state = CarrierState::Dead;
        true
    }

    /// Install a freshly dialed sink, flip to Ready, and return the new
    /// epoch (which the paired reader task reports deaths under).
    pub(crate) async fn install(&self, sink: CarrierSink) -> u64 {
        *self.sink.lock().await = Some(sink);
        let mut slot = self.slot.lock().expect("carrier slot lock");
        slot.state = CarrierState::Ready;
        slot.epoch += 1;
        slot.epoch
    }

    /// Best-effort close and drop of the current sink.
    pub(crate) async fn discard_sink(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    /// Write one frame, serialized against other senders on this slot.
    pub(crate) async fn send(&self, message: Message) -> Result<(), PoolError> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| PoolError::CarrierSend("carrier not connected".to_string()))?;
        sink.send(message)
            .await
            .map_err(|e| PoolError::CarrierSend(e.to_string()))?;
        drop(guard);

        *self.last_used.lock().expect("carrier time lock") = Instant::now();
        Ok(())
    }

    pub(crate) fn last_used(&self) -> Instant {
        *self.last_used.lock().expect("carrier time lock")
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_outstanding(&self) {
        // Saturating: a hint may be cleared twice during teardown races
        let _ = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}
