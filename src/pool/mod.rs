//! ECH Pool — carrier ownership and connection multiplexing
//!
//! Provides:
//! - Frame encoding/decoding for the carrier protocol
//! - The connection registry (one record per connection id)
//! - Carrier selection, send-side multiplexing, receive-side demux
//! - Carrier lifecycle (parallel start, death detection, redial)

mod carrier;
mod frame;
#[allow(clippy::module_inception)]
mod pool;

pub use frame::{Frame, Opcode, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use pool::{wait_connected, EchPool, SharedWriter, UdpSink};

use std::time::Duration;
use thiserror::Error;

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("duplicate connection id: {0}")]
    DuplicateConnection(String),

    #[error("no ready carrier")]
    NoReadyCarrier,

    #[error("carrier send failed: {0}")]
    CarrierSend(String),
}

/// How long a CONNECTED confirmation from the relay is waited for
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a send may wait for some carrier to come back Ready before
/// the logical connection is given up
pub(crate) const REBIND_GRACE: Duration = Duration::from_secs(2);

/// Poll interval while waiting out the rebind grace window
pub(crate) const REBIND_POLL: Duration = Duration::from_millis(100);

/// Redial backoff bounds for dead carriers
pub(crate) const REDIAL_BACKOFF_MIN: Duration = Duration::from_millis(500);
pub(crate) const REDIAL_BACKOFF_MAX: Duration = Duration::from_secs(5);
