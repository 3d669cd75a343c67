//! Frame encoding/decoding for the carrier protocol
//!
//! Each WebSocket binary message carries exactly one frame:
//!
//! ```text
//! +--------+-----------------+-----------------+
//! | Opcode | Cid Length (2B) |   Cid (UTF-8)   |
//! +--------+-----------------+-----------------+
//! |      Payload Length (4B)|     Payload     |
//! +-------------------------+-----------------+
//! ```
//!
//! All integers are big-endian. Structured payloads use length-prefixed
//! subfields throughout:
//!
//! - `OPEN_TCP`: `u16 target_len ‖ target ‖ first-frame bytes`
//! - `OPEN_UDP`: the target, as the whole payload
//! - `UDP_DATA` (relay → client): `u16 addr_len ‖ "host:port" ‖ datagram`
//! - `UDP_DATA` (client → relay): the raw datagram
//! - `CONNECTED` / `CLOSE` / `UDP_CLOSE`: empty
//! - `ERROR`: UTF-8 reason

use super::PoolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Fixed header size: opcode (1) + cid length (2) + payload length (4)
pub const FRAME_HEADER_SIZE: usize = 7;

/// Upper bound accepted for a single frame payload (16 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Open a TCP connection through the relay
    OpenTcp = 0x01,
    /// Open a UDP flow through the relay
    OpenUdp = 0x02,
    /// Relay confirms the remote endpoint is open
    Connected = 0x03,
    /// TCP stream bytes
    Data = 0x04,
    /// UDP datagram
    UdpData = 0x05,
    /// TCP stream closed
    Close = 0x06,
    /// UDP flow closed
    UdpClose = 0x07,
    /// Relay-side failure for this connection
    Error = 0x08,
}

impl TryFrom<u8> for Opcode {
    type Error = PoolError;

    fn try_from(value: u8) -> Result<Self, PoolError> {
        match value {
            0x01 => Ok(Opcode::OpenTcp),
            0x02 => Ok(Opcode::OpenUdp),
            0x03 => Ok(Opcode::Connected),
            0x04 => Ok(Opcode::Data),
            0x05 => Ok(Opcode::UdpData),
            0x06 => Ok(Opcode::Close),
            0x07 => Ok(Opcode::UdpClose),
            0x08 => Ok(Opcode::Error),
            other => Err(PoolError::UnknownOpcode(other)),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: Opcode,
    /// Connection id this frame belongs to
    pub cid: String,
    pub payload: Bytes,
}

impl Frame {
    /// OPEN_TCP with the target and any bytes the ingress already read
    pub fn open_tcp(cid: &str, target: &str, first_frame: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + target.len() + first_frame.len());
        payload.put_u16(target.len() as u16);
        payload.put_slice(target.as_bytes());
        payload.put_slice(first_frame);
        Self {
            opcode: Opcode::OpenTcp,
            cid: cid.to_string(),
            payload: payload.freeze(),
        }
    }

    /// OPEN_UDP naming the remote UDP endpoint
    pub fn open_udp(cid: &str, target: &str) -> Self {
        Self {
            opcode: Opcode::OpenUdp,
            cid: cid.to_string(),
            payload: Bytes::copy_from_slice(target.as_bytes()),
        }
    }

    pub fn connected(cid: &str) -> Self {
        Self {
            opcode: Opcode::Connected,
            cid: cid.to_string(),
            payload: Bytes::new(),
        }
    }

    pub fn data(cid: &str, payload: Bytes) -> Self {
        Self {
            opcode: Opcode::Data,
            cid: cid.to_string(),
            payload,
        }
    }

    /// UDP_DATA in the client → relay direction (bare datagram)
    pub fn udp_data(cid: &str, datagram: Bytes) -> Self {
        Self {
            opcode: Opcode::UdpData,
            cid: cid.to_string(),
            payload: datagram,
        }
    }

    /// UDP_DATA in the relay → client direction (`addr ‖ datagram`)
    pub fn udp_data_from(cid: &str, from: &str, datagram: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + from.len() + datagram.len());
        payload.put_u16(from.len() as u16);
        payload.put_slice(from.as_bytes());
        payload.put_slice(datagram);
        Self {
            opcode: Opcode::UdpData,
            cid: cid.to_string(),
            payload: payload.freeze(),
        }
    }

    pub fn close(cid: &str) -> Self {
        Self {
            opcode: Opcode::Close,
            cid: cid.to_string(),
            payload: Bytes::new(),
        }
    }

    pub fn udp_close(cid: &str) -> Self {
        Self {
            opcode: Opcode::UdpClose,
            cid: cid.to_string(),
            payload: Bytes::new(),
        }
    }

    pub fn error(cid: &str, reason: &str) -> Self {
        Self {
            opcode: Opcode::Error,
            cid: cid.to_string(),
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Encode into one WebSocket message body.
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(FRAME_HEADER_SIZE + self.cid.len() + self.payload.len());
        buf.put_u8(self.opcode as u8);
        buf.put_u16(self.cid.len() as u16);
        buf.put_slice(self.cid.as_bytes());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one complete frame; the message must contain exactly one.
    pub fn decode(buf: &[u8]) -> Result<Self, PoolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(PoolError::InvalidFrame(format!(
                "message shorter than header: {} bytes",
                buf.len()
            )));
        }

        let opcode = Opcode::try_from(buf[0])?;
        let cid_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;

        if buf.len() < 3 + cid_len + 4 {
            return Err(PoolError::InvalidFrame("truncated cid".to_string()));
        }
        let cid = std::str::from_utf8(&buf[3..3 + cid_len])
            .map_err(|_| PoolError::InvalidFrame("cid is not UTF-8".to_string()))?
            .to_string();

        let len_at = 3 + cid_len;
        let payload_len = u32::from_be_bytes([
            buf[len_at],
            buf[len_at + 1],
            buf[len_at + 2],
            buf[len_at + 3],
        ]) as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(PoolError::InvalidFrame(format!(
                "payload length {} exceeds limit",
                payload_len
            )));
        }

        let payload_at = len_at + 4;
        if buf.len() != payload_at + payload_len {
            return Err(PoolError::InvalidFrame(format!(
                "payload length mismatch: declared {}, got {}",
                payload_len,
                buf.len() - payload_at
            )));
        }

        Ok(Self {
            opcode,
            cid,
            payload: Bytes::copy_from_slice(&buf[payload_at..]),
        })
    }

    /// Split an OPEN_TCP payload into target and first-frame bytes.
    pub fn split_open_tcp(&self) -> Result<(String, Bytes), PoolError> {
        split_prefixed(&self.payload)
    }

    /// Split a relay → client UDP_DATA payload into source address and
    /// datagram.
    pub fn split_udp_data(&self) -> Result<(String, Bytes), PoolError> {
        split_prefixed(&self.payload)
    }
}

/// Split `u16 len ‖ utf8 ‖ rest` out of a payload.
fn split_prefixed(payload: &Bytes) -> Result<(String, Bytes), PoolError> {
    if payload.len() < 2 {
        return Err(PoolError::InvalidFrame("missing subfield length".to_string()));
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + len {
        return Err(PoolError::InvalidFrame("truncated subfield".to_string()));
    }
    let head = std::str::from_utf8(&payload[2..2 + len])
        .map_err(|_| PoolError::InvalidFrame("subfield is not UTF-8".to_string()))?
        .to_string();
    Ok((head, payload.slice(2 + len..)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data("cid-1", Bytes::from_static(b"Hello, World!"));
        let encoded = original.encode();

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.opcode, Opcode::Data);
        assert_eq!(decoded.cid, "cid-1");
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn test_open_tcp_carries_target_and_first_frame() {
        let frame = Frame::open_tcp("c", "example.com:443", b"CLIENTHELLOBYTES");
        let decoded = Frame::decode(&frame.encode()).unwrap();

        let (target, first) = decoded.split_open_tcp().unwrap();
        assert_eq!(target, "example.com:443");
        assert_eq!(&first[..], b"CLIENTHELLOBYTES");
    }

    #[test]
    fn test_open_tcp_empty_first_frame() {
        let frame = Frame::open_tcp("c", "example.com:80", b"");
        let (target, first) = frame.split_open_tcp().unwrap();
        assert_eq!(target, "example.com:80");
        assert!(first.is_empty());
    }

    #[test]
    fn test_udp_data_round_trip() {
        let frame = Frame::udp_data_from("c", "8.8.8.8:53", &[0xAB, 0xCD]);
        let decoded = Frame::decode(&frame.encode()).unwrap();

        let (from, datagram) = decoded.split_udp_data().unwrap();
        assert_eq!(from, "8.8.8.8:53");
        assert_eq!(&datagram[..], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_control_frames_have_empty_payload() {
        for frame in [
            Frame::connected("c"),
            Frame::close("c"),
            Frame::udp_close("c"),
        ] {
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert!(decoded.payload.is_empty());
            assert_eq!(decoded.cid, "c");
        }
    }

    #[test]
    fn test_error_frame_reason() {
        let frame = Frame::error("c", "connection refused");
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.opcode, Opcode::Error);
        assert_eq!(&decoded.payload[..], b"connection refused");
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let mut encoded = Frame::close("c").encode().to_vec();
        encoded[0] = 0x7F;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(PoolError::UnknownOpcode(0x7F))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_message() {
        let encoded = Frame::data("cid", Bytes::from_static(b"abcdef")).encode();
        assert!(Frame::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Frame::decode(&encoded[..3]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_garbage() {
        let mut encoded = Frame::close("c").encode().to_vec();
        encoded.push(0);
        assert!(Frame::decode(&encoded).is_err());
    }

    #[test]
    fn test_split_rejects_truncated_subfield() {
        let frame = Frame {
            opcode: Opcode::UdpData,
            cid: "c".to_string(),
            payload: Bytes::from_static(&[0x00, 0xFF, b'x']),
        };
        assert!(frame.split_udp_data().is_err());
    }
}
