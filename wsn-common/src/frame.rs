//! Binary frame formats for gateway and client traffic.
//!
//! All integers are big-endian.
//!
//! Application frame (TCP, both directions):
//! ```text
//! +-------------+--------------------+------------------+
//! | action (3B) | payload len (2B)   | JSON payload     |
//! +-------------+--------------------+------------------+
//! ```
//!
//! Response frame (TCP, server to client) carries no action code:
//! ```text
//! +--------------------+------------------+
//! | payload len (2B)   | payload          |
//! +--------------------+------------------+
//! ```
//!
//! Heartbeat (UDP only, gateway to server), fixed 28 bytes:
//! ```text
//! +-----------------+-----------------+-----------+---------------+
//! | gateway id (8B) | ip (16B)        | port (2B) | sequence (2B) |
//! +-----------------+-----------------+-----------+---------------+
//! ```
//! Text fields are NUL-padded on encode and stripped on decode.
//!
//! TCP readers never assume one read equals one frame: [`FrameBuffer`] and
//! [`ResponseBuffer`] accumulate bytes across reads and only yield a frame
//! once its header and full payload have arrived.

use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::Action;

/// Size of the action code.
pub const ACTION_LEN: usize = 3;
/// Size of the payload length prefix.
pub const LENGTH_LEN: usize = 2;
/// Size of an application frame header.
pub const HEADER_LEN: usize = ACTION_LEN + LENGTH_LEN;
/// Largest payload a 16-bit length prefix can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;
/// Width of the NUL-padded gateway id field.
pub const GATEWAY_ID_LEN: usize = 8;
/// Width of the NUL-padded IP field.
pub const IP_LEN: usize = 16;
/// Total size of a heartbeat datagram.
pub const HEARTBEAT_LEN: usize = GATEWAY_ID_LEN + IP_LEN + 2 + 2;
/// Chunk size used when streaming size-prefixed payloads.
pub const CHUNK_SIZE: usize = 1024;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too large: {0} bytes (max {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Field {field} does not fit in {width} bytes")]
    FieldTooLong { field: &'static str, width: usize },
    #[error("Field {0} is not valid UTF-8")]
    InvalidText(&'static str),
    #[error("Invalid JSON payload: {0}")]
    Json(String),
}

/// A decoded application frame.
///
/// The action code is kept raw so that frames with unknown codes can still be
/// logged and discarded by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: [u8; ACTION_LEN],
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from an action and raw payload bytes.
    pub fn new(action: Action, payload: impl Into<Bytes>) -> Self {
        Self {
            code: action.code(),
            payload: payload.into(),
        }
    }

    /// Build a frame whose payload is the JSON encoding of `body`.
    pub fn json<T: Serialize>(action: Action, body: &T) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(body).map_err(|e| FrameError::Json(e.to_string()))?;
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self::new(action, payload))
    }

    /// The known action for this frame, if any.
    pub fn action(&self) -> Option<Action> {
        Action::from_code(&self.code)
    }

    /// Deserialize the JSON payload.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_slice(&self.payload).map_err(|e| FrameError::Json(e.to_string()))
    }

    /// Serialize to `[action][len][payload]`.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode one complete frame from the start of `buf`.
    ///
    /// Trailing bytes beyond the declared payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let len = u16::from_be_bytes([buf[ACTION_LEN], buf[ACTION_LEN + 1]]) as usize;
        let total = HEADER_LEN + len;
        if buf.len() < total {
            return Err(FrameError::Truncated {
                expected: total,
                actual: buf.len(),
            });
        }
        let mut code = [0u8; ACTION_LEN];
        code.copy_from_slice(&buf[..ACTION_LEN]);
        Ok(Self {
            code,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
        })
    }

    /// Action code rendered for logs.
    pub fn code_str(&self) -> String {
        String::from_utf8_lossy(&self.code).into_owned()
    }
}

/// Encode a JSON response frame `[len][json]`.
pub fn encode_response<T: Serialize>(body: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(body).map_err(|e| FrameError::Json(e.to_string()))?;
    encode_sized(&payload)
}

/// Encode `[len][bytes]`.
pub fn encode_sized(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(data.len()));
    }
    let mut out = Vec::with_capacity(LENGTH_LEN + data.len());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Split `[len][bytes]` into socket writes of at most [`CHUNK_SIZE`] bytes.
///
/// The first write carries the prefix, so it holds `CHUNK_SIZE - 2` data bytes.
pub fn sized_chunks(data: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
    let encoded = encode_sized(data)?;
    Ok(encoded.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect())
}

/// Split a length-prefixed record off the front of `buf` once it is complete.
///
/// `len_offset` is where the 16-bit length sits; the payload follows it.
fn take_prefixed(buf: &mut BytesMut, len_offset: usize) -> Option<(Bytes, Bytes)> {
    let header = len_offset + LENGTH_LEN;
    if buf.len() < header {
        return None;
    }
    let len = u16::from_be_bytes([buf[len_offset], buf[len_offset + 1]]) as usize;
    if buf.len() < header + len {
        buf.reserve(header + len - buf.len());
        return None;
    }
    let prefix = buf.split_to(len_offset).freeze();
    buf.advance(LENGTH_LEN);
    let payload = buf.split_to(len).freeze();
    Some((prefix, payload))
}

/// Accumulates bytes from successive socket reads into application frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    /// Append bytes received from the peer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Mutable access for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.reserve(CHUNK_SIZE);
        &mut self.buf
    }

    /// Pop the next complete frame, if one has fully arrived.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let (code, payload) = take_prefixed(&mut self.buf, ACTION_LEN)?;
        let mut raw = [0u8; ACTION_LEN];
        raw.copy_from_slice(&code);
        Some(Frame { code: raw, payload })
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Accumulates bytes from successive socket reads into response payloads.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    buf: BytesMut,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.reserve(CHUNK_SIZE);
        &mut self.buf
    }

    /// Pop the next complete response payload.
    pub fn next_response(&mut self) -> Option<Bytes> {
        take_prefixed(&mut self.buf, 0).map(|(_, payload)| payload)
    }
}

/// Gateway liveness announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub gateway_id: String,
    pub ip: String,
    pub port: u16,
    pub sequence: u16,
}

impl Heartbeat {
    pub fn encode(&self) -> Result<[u8; HEARTBEAT_LEN], FrameError> {
        let mut out = [0u8; HEARTBEAT_LEN];
        pad_text(&mut out[..GATEWAY_ID_LEN], &self.gateway_id, "gateway_id")?;
        pad_text(
            &mut out[GATEWAY_ID_LEN..GATEWAY_ID_LEN + IP_LEN],
            &self.ip,
            "ip",
        )?;
        let port_at = GATEWAY_ID_LEN + IP_LEN;
        out[port_at..port_at + 2].copy_from_slice(&self.port.to_be_bytes());
        out[port_at + 2..].copy_from_slice(&self.sequence.to_be_bytes());
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEARTBEAT_LEN {
            return Err(FrameError::Truncated {
                expected: HEARTBEAT_LEN,
                actual: buf.len(),
            });
        }
        let port_at = GATEWAY_ID_LEN + IP_LEN;
        Ok(Self {
            gateway_id: strip_text(&buf[..GATEWAY_ID_LEN], "gateway_id")?,
            ip: strip_text(&buf[GATEWAY_ID_LEN..port_at], "ip")?,
            port: u16::from_be_bytes([buf[port_at], buf[port_at + 1]]),
            sequence: u16::from_be_bytes([buf[port_at + 2], buf[port_at + 3]]),
        })
    }
}

fn pad_text(dst: &mut [u8], text: &str, field: &'static str) -> Result<(), FrameError> {
    let bytes = text.as_bytes();
    if bytes.len() > dst.len() {
        return Err(FrameError::FieldTooLong {
            field,
            width: dst.len(),
        });
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn strip_text(src: &[u8], field: &'static str) -> Result<String, FrameError> {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end])
        .map(str::to_string)
        .map_err(|_| FrameError::InvalidText(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_roundtrip_preserves_action_and_payload() {
        let frame = Frame::json(Action::NodesGet, &json!({"token": "abc"})).unwrap();
        let bytes = frame.encode().unwrap();

        assert_eq!(&bytes[..3], b"NGE");
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.action(), Some(Action::NodesGet));
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_split_frame_decodes_like_whole_frame() {
        let frame = Frame::json(
            Action::SlotsSave,
            &json!({"token": "t", "slots": [{"start": "a", "end": "b"}]}),
        )
        .unwrap();
        let bytes = frame.encode().unwrap();

        let mut whole = FrameBuffer::new();
        whole.extend(&bytes);
        let expected = whole.next_frame().unwrap();

        for split in [1, HEADER_LEN - 1, HEADER_LEN, HEADER_LEN + 4, bytes.len() - 1] {
            let mut buffer = FrameBuffer::new();
            buffer.extend(&bytes[..split]);
            assert!(buffer.next_frame().is_none(), "split at {}", split);
            buffer.extend(&bytes[split..]);
            assert_eq!(buffer.next_frame().unwrap(), expected);
            assert_eq!(buffer.pending(), 0);
        }
    }

    #[test]
    fn test_buffer_yields_back_to_back_frames() {
        let a = Frame::json(Action::NodesGet, &json!({"token": "a"})).unwrap();
        let b = Frame::json(Action::ImagesGet, &json!({"token": "b"})).unwrap();
        let mut bytes = a.encode().unwrap();
        bytes.extend(b.encode().unwrap());

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes);
        assert_eq!(buffer.next_frame().unwrap(), a);
        assert_eq!(buffer.next_frame().unwrap(), b);
        assert!(buffer.next_frame().is_none());
    }

    #[test]
    fn test_decode_short_frame_fails_cleanly() {
        assert!(matches!(
            Frame::decode(b"NG"),
            Err(FrameError::Truncated { expected: 5, actual: 2 })
        ));
        assert!(matches!(
            Frame::decode(b"NGE\x00\x10{}"),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_action_is_kept_raw() {
        let frame = Frame::decode(b"XYZ\x00\x02{}").unwrap();
        assert_eq!(frame.action(), None);
        assert_eq!(frame.code_str(), "XYZ");
    }

    #[test]
    fn test_malformed_json_is_an_error_not_a_panic() {
        let frame = Frame::decode(b"NGE\x00\x03{x}").unwrap();
        let parsed: Result<serde_json::Value, _> = frame.parse();
        assert!(matches!(parsed, Err(FrameError::Json(_))));
    }

    #[test]
    fn test_response_buffer_partial_reads() {
        let bytes = encode_response(&json!({"status": 200})).unwrap();
        let mut buffer = ResponseBuffer::new();
        buffer.extend(&bytes[..1]);
        assert!(buffer.next_response().is_none());
        buffer.extend(&bytes[1..]);
        let payload = buffer.next_response().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["status"], 200);
    }

    #[test]
    fn test_payload_too_large() {
        let data = vec![b'a'; MAX_PAYLOAD + 1];
        assert_eq!(
            encode_sized(&data),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_sized_chunks_prefix_covers_total_size() {
        let data = vec![7u8; 3000];
        let chunks = sized_chunks(&data).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0][..2], &3000u16.to_be_bytes());
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[1].len(), CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 3000 + 2 - 2 * CHUNK_SIZE);

        let mut buffer = ResponseBuffer::new();
        for chunk in &chunks {
            buffer.extend(chunk);
        }
        assert_eq!(buffer.next_response().unwrap().len(), 3000);
    }

    #[test]
    fn test_heartbeat_layout() {
        let hb = Heartbeat {
            gateway_id: "gw01".to_string(),
            ip: "10.0.0.7".to_string(),
            port: 5001,
            sequence: 3,
        };
        let bytes = hb.encode().unwrap();

        assert_eq!(bytes.len(), HEARTBEAT_LEN);
        assert_eq!(&bytes[..4], b"gw01");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[24..26], &5001u16.to_be_bytes());
        assert_eq!(&bytes[26..28], &3u16.to_be_bytes());
        assert_eq!(Heartbeat::decode(&bytes).unwrap(), hb);
    }

    #[test]
    fn test_heartbeat_full_width_fields() {
        let hb = Heartbeat {
            gateway_id: "ABCDEFGH".to_string(),
            ip: "255.255.255.255".to_string(),
            port: 1,
            sequence: u16::MAX,
        };
        let decoded = Heartbeat::decode(&hb.encode().unwrap()).unwrap();
        assert_eq!(decoded.gateway_id, "ABCDEFGH");
        assert_eq!(decoded.sequence, u16::MAX);
    }

    #[test]
    fn test_heartbeat_rejects_long_id_and_short_datagram() {
        let hb = Heartbeat {
            gateway_id: "way-too-long".to_string(),
            ip: "1.2.3.4".to_string(),
            port: 1,
            sequence: 1,
        };
        assert!(matches!(
            hb.encode(),
            Err(FrameError::FieldTooLong { field: "gateway_id", .. })
        ));
        assert!(matches!(
            Heartbeat::decode(&[0u8; 10]),
            Err(FrameError::Truncated { .. })
        ));
    }
}
