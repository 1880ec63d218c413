//! Daemon → client response frames.
//!
//! Each frame is one type byte, a little-endian `u32` payload length, and
//! the payload. An empty `ApcData` frame is the end-of-capture marker and
//! is guaranteed by the sender to be the last frame on the wire.

use bytes::{BufMut, BytesMut};

/// Length of a response frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 5;

/// Frame types emitted by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Structured metadata (setup phase).
    Xml = 1,
    /// Capture data; empty payload marks end of capture.
    ApcData = 3,
    /// Acknowledgement (response to PING).
    Ack = 4,
    /// Negative acknowledgement.
    Nak = 5,
    /// Last error message before the connection closes.
    Error = 255,
}

/// Encodes one frame into its wire form.
pub fn encode_frame(kind: FrameType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(kind as u8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf
}
