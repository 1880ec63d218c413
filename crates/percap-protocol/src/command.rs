//! Client → daemon command headers.
//!
//! Every client command is a 5-byte header: one type byte followed by a
//! little-endian unsigned 32-bit length. The commands recognized during
//! capture (STOP, PING) define no body; START may carry a session-settings
//! payload during the setup exchange.

use bytes::{BufMut, BytesMut};

/// Length of a command header in bytes.
pub const COMMAND_HEADER_LEN: usize = 5;

/// Upper bound on a command body the daemon is willing to read.
///
/// Length is validated before allocation so a corrupt header cannot force
/// a large buffer.
pub const MAX_COMMAND_BODY: usize = 1_048_576;

/// Recognized command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    /// End the capture session.
    ApcStop = 0x01,
    /// Begin capture; may carry session settings during setup.
    ApcStart = 0x02,
    /// Liveness probe; acknowledged with an empty ACK frame.
    Ping = 0x03,
}

impl CommandType {
    /// Parses a type byte; unknown values return `None`.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::ApcStop),
            0x02 => Some(Self::ApcStart),
            0x03 => Some(Self::Ping),
            _ => None,
        }
    }
}

/// A decoded command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Raw type byte as received.
    pub raw_type: u8,
    /// Declared body length.
    pub length: u32,
}

impl CommandHeader {
    /// Decodes a header from its 5-byte wire form.
    pub fn parse(bytes: &[u8; COMMAND_HEADER_LEN]) -> Self {
        Self {
            raw_type: bytes[0],
            length: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        }
    }

    /// The recognized command type, if any.
    pub fn command(&self) -> Option<CommandType> {
        CommandType::from_byte(self.raw_type)
    }

    /// Encodes the header into its 5-byte wire form.
    pub fn encode(command: CommandType, length: u32) -> [u8; COMMAND_HEADER_LEN] {
        let mut out = [0u8; COMMAND_HEADER_LEN];
        out[0] = command as u8;
        out[1..5].copy_from_slice(&length.to_le_bytes());
        out
    }

    /// Encodes a full command (header plus body) for a client.
    pub fn encode_with_body(command: CommandType, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_LEN + body.len());
        buf.put_slice(&Self::encode(command, body.len() as u32));
        buf.put_slice(body);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        let header = CommandHeader::parse(&[0x03, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(header.command(), Some(CommandType::Ping));
        assert_eq!(header.length, 0);
    }

    #[test]
    fn test_parse_stop() {
        let header = CommandHeader::parse(&[0x01, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(header.command(), Some(CommandType::ApcStop));
        assert_eq!(header.length, 0);
    }

    #[test]
    fn test_length_is_little_endian() {
        let header = CommandHeader::parse(&[0x02, 0x01, 0x02, 0x00, 0x00]);
        assert_eq!(header.length, 0x0201);
    }

    #[test]
    fn test_unknown_type_preserved() {
        let header = CommandHeader::parse(&[0x7f, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(header.command(), None);
        assert_eq!(header.raw_type, 0x7f);
    }

    #[test]
    fn test_encode_round_trip() {
        let wire = CommandHeader::encode(CommandType::ApcStart, 17);
        let header = CommandHeader::parse(&wire);
        assert_eq!(header.command(), Some(CommandType::ApcStart));
        assert_eq!(header.length, 17);
    }

    #[test]
    fn test_encode_with_body_layout() {
        let buf = CommandHeader::encode_with_body(CommandType::ApcStart, b"{}");
        assert_eq!(&buf[..], &[0x02, 0x02, 0x00, 0x00, 0x00, b'{', b'}']);
    }
}
