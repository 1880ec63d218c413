//! Percap Protocol - Wire protocol for capture-daemon communication
//!
//! This crate provides the binary framing used between an interactive
//! profiler client and the capture daemon:
//! - `command` - 5-byte command headers sent by the client
//! - `frame` - length-prefixed response frames emitted by the daemon
//!
//! Both directions share the same shape: one type byte followed by a
//! little-endian `u32` payload length. The payload encoding of capture
//! data frames is owned by the producing source and opaque here.

pub mod command;
pub mod frame;

pub use command::{CommandHeader, CommandType, COMMAND_HEADER_LEN, MAX_COMMAND_BODY};
pub use frame::{encode_frame, FrameType, FRAME_HEADER_LEN};
