//! Control channel: command frames read from the live client socket.
//!
//! The client drives the daemon with 5-byte command headers (one type byte,
//! little-endian u32 length). During capture only STOP and PING are
//! meaningful: STOP ends the session, PING is acknowledged with an empty
//! ACK frame by the caller. Anything else is logged and ignored. During the
//! setup exchange a START command is additionally accepted and may carry a
//! session-settings body.
//!
//! State machine: Listening → (STOP | socket closed) → Terminating, with
//! PING as a self-loop. A non-zero length on STOP or PING is a protocol
//! violation that is logged; the body bytes are not drained.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use percap_core::SessionSettings;
use percap_protocol::{CommandHeader, CommandType, COMMAND_HEADER_LEN, MAX_COMMAND_BODY};

/// Events surfaced to the stop task during capture.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlEvent {
    /// APC_STOP received; the session must end.
    Stop,
    /// PING received; the caller replies with an empty ACK frame.
    Ping,
    /// The client disconnected.
    Closed,
}

/// Events surfaced during the pre-capture setup exchange.
#[derive(Debug, PartialEq, Eq)]
pub enum SetupEvent {
    /// APC_START received; capture begins. Settings may accompany it.
    Start(Option<SessionSettings>),
    /// APC_STOP received before capture started.
    Stop,
    /// PING received; the caller replies with an empty ACK frame.
    Ping,
    /// The client disconnected.
    Closed,
}

/// Reader of client command frames.
pub struct ControlChannel {
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ControlChannel {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    /// Reads one command header; `None` on disconnect.
    async fn read_header(&mut self) -> Option<CommandHeader> {
        let mut bytes = [0u8; COMMAND_HEADER_LEN];
        match self.reader.read_exact(&mut bytes).await {
            Ok(_) => Some(CommandHeader::parse(&bytes)),
            Err(e) => {
                debug!(error = %e, "Control channel read failed");
                None
            }
        }
    }

    /// Returns the next meaningful event during capture.
    ///
    /// Unknown command types and malformed lengths are logged here and the
    /// channel keeps listening.
    pub async fn next_capture_event(&mut self) -> ControlEvent {
        loop {
            let Some(header) = self.read_header().await else {
                return ControlEvent::Closed;
            };
            match header.command() {
                Some(CommandType::ApcStop) | Some(CommandType::Ping) if header.length != 0 => {
                    warn!(
                        length = header.length,
                        "Received STOP or PING command with non-zero length"
                    );
                }
                Some(CommandType::ApcStop) => return ControlEvent::Stop,
                Some(CommandType::Ping) => return ControlEvent::Ping,
                Some(CommandType::ApcStart) => {
                    warn!("Received START command during capture");
                }
                None => {
                    warn!(command = header.raw_type, "Received unknown command type");
                }
            }
        }
    }

    /// Returns the next meaningful event during the setup exchange.
    pub async fn next_setup_event(&mut self) -> SetupEvent {
        loop {
            let Some(header) = self.read_header().await else {
                return SetupEvent::Closed;
            };
            match header.command() {
                Some(CommandType::ApcStart) => {
                    let settings = match self.read_start_body(header.length).await {
                        Ok(settings) => settings,
                        Err(()) => return SetupEvent::Closed,
                    };
                    return SetupEvent::Start(settings);
                }
                Some(CommandType::ApcStop) | Some(CommandType::Ping) if header.length != 0 => {
                    warn!(
                        length = header.length,
                        "Received STOP or PING command with non-zero length"
                    );
                }
                Some(CommandType::ApcStop) => return SetupEvent::Stop,
                Some(CommandType::Ping) => return SetupEvent::Ping,
                None => {
                    warn!(command = header.raw_type, "Received unknown command type");
                }
            }
        }
    }

    /// Reads the optional settings body of a START command.
    async fn read_start_body(&mut self, length: u32) -> Result<Option<SessionSettings>, ()> {
        if length == 0 {
            return Ok(None);
        }
        let length = length as usize;
        if length > MAX_COMMAND_BODY {
            warn!(length, max = MAX_COMMAND_BODY, "START body too large");
            return Err(());
        }
        let mut body = vec![0u8; length];
        if let Err(e) = self.reader.read_exact(&mut body).await {
            debug!(error = %e, "Failed reading START body");
            return Err(());
        }
        match SessionSettings::from_json(&body) {
            Ok(settings) => Ok(Some(settings)),
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable session settings");
                Ok(None)
            }
        }
    }

    /// Reads one byte from the client. Used on the fatal path when the
    /// client is owed a response and must observe the ERROR frame before
    /// the socket closes.
    pub async fn read_ack_byte(&mut self) {
        let mut discard = [0u8; 1];
        let _ = self.reader.read_exact(&mut discard).await;
    }
}
