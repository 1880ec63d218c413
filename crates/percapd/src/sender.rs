//! Single writer of framed data to the capture sink.
//!
//! The [`Sender`] is the only component that touches the sink. In live mode
//! the sink is the write half of the client socket and every write is a
//! framed response; in local mode the sink is the capture data file inside
//! the target directory and only capture data reaches it. The drain task
//! enforces the single-writer discipline during capture by holding the
//! sender mutex across each flush pass.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::trace;

use percap_protocol::{encode_frame, FrameType};

/// Name of the capture data file inside a local capture directory.
pub const DATA_FILE_NAME: &str = "capture.bin";

/// Errors raised while writing to the sink.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("Sink write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Capture data was written before the data file was created.
    #[error("No capture data file open")]
    NoDataFile,
}

enum Sink {
    /// Live client socket (write half).
    Live(Box<dyn AsyncWrite + Send + Unpin>),
    /// Local capture data file; `None` until [`Sender::create_data_file`].
    Local(Option<BufWriter<File>>),
}

/// Serializes framed data units onto one sink.
pub struct Sender {
    sink: Sink,
}

impl Sender {
    /// Creates a sender writing framed responses to a live client.
    pub fn live(stream: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            sink: Sink::Live(Box::new(stream)),
        }
    }

    /// Creates a sender for a local capture; the data file is opened later
    /// once the capture directory exists.
    pub fn local() -> Self {
        Self {
            sink: Sink::Local(None),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.sink, Sink::Live(_))
    }

    /// Opens the capture data file inside the target directory.
    pub async fn create_data_file(&mut self, capture_dir: &Path) -> Result<(), SenderError> {
        if let Sink::Local(file) = &mut self.sink {
            let path = capture_dir.join(DATA_FILE_NAME);
            *file = Some(BufWriter::new(File::create(&path).await?));
        }
        Ok(())
    }

    /// Writes one data unit.
    ///
    /// Live mode always emits the full frame (type byte, little-endian
    /// length, payload). Local mode writes the payload into the data file,
    /// preceded by the length field when `write_length_field` is set;
    /// non-data frames have no meaning on disk and are dropped.
    pub async fn write_data(
        &mut self,
        kind: FrameType,
        payload: &[u8],
        write_length_field: bool,
    ) -> Result<(), SenderError> {
        match &mut self.sink {
            Sink::Live(stream) => {
                let frame = encode_frame(kind, payload);
                stream.write_all(&frame).await?;
            }
            Sink::Local(file) => {
                if kind != FrameType::ApcData {
                    trace!(kind = ?kind, "Dropping non-data frame in local capture");
                    return Ok(());
                }
                let file = file.as_mut().ok_or(SenderError::NoDataFile)?;
                if write_length_field {
                    file.write_all(&(payload.len() as u32).to_le_bytes()).await?;
                }
                file.write_all(payload).await?;
            }
        }
        Ok(())
    }

    /// Flushes buffered bytes through to the sink.
    pub async fn flush(&mut self) -> Result<(), SenderError> {
        match &mut self.sink {
            Sink::Live(stream) => stream.flush().await?,
            Sink::Local(Some(file)) => file.flush().await?,
            Sink::Local(None) => {}
        }
        Ok(())
    }

    /// Flushes and shuts the sink down. In live mode this half-closes the
    /// socket so the client observes end of stream after the last frame.
    pub async fn shutdown(&mut self) -> Result<(), SenderError> {
        match &mut self.sink {
            Sink::Live(stream) => {
                stream.flush().await?;
                stream.shutdown().await?;
            }
            Sink::Local(file) => {
                if let Some(file) = file {
                    file.flush().await?;
                    file.get_mut().sync_all().await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_live_write_is_framed() {
        let (client, server) = tokio::io::duplex(256);
        let mut sender = Sender::live(server);
        sender
            .write_data(FrameType::Ack, &[], false)
            .await
            .expect("write");
        sender.flush().await.expect("flush");
        drop(sender);

        let mut read = Vec::new();
        let mut client = client;
        client.read_to_end(&mut read).await.expect("read");
        assert_eq!(read, vec![4, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_live_error_frame_carries_message() {
        let (client, server) = tokio::io::duplex(256);
        let mut sender = Sender::live(server);
        sender
            .write_data(FrameType::Error, b"bad", true)
            .await
            .expect("write");
        drop(sender);

        let mut read = Vec::new();
        let mut client = client;
        client.read_to_end(&mut read).await.expect("read");
        assert_eq!(read[0], 255);
        assert_eq!(u32::from_le_bytes([read[1], read[2], read[3], read[4]]), 3);
        assert_eq!(&read[5..], b"bad");
    }

    #[tokio::test]
    async fn test_local_requires_data_file() {
        let mut sender = Sender::local();
        let err = sender
            .write_data(FrameType::ApcData, &[1, 2, 3], true)
            .await
            .expect_err("no file yet");
        assert!(matches!(err, SenderError::NoDataFile));
    }

    #[tokio::test]
    async fn test_local_write_and_length_field() {
        let dir = std::env::temp_dir().join(format!("percap-sender-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir");

        let mut sender = Sender::local();
        sender.create_data_file(&dir).await.expect("create");
        sender
            .write_data(FrameType::ApcData, &[9, 9], true)
            .await
            .expect("write");
        // Non-data frames never reach the file.
        sender
            .write_data(FrameType::Ack, &[], false)
            .await
            .expect("ack dropped");
        sender.shutdown().await.expect("shutdown");

        let bytes = std::fs::read(dir.join(DATA_FILE_NAME)).expect("read back");
        assert_eq!(bytes, vec![2, 0, 0, 0, 9, 9]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
