//! External source: byte stream from the tracefs pipe.
//!
//! Created before every other secondary source; kernel trace data that
//! arrives late relative to the other clocks causes time-sync drift in the
//! consumer, so the pipe must be open before the drain starts. When ftrace
//! is not enabled for the session the source idles and only completes on
//! interrupt.
//!
//! The pipe is opened non-blocking and read on a short cadence: a blocking
//! read of trace_pipe parks until data arrives and would outlive an
//! interrupt.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sender::{Sender, SenderError};
use crate::source::{Source, SourceBuffer, SourceError};

/// Default tracefs pipe location.
pub const TRACE_PIPE: &str = "/sys/kernel/tracing/trace_pipe";

const READ_CHUNK: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Streams raw trace bytes into the capture.
pub struct FtraceSource {
    enabled: bool,
    pipe_path: PathBuf,
    pipe: Mutex<Option<File>>,
    buffer: Arc<SourceBuffer>,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FtraceSource {
    pub fn new(enabled: bool, data_ready: Arc<Semaphore>) -> Arc<Self> {
        Self::with_pipe(enabled, PathBuf::from(TRACE_PIPE), data_ready)
    }

    pub fn with_pipe(enabled: bool, pipe_path: PathBuf, data_ready: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            pipe_path,
            pipe: Mutex::new(None),
            buffer: SourceBuffer::new(data_ready),
            token: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    async fn reader_loop(
        mut pipe: File,
        buffer: Arc<SourceBuffer>,
        token: CancellationToken,
        finished: Arc<AtomicBool>,
    ) {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if token.is_cancelled() {
                break;
            }
            match pipe.read(&mut chunk) {
                Ok(0) => {
                    // Nothing buffered in the pipe right now.
                }
                Ok(n) => {
                    buffer.push(Bytes::copy_from_slice(&chunk[..n]));
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!(error = %e, "trace pipe read failed");
                    break;
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
        finished.store(true, Ordering::Release);
        debug!("External source reader finished");
    }
}

#[async_trait]
impl Source for FtraceSource {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn prepare(&self) -> Result<(), SourceError> {
        if !self.enabled {
            return Ok(());
        }
        let pipe = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.pipe_path)
            .map_err(|e| SourceError::Unavailable {
                what: "trace pipe",
                reason: format!("{}: {e}", self.pipe_path.display()),
            })?;
        if let Ok(mut slot) = self.pipe.lock() {
            *slot = Some(pipe);
        }
        Ok(())
    }

    fn start(&self) {
        if !self.enabled {
            return;
        }
        let pipe = self.pipe.lock().ok().and_then(|mut slot| slot.take());
        let Some(pipe) = pipe else {
            warn!("External source started without a prepared pipe");
            self.finished.store(true, Ordering::Release);
            return;
        };
        let handle = tokio::spawn(Self::reader_loop(
            pipe,
            self.buffer.clone(),
            self.token.clone(),
            self.finished.clone(),
        ));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    async fn write_to(&self, sender: &mut Sender) -> Result<(), SenderError> {
        self.buffer.write_to(sender).await
    }

    fn interrupt(&self) {
        self.token.cancel();
    }

    fn is_done(&self) -> bool {
        let producer_done = if self.enabled {
            self.finished.load(Ordering::Acquire)
        } else {
            self.token.is_cancelled()
        };
        producer_done && self.buffer.is_empty()
    }

    async fn join(&self) {
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!("External source reader panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn temp_pipe(contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "percap-trace-{}-{}",
            std::process::id(),
            contents.len()
        ));
        std::fs::write(&path, contents).expect("write fixture");
        path
    }

    #[tokio::test]
    async fn test_disabled_source_completes_on_interrupt() {
        let source = FtraceSource::new(false, Arc::new(Semaphore::new(0)));
        source.prepare().await.expect("prepare");
        source.start();
        assert!(!source.is_done());
        source.interrupt();
        assert!(source.is_done());
        source.join().await;
    }

    #[tokio::test]
    async fn test_enabled_source_streams_bytes() {
        let path = temp_pipe(b"trace data");
        let sem = Arc::new(Semaphore::new(0));
        let source = FtraceSource::with_pipe(true, path.clone(), sem);
        source.prepare().await.expect("prepare");
        source.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        source.interrupt();
        source.join().await;

        let (client, server) = tokio::io::duplex(1024);
        let mut sender = Sender::live(server);
        source.write_to(&mut sender).await.expect("drain");
        sender.flush().await.expect("flush");
        assert!(source.is_done());
        drop(sender);

        let mut bytes = Vec::new();
        let mut client = client;
        client.read_to_end(&mut bytes).await.expect("read");
        assert_eq!(&bytes[5..], b"trace data");

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_prepare_fails_when_pipe_missing() {
        let source = FtraceSource::with_pipe(
            true,
            PathBuf::from("/no/such/trace_pipe"),
            Arc::new(Semaphore::new(0)),
        );
        assert!(source.prepare().await.is_err());
    }
}
