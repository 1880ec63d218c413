//! The drain loop: single consumer moving source data into the sender.
//!
//! Gated by the pipeline-halt semaphore: in one-shot mode the gate opens
//! only when the session begins ending, so residual data flushes exactly
//! once; otherwise the gate starts open. Each pass waits on the shared
//! data-ready semaphore with a one-second timeout - the timeout is not an
//! error, it only bounds the stall if a producer forgets to post.
//!
//! In live mode the loop finishes with the end-of-capture marker (an empty
//! capture-data frame), guaranteed to be the last frame on the wire.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, trace};

use percap_protocol::FrameType;

use crate::sender::{Sender, SenderError};
use crate::source::{PrimarySource, Source};

const DATA_WAIT: Duration = Duration::from_secs(1);

/// Runs the drain until every source is done, then performs the final
/// flush and, in live mode, emits the end-of-capture marker.
pub async fn run(
    halt: Arc<Semaphore>,
    data_ready: Arc<Semaphore>,
    others: Vec<Arc<dyn Source>>,
    primary: Arc<dyn PrimarySource>,
    sender: Arc<Mutex<Sender>>,
    live: bool,
) -> Result<(), SenderError> {
    if let Ok(permit) = halt.acquire().await {
        permit.forget();
    }

    while !(others.iter().all(|s| s.is_done()) && primary.is_done()) {
        match timeout(DATA_WAIT, data_ready.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => {}
            Err(_) => trace!("Timeout waiting for capture data"),
        }
        flush_all(&others, &primary, &sender).await?;
    }

    // One more pass to clear up any slop.
    flush_all(&others, &primary, &sender).await?;

    if live {
        let mut sender = sender.lock().await;
        sender.write_data(FrameType::ApcData, &[], false).await?;
        sender.flush().await?;
    }

    debug!("Exit drain task");
    Ok(())
}

async fn flush_all(
    others: &[Arc<dyn Source>],
    primary: &Arc<dyn PrimarySource>,
    sender: &Arc<Mutex<Sender>>,
) -> Result<(), SenderError> {
    let mut sender = sender.lock().await;
    for source in others {
        source.write_to(&mut sender).await?;
    }
    primary.write_to(&mut sender).await?;
    sender.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceBuffer, SourceError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncReadExt;

    /// Source over a plain buffer, done once interrupted and drained.
    struct BufferSource {
        buffer: Arc<SourceBuffer>,
        interrupted: AtomicBool,
    }

    impl BufferSource {
        fn new(data_ready: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                buffer: SourceBuffer::new(data_ready),
                interrupted: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Source for BufferSource {
        fn name(&self) -> &'static str {
            "buffer"
        }
        async fn prepare(&self) -> Result<(), SourceError> {
            Ok(())
        }
        fn start(&self) {}
        async fn write_to(&self, sender: &mut Sender) -> Result<(), SenderError> {
            self.buffer.write_to(sender).await
        }
        fn interrupt(&self) {
            self.interrupted.store(true, Ordering::Release);
        }
        fn is_done(&self) -> bool {
            self.interrupted.load(Ordering::Acquire) && self.buffer.is_empty()
        }
        async fn join(&self) {}
    }

    #[async_trait]
    impl PrimarySource for BufferSource {
        async fn run(&self) {}
    }

    struct Fixture {
        data_ready: Arc<Semaphore>,
        halt: Arc<Semaphore>,
        primary: Arc<BufferSource>,
        other: Arc<BufferSource>,
    }

    fn fixture() -> Fixture {
        let data_ready = Arc::new(Semaphore::new(0));
        Fixture {
            halt: Arc::new(Semaphore::new(0)),
            primary: BufferSource::new(data_ready.clone()),
            other: BufferSource::new(data_ready.clone()),
            data_ready,
        }
    }

    async fn read_frames(mut client: tokio::io::DuplexStream) -> Vec<(u8, Vec<u8>)> {
        let mut bytes = Vec::new();
        client.read_to_end(&mut bytes).await.expect("read");
        let mut frames = Vec::new();
        let mut rest = &bytes[..];
        while rest.len() >= 5 {
            let kind = rest[0];
            let len = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
            frames.push((kind, rest[5..5 + len].to_vec()));
            rest = &rest[5 + len..];
        }
        assert!(rest.is_empty(), "trailing partial frame");
        frames
    }

    #[tokio::test]
    async fn test_one_shot_holds_until_halt_posted() {
        let fx = fixture();
        let (client, server) = tokio::io::duplex(65536);
        let sender = Arc::new(Mutex::new(Sender::live(server)));

        fx.primary.buffer.push(Bytes::from_static(b"held"));
        let drain = tokio::spawn(run(
            fx.halt.clone(),
            fx.data_ready.clone(),
            vec![fx.other.clone() as Arc<dyn Source>],
            fx.primary.clone() as Arc<dyn PrimarySource>,
            sender.clone(),
            true,
        ));

        // Gate closed: nothing may reach the wire yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fx.primary.buffer.is_empty(), "data must be held back");

        // End of session: interrupt sources, open the gate once.
        fx.primary.interrupt();
        fx.other.interrupt();
        fx.halt.add_permits(1);

        drain.await.expect("join").expect("drain");
        drop(sender);

        let frames = read_frames(client).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (3, b"held".to_vec()));
        assert_eq!(frames[1], (3, Vec::new()), "end marker is last and empty");
    }

    #[tokio::test]
    async fn test_streams_then_emits_single_end_marker() {
        let fx = fixture();
        let (client, server) = tokio::io::duplex(65536);
        let sender = Arc::new(Mutex::new(Sender::live(server)));

        // Streaming mode: the gate starts open.
        fx.halt.add_permits(2);
        fx.other.buffer.push(Bytes::from_static(b"one"));

        let drain = tokio::spawn(run(
            fx.halt.clone(),
            fx.data_ready.clone(),
            vec![fx.other.clone() as Arc<dyn Source>],
            fx.primary.clone() as Arc<dyn PrimarySource>,
            sender.clone(),
            true,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.other.buffer.is_empty(), "streamed while capturing");

        fx.other.buffer.push(Bytes::from_static(b"two"));
        fx.primary.interrupt();
        fx.other.interrupt();

        drain.await.expect("join").expect("drain");
        drop(sender);

        let frames = read_frames(client).await;
        let payloads: Vec<_> = frames.iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]);
        let markers = frames
            .iter()
            .filter(|(kind, payload)| *kind == 3 && payload.is_empty())
            .count();
        assert_eq!(markers, 1, "exactly one end-of-capture marker");
    }

    #[tokio::test]
    async fn test_local_mode_writes_no_end_marker() {
        let fx = fixture();
        let dir = std::env::temp_dir().join(format!("percap-drain-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let mut local = Sender::local();
        local.create_data_file(&dir).await.expect("data file");
        let sender = Arc::new(Mutex::new(local));

        fx.halt.add_permits(2);
        fx.primary.buffer.push(Bytes::from_static(b"xy"));
        fx.primary.interrupt();
        fx.other.interrupt();

        run(
            fx.halt.clone(),
            fx.data_ready.clone(),
            vec![fx.other.clone() as Arc<dyn Source>],
            fx.primary.clone() as Arc<dyn PrimarySource>,
            sender.clone(),
            false,
        )
        .await
        .expect("drain");

        sender.lock().await.shutdown().await.expect("shutdown");
        let bytes = std::fs::read(dir.join(crate::sender::DATA_FILE_NAME)).expect("read");
        // Length-prefixed payload, no end marker appended.
        assert_eq!(bytes, vec![2, 0, 0, 0, b'x', b'y']);
        std::fs::remove_dir_all(&dir).ok();
    }
}
