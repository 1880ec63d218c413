//! The capture source contract and shared producer plumbing.
//!
//! A source produces framed records into its own buffer; the drain task,
//! woken by the shared data-ready semaphore, asks every source to flush
//! into the [`Sender`]. Lifecycle: `prepare` → `start` (or `run` for the
//! primary source) → repeated `write_to` → `interrupt` → `is_done` →
//! `join`. After `interrupt`, `is_done` must eventually become true even
//! if no further external events arrive, and `write_to` stays callable
//! until it does.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Semaphore;

use percap_core::ApcCounterKey;
use percap_protocol::FrameType;

use crate::sender::{Sender, SenderError};

/// Errors raised while preparing a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The backing facility is missing or unusable.
    #[error("{what} unavailable: {reason}")]
    Unavailable { what: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Abstract producer of capture data.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable source name for logs and errors.
    fn name(&self) -> &'static str;

    /// One-shot preparation; failure is fatal to the session.
    async fn prepare(&self) -> Result<(), SourceError>;

    /// Begins any background producer tasks.
    fn start(&self);

    /// Flushes buffered records to the sender.
    async fn write_to(&self, sender: &mut Sender) -> Result<(), SenderError>;

    /// Requests termination. Safe from any task and idempotent.
    fn interrupt(&self);

    /// True once the source will produce nothing more and its buffer has
    /// drained.
    fn is_done(&self) -> bool;

    /// Waits for background producer tasks to exit.
    async fn join(&self);
}

/// The one source whose hot loop drives the session, run synchronously on
/// the orchestrator task.
#[async_trait]
pub trait PrimarySource: Source {
    async fn run(&self);
}

/// Monotonic session clock; all record timestamps are nanoseconds since
/// capture start.
pub struct CaptureClock {
    start: Instant,
}

impl CaptureClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
        })
    }

    pub fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// One captured record: counter key, core, value.
pub type Sample = (ApcCounterKey, u32, u64);

/// Encodes a batch of samples taken at one timestamp into a wire chunk.
///
/// Record layout (little-endian): i32 key, u32 core, u64 timestamp-ns,
/// u64 value. Consumers correlate across sources by timestamp only.
pub fn encode_samples(timestamp_ns: u64, samples: &[Sample]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 24);
    for (key, core, value) in samples {
        buf.put_i32_le(*key);
        buf.put_u32_le(*core);
        buf.put_u64_le(timestamp_ns);
        buf.put_u64_le(*value);
    }
    buf.freeze()
}

/// Per-source record buffer feeding the drain task.
///
/// Producers push encoded chunks and post the shared data-ready semaphore;
/// the drain task flushes chunks in push order, which preserves the
/// per-source ordering guarantee.
pub struct SourceBuffer {
    queue: Mutex<VecDeque<Bytes>>,
    data_ready: Arc<Semaphore>,
}

impl SourceBuffer {
    pub fn new(data_ready: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            data_ready,
        })
    }

    /// Queues one chunk and wakes the drain task.
    pub fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(chunk);
        }
        self.data_ready.add_permits(1);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Drains every queued chunk into the sender as capture data frames.
    pub async fn write_to(&self, sender: &mut Sender) -> Result<(), SenderError> {
        loop {
            let chunk = match self.queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            sender.write_data(FrameType::ApcData, &chunk, true).await?;
        }
    }
}
