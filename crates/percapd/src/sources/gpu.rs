//! GPU hardware-counter source.
//!
//! A thin periodic sampler over the devfreq driver, created only when the
//! driver reports enabled counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::drivers::GpuDriver;
use crate::sender::{Sender, SenderError};
use crate::source::{encode_samples, CaptureClock, Source, SourceBuffer, SourceError};

/// Periodic sampler over the GPU driver.
pub struct GpuCounterSource {
    driver: Arc<GpuDriver>,
    poll_interval: Duration,
    clock: Arc<CaptureClock>,
    buffer: Arc<SourceBuffer>,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GpuCounterSource {
    pub fn new(
        driver: Arc<GpuDriver>,
        poll_interval: Duration,
        clock: Arc<CaptureClock>,
        data_ready: Arc<Semaphore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            poll_interval,
            clock,
            buffer: SourceBuffer::new(data_ready),
            token: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Source for GpuCounterSource {
    fn name(&self) -> &'static str {
        "gpu"
    }

    async fn prepare(&self) -> Result<(), SourceError> {
        if self.driver.sample().is_empty() {
            return Err(SourceError::Unavailable {
                what: "GPU counters",
                reason: "no readable devfreq counters".into(),
            });
        }
        Ok(())
    }

    fn start(&self) {
        let driver = self.driver.clone();
        let clock = self.clock.clone();
        let buffer = self.buffer.clone();
        let token = self.token.clone();
        let finished = self.finished.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut tick = interval(poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let samples = driver.sample();
                        if !samples.is_empty() {
                            buffer.push(encode_samples(clock.now_ns(), &samples));
                        }
                    }
                }
            }
            finished.store(true, Ordering::Release);
            debug!("GPU source sampler finished");
        });
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
        self.finished.load(Ordering::Acquire) && self.buffer.is_empty()
    }

    async fn join(&self) {
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!("GPU source sampler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_fails_without_counters() {
        // A freshly discovered driver has no claimed counters, so sampling
        // yields nothing and prepare must refuse.
        let driver = Arc::new(GpuDriver::discover());
        let source = GpuCounterSource::new(
            driver.clone(),
            Duration::from_millis(10),
            CaptureClock::new(),
            Arc::new(Semaphore::new(0)),
        );
        if driver.counters_enabled() {
            // A real devfreq device exists on this host; nothing to assert.
            return;
        }
        assert!(source.prepare().await.is_err());
    }
}
