//! User-space polled source.
//!
//! Samples every polled driver on a fixed interval from one background
//! task. Only started when at least one polled driver has enabled
//! counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::drivers::PolledDriver;
use crate::sender::{Sender, SenderError};
use crate::source::{
    encode_samples, CaptureClock, Sample, Source, SourceBuffer, SourceError,
};

/// Periodic sampler over the polled drivers.
pub struct PolledSource {
    drivers: Vec<Arc<dyn PolledDriver>>,
    poll_interval: Duration,
    clock: Arc<CaptureClock>,
    buffer: Arc<SourceBuffer>,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PolledSource {
    /// True when the source should exist for this session.
    pub fn should_start(drivers: &[Arc<dyn PolledDriver>]) -> bool {
        drivers.iter().any(|d| d.counters_enabled())
    }

    pub fn new(
        drivers: Vec<Arc<dyn PolledDriver>>,
        poll_interval: Duration,
        clock: Arc<CaptureClock>,
        data_ready: Arc<Semaphore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            drivers,
            poll_interval,
            clock,
            buffer: SourceBuffer::new(data_ready),
            token: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    fn sample_all(drivers: &[Arc<dyn PolledDriver>], clock: &CaptureClock, buffer: &SourceBuffer) {
        let mut samples: Vec<Sample> = Vec::new();
        for driver in drivers {
            if driver.counters_enabled() {
                samples.extend(driver.sample());
            }
        }
        if !samples.is_empty() {
            buffer.push(encode_samples(clock.now_ns(), &samples));
        }
    }
}

#[async_trait]
impl Source for PolledSource {
    fn name(&self) -> &'static str {
        "userspace"
    }

    async fn prepare(&self) -> Result<(), SourceError> {
        Ok(())
    }

    fn start(&self) {
        let drivers = self.drivers.clone();
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
                    _ = tick.tick() => Self::sample_all(&drivers, &clock, &buffer),
                }
            }
            // One closing sample so short captures record at least one
            // value per counter.
            Self::sample_all(&drivers, &clock, &buffer);
            finished.store(true, Ordering::Release);
            debug!("Polled source sampler finished");
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
                warn!("Polled source sampler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::Driver;
    use percap_core::{ApcCounterKey, CounterConfig};

    struct FixedDriver;

    impl Driver for FixedDriver {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn reset_counters(&self) {}
        fn claim_counter(&self, _config: &CounterConfig, _key: ApcCounterKey) -> bool {
            false
        }
    }

    impl PolledDriver for FixedDriver {
        fn counters_enabled(&self) -> bool {
            true
        }
        fn sample(&self) -> Vec<Sample> {
            vec![(9, 0, 1234)]
        }
    }

    #[test]
    fn test_should_start_requires_enabled_counters() {
        struct Disabled;
        impl Driver for Disabled {
            fn name(&self) -> &'static str {
                "off"
            }
            fn reset_counters(&self) {}
            fn claim_counter(&self, _c: &CounterConfig, _k: ApcCounterKey) -> bool {
                false
            }
        }
        impl PolledDriver for Disabled {
            fn counters_enabled(&self) -> bool {
                false
            }
            fn sample(&self) -> Vec<Sample> {
                Vec::new()
            }
        }

        assert!(!PolledSource::should_start(&[
            Arc::new(Disabled) as Arc<dyn PolledDriver>
        ]));
        assert!(PolledSource::should_start(&[
            Arc::new(Disabled) as Arc<dyn PolledDriver>,
            Arc::new(FixedDriver),
        ]));
    }

    #[tokio::test]
    async fn test_samples_until_interrupted() {
        let source = PolledSource::new(
            vec![Arc::new(FixedDriver) as Arc<dyn PolledDriver>],
            Duration::from_millis(5),
            CaptureClock::new(),
            Arc::new(Semaphore::new(0)),
        );
        source.prepare().await.expect("prepare");
        source.start();

        tokio::time::sleep(Duration::from_millis(25)).await;
        source.interrupt();
        source.join().await;

        assert!(!source.buffer.is_empty());
        assert!(!source.is_done(), "pending data keeps the source live");

        let (_client, server) = tokio::io::duplex(4096);
        let mut sender = Sender::live(server);
        source.write_to(&mut sender).await.expect("drain");
        assert!(source.is_done());
    }
}
