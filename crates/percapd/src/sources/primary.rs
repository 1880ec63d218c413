//! The primary capture source: CPU counters sampled from `/proc/stat`.
//!
//! Unlike the other sources, the primary source's hot loop runs
//! synchronously on the orchestrator task; the session lasts as long as
//! `run` does. The started-callback fires once, right before the first
//! sample, releasing the duration gate and resuming the capture command.
//! In one-shot mode the source ends the session itself once its buffer
//! reaches the chunk limit.

use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use percap_core::ApcCounterKey;

use crate::capture::StopHandle;
use crate::drivers::cpu::CpuCounterKind;
use crate::sender::{Sender, SenderError};
use crate::source::{
    encode_samples, CaptureClock, PrimarySource, Sample, Source, SourceBuffer, SourceError,
};

/// Buffered chunks before a one-shot capture ends itself.
const ONE_SHOT_CHUNK_LIMIT: usize = 4096;

/// Cumulative counters parsed from one `/proc/stat` read, in
/// [`CpuCounterKind`] declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStatSnapshot {
    values: [u64; 9],
}

impl CpuStatSnapshot {
    /// Parses the fields of interest out of `/proc/stat` text.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut snapshot = Self::default();
        let mut saw_cpu_line = false;
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("cpu") => {
                    let mut next = || fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                    snapshot.values[Self::index(CpuCounterKind::User)] = next();
                    snapshot.values[Self::index(CpuCounterKind::Nice)] = next();
                    snapshot.values[Self::index(CpuCounterKind::System)] = next();
                    snapshot.values[Self::index(CpuCounterKind::Idle)] = next();
                    snapshot.values[Self::index(CpuCounterKind::Iowait)] = next();
                    snapshot.values[Self::index(CpuCounterKind::Irq)] = next();
                    snapshot.values[Self::index(CpuCounterKind::Softirq)] = next();
                    saw_cpu_line = true;
                }
                Some("ctxt") => {
                    snapshot.values[Self::index(CpuCounterKind::ContextSwitches)] =
                        fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                }
                Some("processes") => {
                    snapshot.values[Self::index(CpuCounterKind::ProcessesForked)] =
                        fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                }
                _ => {}
            }
        }
        saw_cpu_line.then_some(snapshot)
    }

    fn index(kind: CpuCounterKind) -> usize {
        match kind {
            CpuCounterKind::User => 0,
            CpuCounterKind::Nice => 1,
            CpuCounterKind::System => 2,
            CpuCounterKind::Idle => 3,
            CpuCounterKind::Iowait => 4,
            CpuCounterKind::Irq => 5,
            CpuCounterKind::Softirq => 6,
            CpuCounterKind::ContextSwitches => 7,
            CpuCounterKind::ProcessesForked => 8,
        }
    }

    pub fn value(&self, kind: CpuCounterKind) -> u64 {
        self.values[Self::index(kind)]
    }

    /// Per-counter delta since `earlier`.
    pub fn delta_from(&self, earlier: &Self) -> Self {
        let mut delta = Self::default();
        for i in 0..self.values.len() {
            delta.values[i] = self.values[i].saturating_sub(earlier.values[i]);
        }
        delta
    }
}

/// Everything the driver hands a newly created primary source.
pub struct PrimaryArgs {
    pub data_ready: Arc<Semaphore>,
    pub clock: Arc<CaptureClock>,
    /// Fired once when capture actually starts.
    pub started: Box<dyn FnOnce() + Send>,
    pub interval: Duration,
    pub one_shot: bool,
    pub stop: StopHandle,
}

/// `/proc/stat` sampling source.
pub struct CpuStatSource {
    counters: Vec<(CpuCounterKind, ApcCounterKey)>,
    buffer: Arc<SourceBuffer>,
    clock: Arc<CaptureClock>,
    token: CancellationToken,
    finished: AtomicBool,
    started: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    baseline: Mutex<Option<CpuStatSnapshot>>,
    sample_interval: Duration,
    one_shot: bool,
    stop: StopHandle,
    stop_requested: AtomicBool,
}

impl CpuStatSource {
    pub const PROC_STAT: &'static str = "/proc/stat";

    pub fn new(counters: Vec<(CpuCounterKind, ApcCounterKey)>, args: PrimaryArgs) -> Arc<Self> {
        Arc::new(Self {
            counters,
            buffer: SourceBuffer::new(args.data_ready),
            clock: args.clock,
            token: CancellationToken::new(),
            finished: AtomicBool::new(false),
            started: Mutex::new(Some(args.started)),
            baseline: Mutex::new(None),
            sample_interval: args.interval,
            one_shot: args.one_shot,
            stop: args.stop,
            stop_requested: AtomicBool::new(false),
        })
    }

    fn read_snapshot() -> Result<CpuStatSnapshot, SourceError> {
        let contents = fs::read_to_string(Self::PROC_STAT)?;
        CpuStatSnapshot::parse(&contents).ok_or_else(|| {
            SourceError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "no cpu line in /proc/stat",
            ))
        })
    }

    fn sample(&self) {
        let snapshot = match Self::read_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to sample /proc/stat");
                return;
            }
        };
        let delta = {
            let Ok(mut baseline) = self.baseline.lock() else {
                return;
            };
            let delta = baseline
                .map(|earlier| snapshot.delta_from(&earlier))
                .unwrap_or_default();
            *baseline = Some(snapshot);
            delta
        };

        let samples: Vec<Sample> = self
            .counters
            .iter()
            .map(|(kind, key)| (*key, 0, delta.value(*kind)))
            .collect();
        if !samples.is_empty() {
            self.buffer
                .push(encode_samples(self.clock.now_ns(), &samples));
        }

        if self.one_shot
            && self.buffer.len() >= ONE_SHOT_CHUNK_LIMIT
            && !self.stop_requested.swap(true, Ordering::AcqRel)
        {
            info!("One-shot capture buffer full, ending session");
            self.stop.request_stop();
        }
    }
}

#[async_trait]
impl Source for CpuStatSource {
    fn name(&self) -> &'static str {
        "cpustat"
    }

    async fn prepare(&self) -> Result<(), SourceError> {
        let snapshot = Self::read_snapshot()?;
        if let Ok(mut baseline) = self.baseline.lock() {
            *baseline = Some(snapshot);
        }
        Ok(())
    }

    fn start(&self) {
        // The primary source has no background producer; its hot loop runs
        // on the orchestrator task via `run`.
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

    async fn join(&self) {}
}

#[async_trait]
impl PrimarySource for CpuStatSource {
    async fn run(&self) {
        if let Some(started) = self.started.lock().ok().and_then(|mut cb| cb.take()) {
            started();
        }

        let mut tick = interval(self.sample_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tick.tick() => self.sample(),
            }
        }
        self.finished.store(true, Ordering::Release);
        debug!("Primary source hot loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const STAT_FIXTURE: &str = "cpu  100 5 50 1000 20 3 7 0 0 0\n\
                                cpu0 50 2 25 500 10 1 3 0 0 0\n\
                                intr 12345\n\
                                ctxt 777\n\
                                btime 1700000000\n\
                                processes 42\n";

    #[test]
    fn test_parse_proc_stat() {
        let snapshot = CpuStatSnapshot::parse(STAT_FIXTURE).expect("parses");
        assert_eq!(snapshot.value(CpuCounterKind::User), 100);
        assert_eq!(snapshot.value(CpuCounterKind::Idle), 1000);
        assert_eq!(snapshot.value(CpuCounterKind::ContextSwitches), 777);
        assert_eq!(snapshot.value(CpuCounterKind::ProcessesForked), 42);
    }

    #[test]
    fn test_parse_requires_cpu_line() {
        assert!(CpuStatSnapshot::parse("ctxt 1\n").is_none());
    }

    #[test]
    fn test_delta() {
        let a = CpuStatSnapshot::parse("cpu 10 0 5 100 0 0 0\nctxt 50\n").expect("a");
        let b = CpuStatSnapshot::parse("cpu 15 0 9 130 0 0 0\nctxt 60\n").expect("b");
        let delta = b.delta_from(&a);
        assert_eq!(delta.value(CpuCounterKind::User), 5);
        assert_eq!(delta.value(CpuCounterKind::System), 4);
        assert_eq!(delta.value(CpuCounterKind::Idle), 30);
        assert_eq!(delta.value(CpuCounterKind::ContextSwitches), 10);
    }

    fn test_source(one_shot: bool) -> (Arc<CpuStatSource>, mpsc::UnboundedReceiver<()>) {
        let (stop, wake_rx) = StopHandle::new_for_tests();
        let source = CpuStatSource::new(
            vec![(CpuCounterKind::User, 1)],
            PrimaryArgs {
                data_ready: Arc::new(Semaphore::new(0)),
                clock: CaptureClock::new(),
                started: Box::new(|| {}),
                interval: Duration::from_millis(5),
                one_shot,
                stop,
            },
        );
        (source, wake_rx)
    }

    #[tokio::test]
    async fn test_prepare_and_sample_real_proc_stat() {
        let (source, _wake) = test_source(false);
        source.prepare().await.expect("prepare");
        source.sample();
        // First delta may be all zero but a chunk is still emitted.
        assert!(!source.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_interrupt() {
        let (source, _wake) = test_source(false);
        source.prepare().await.expect("prepare");

        let runner = source.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        source.interrupt();
        handle.await.expect("run task");
        assert!(source.finished.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_started_callback_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop, _wake) = StopHandle::new_for_tests();
        let source = CpuStatSource::new(
            Vec::new(),
            PrimaryArgs {
                data_ready: Arc::new(Semaphore::new(0)),
                clock: CaptureClock::new(),
                started: Box::new(move || {
                    let _ = tx.send(());
                }),
                interval: Duration::from_millis(5),
                one_shot: false,
                stop,
            },
        );
        source.interrupt();
        source.run().await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
