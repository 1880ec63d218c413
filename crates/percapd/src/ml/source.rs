//! The ML-runtime capture source and session hub.
//!
//! The [`SessionHub`] outlives any one capture: ML-runtime sessions
//! register with it when they connect and unregister when they disconnect,
//! each owning a [`SessionStateTracker`]. During capture the hub forwards
//! tracker output into the [`MlSource`]'s buffer; outside capture the
//! values are discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use percap_core::ApcCounterKey;

use super::global::GlobalCounterRegistry;
use super::tracker::{CounterConsumer, SessionPacketSender, SessionStateTracker};
use crate::sender::{Sender, SenderError};
use crate::source::{encode_samples, Source, SourceBuffer, SourceError};

struct HubInner {
    sessions: HashMap<u64, Arc<SessionStateTracker>>,
    next_id: u64,
    capture_active: bool,
}

/// Registry of connected ML-runtime sessions.
pub struct SessionHub {
    global: Arc<GlobalCounterRegistry>,
    inner: Mutex<HubInner>,
    consumer: Mutex<Option<Arc<dyn CounterConsumer>>>,
}

impl SessionHub {
    pub fn new(global: Arc<GlobalCounterRegistry>) -> Arc<Self> {
        Arc::new(Self {
            global,
            inner: Mutex::new(HubInner {
                sessions: HashMap::new(),
                next_id: 1,
                capture_active: false,
            }),
            consumer: Mutex::new(None),
        })
    }

    /// Creates a tracker for a newly connected session. If capture is
    /// already active the session is enabled immediately.
    pub fn register_session(
        self: &Arc<Self>,
        send_queue: Box<dyn SessionPacketSender>,
    ) -> (u64, Arc<SessionStateTracker>) {
        let tracker = Arc::new(SessionStateTracker::new(
            self.global.clone(),
            self.clone() as Arc<dyn CounterConsumer>,
            send_queue,
        ));
        let (id, enable) = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let id = inner.next_id;
            inner.next_id += 1;
            inner.sessions.insert(id, tracker.clone());
            (id, inner.capture_active)
        };
        info!(session = id, "ML session connected");
        if enable {
            tracker.do_enable_capture();
        }
        (id, tracker)
    }

    /// Destroys the tracker of a disconnected session.
    pub fn unregister_session(&self, id: u64) {
        let removed = match self.inner.lock() {
            Ok(mut inner) => inner.sessions.remove(&id),
            Err(poisoned) => poisoned.into_inner().sessions.remove(&id),
        };
        if removed.is_some() {
            info!(session = id, "ML session disconnected");
        }
    }

    fn set_capture(&self, active: bool) {
        let trackers: Vec<_> = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.capture_active = active;
            inner.sessions.values().cloned().collect()
        };
        for tracker in trackers {
            if active {
                tracker.do_enable_capture();
            } else {
                tracker.do_disable_capture();
            }
        }
    }

    fn attach_consumer(&self, consumer: Arc<dyn CounterConsumer>) {
        if let Ok(mut slot) = self.consumer.lock() {
            *slot = Some(consumer);
        }
    }

    fn detach_consumer(&self) {
        if let Ok(mut slot) = self.consumer.lock() {
            *slot = None;
        }
    }
}

impl CounterConsumer for SessionHub {
    fn consume_counter_value(
        &self,
        key: ApcCounterKey,
        core: u32,
        timestamp: u64,
        value: u32,
    ) -> bool {
        let consumer = self.consumer.lock().ok().and_then(|slot| slot.clone());
        match consumer {
            Some(consumer) => consumer.consume_counter_value(key, core, timestamp, value),
            // No capture in flight; values are dropped by design of the
            // session lifecycle, not an error.
            None => true,
        }
    }
}

struct BufferConsumer {
    buffer: Arc<SourceBuffer>,
}

impl CounterConsumer for BufferConsumer {
    fn consume_counter_value(
        &self,
        key: ApcCounterKey,
        core: u32,
        timestamp: u64,
        value: u32,
    ) -> bool {
        self.buffer
            .push(encode_samples(timestamp, &[(key, core, u64::from(value))]));
        true
    }
}

/// Capture source fed by the session hub.
pub struct MlSource {
    hub: Arc<SessionHub>,
    buffer: Arc<SourceBuffer>,
    token: CancellationToken,
    interrupted: AtomicBool,
}

impl MlSource {
    pub fn new(hub: Arc<SessionHub>, data_ready: Arc<Semaphore>) -> Arc<Self> {
        let buffer = SourceBuffer::new(data_ready);
        hub.attach_consumer(Arc::new(BufferConsumer {
            buffer: buffer.clone(),
        }));
        Arc::new(Self {
            hub,
            buffer,
            token: CancellationToken::new(),
            interrupted: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Source for MlSource {
    fn name(&self) -> &'static str {
        "ml-runtime"
    }

    async fn prepare(&self) -> Result<(), SourceError> {
        Ok(())
    }

    fn start(&self) {
        self.hub.set_capture(true);
    }

    async fn write_to(&self, sender: &mut Sender) -> Result<(), SenderError> {
        self.buffer.write_to(sender).await
    }

    fn interrupt(&self) {
        if !self.interrupted.swap(true, Ordering::AcqRel) {
            self.hub.set_capture(false);
            self.hub.detach_consumer();
            debug!("ML source interrupted");
        }
        self.token.cancel();
    }

    fn is_done(&self) -> bool {
        self.token.is_cancelled() && self.buffer.is_empty()
    }

    async fn join(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use percap_core::CounterCaptureMode;
    use std::collections::BTreeSet;

    struct NullSender;

    impl SessionPacketSender for NullSender {
        fn request_counter_selection(&self, _period_us: u32, _uids: &BTreeSet<u16>) -> bool {
            true
        }
    }

    fn hub() -> Arc<SessionHub> {
        SessionHub::new(Arc::new(GlobalCounterRegistry::new(
            CounterCaptureMode::Periodic,
            100,
        )))
    }

    #[tokio::test]
    async fn test_values_flow_into_buffer_during_capture() {
        let hub = hub();
        let sem = Arc::new(Semaphore::new(0));
        let source = MlSource::new(hub.clone(), sem.clone());
        source.start();

        assert!(hub.consume_counter_value(5, 0, 100, 42));
        assert!(!source.buffer.is_empty());
        assert_eq!(sem.available_permits(), 1);

        source.interrupt();
        assert!(!source.is_done(), "buffered data still pending");

        let (_client, server) = tokio::io::duplex(256);
        let mut sender = Sender::live(server);
        source.write_to(&mut sender).await.expect("drain");
        assert!(source.is_done());
    }

    #[tokio::test]
    async fn test_values_discarded_without_source() {
        let hub = hub();
        // No source attached; values are accepted and dropped.
        assert!(hub.consume_counter_value(5, 0, 100, 42));
    }

    #[tokio::test]
    async fn test_interrupt_is_idempotent() {
        let hub = hub();
        let source = MlSource::new(hub, Arc::new(Semaphore::new(0)));
        source.interrupt();
        source.interrupt();
        assert!(source.is_done());
    }

    #[tokio::test]
    async fn test_late_session_is_enabled_immediately() {
        let hub = hub();
        let source = MlSource::new(hub.clone(), Arc::new(Semaphore::new(0)));
        source.start();

        let (id, tracker) = hub.register_session(Box::new(NullSender));
        // A session registered mid-capture starts enabled; disable works.
        assert!(tracker.do_disable_capture());
        hub.unregister_session(id);
    }
}
