//! Process-wide state of requested and known ML events.
//!
//! The registry lives for the duration of the session. Writers append or
//! override; readers take a snapshot under the registry lock. Deduplication
//! of events announced by multiple sessions happens here, not in the
//! per-session trackers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use percap_core::{ApcCounterKey, CounterCaptureMode, EventId, EventProperties};

/// Read/write access to the process-wide ML counter state.
///
/// All methods are safe to call from any task.
pub trait GlobalState: Send + Sync {
    /// Map from requested global event id to its APC counter key.
    fn requested_counters(&self) -> BTreeMap<EventId, ApcCounterKey>;

    /// The requested capture mode.
    fn capture_mode(&self) -> CounterCaptureMode;

    /// The requested sample period in microseconds.
    fn sample_period_us(&self) -> u32;

    /// Publishes events newly discovered by a session's counter directory.
    fn add_events(&self, events: Vec<(EventId, EventProperties)>);
}

struct RegistryInner {
    requested: BTreeMap<EventId, ApcCounterKey>,
    known: BTreeMap<EventId, EventProperties>,
}

/// The registry backing [`GlobalState`] for this process.
pub struct GlobalCounterRegistry {
    mode: CounterCaptureMode,
    sample_period_us: u32,
    inner: Mutex<RegistryInner>,
}

impl GlobalCounterRegistry {
    pub fn new(mode: CounterCaptureMode, sample_period_us: u32) -> Self {
        Self {
            mode,
            sample_period_us,
            inner: Mutex::new(RegistryInner {
                requested: BTreeMap::new(),
                known: BTreeMap::new(),
            }),
        }
    }

    /// Requests capture of one event under the given key. Overrides any
    /// previous request for the same event.
    pub fn request_event(&self, id: EventId, key: ApcCounterKey) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.requested.insert(id, key);
        }
    }

    /// Drops all requested events (counter reconfiguration).
    pub fn clear_requested(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.requested.clear();
        }
    }

    /// Snapshot of every event any session has announced.
    pub fn known_events(&self) -> BTreeMap<EventId, EventProperties> {
        self.inner
            .lock()
            .map(|inner| inner.known.clone())
            .unwrap_or_default()
    }
}

impl GlobalState for GlobalCounterRegistry {
    fn requested_counters(&self) -> BTreeMap<EventId, ApcCounterKey> {
        self.inner
            .lock()
            .map(|inner| inner.requested.clone())
            .unwrap_or_default()
    }

    fn capture_mode(&self) -> CounterCaptureMode {
        self.mode
    }

    fn sample_period_us(&self) -> u32 {
        self.sample_period_us
    }

    fn add_events(&self, events: Vec<(EventId, EventProperties)>) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("Global counter registry lock poisoned");
            return;
        };
        for (id, properties) in events {
            match inner.known.get(&id) {
                None => {
                    inner.known.insert(id, properties);
                }
                Some(existing) if *existing != properties => {
                    debug!(
                        category = %id.category,
                        event = %id.name,
                        "Event re-announced with different properties, keeping first"
                    );
                }
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use percap_core::{CounterClass, CounterInterpolation};

    fn props(multiplier: f64) -> EventProperties {
        EventProperties {
            counter_set_count: 0,
            class: CounterClass::Delta,
            interpolation: CounterInterpolation::Linear,
            multiplier,
            description: String::new(),
            units: String::new(),
        }
    }

    fn id(name: &str) -> EventId {
        EventId::new("inference", None, None, name)
    }

    #[test]
    fn test_request_and_snapshot() {
        let registry = GlobalCounterRegistry::new(CounterCaptureMode::Periodic, 1000);
        registry.request_event(id("cycles"), 10);
        registry.request_event(id("cycles"), 11);
        let requested = registry.requested_counters();
        assert_eq!(requested.get(&id("cycles")), Some(&11));

        registry.clear_requested();
        assert!(registry.requested_counters().is_empty());
    }

    #[test]
    fn test_add_events_dedups_keeping_first() {
        let registry = GlobalCounterRegistry::new(CounterCaptureMode::Periodic, 1000);
        registry.add_events(vec![(id("cycles"), props(1.0))]);
        registry.add_events(vec![(id("cycles"), props(2.0)), (id("ops"), props(1.0))]);

        let known = registry.known_events();
        assert_eq!(known.len(), 2);
        assert_eq!(known.get(&id("cycles")).map(|p| p.multiplier), Some(1.0));
    }
}
