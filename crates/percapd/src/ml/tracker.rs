//! Per-session state machine reconciling a counter directory with the
//! process-wide set of requested events.
//!
//! States: Idle → (directory received) → Ready → (enable) → Capturing →
//! (disable) → Ready. Receiving a new counter directory while capturing is
//! allowed and re-issues the counter selection atomically. Every operation
//! takes the tracker's internal mutex; the tracker never calls back into
//! anything that locks it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use percap_core::{
    ApcCounterKey, CategoryRecord, CounterSetRecord, DeviceRecord, EventId, EventProperties,
    KeyAndCore,
};

use super::global::GlobalState;

/// Sends selection commands back to the remote session.
pub trait SessionPacketSender: Send + Sync {
    /// Requests periodic capture of the given event UIDs.
    fn request_counter_selection(&self, period_us: u32, uids: &BTreeSet<u16>) -> bool;
}

/// Downstream consumer of captured counter values.
pub trait CounterConsumer: Send + Sync {
    fn consume_counter_value(
        &self,
        key: ApcCounterKey,
        core: u32,
        timestamp: u64,
        value: u32,
    ) -> bool;
}

/// Position of an event inside the announced directory: index of its
/// category plus the event's wire-level UID within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CategoryIndexAndUid {
    index: usize,
    uid: u16,
}

#[derive(Default)]
struct TrackerState {
    devices: BTreeMap<u16, DeviceRecord>,
    counter_sets: BTreeMap<u16, CounterSetRecord>,
    categories: Vec<CategoryRecord>,
    global_id_index: BTreeMap<EventId, CategoryIndexAndUid>,
    requested_uids: BTreeMap<u16, KeyAndCore>,
    active_uids: BTreeSet<u16>,
    capture_active: bool,
}

/// Manages the state for one connected ML-runtime session.
pub struct SessionStateTracker {
    global: Arc<dyn GlobalState>,
    consumer: Arc<dyn CounterConsumer>,
    send_queue: Box<dyn SessionPacketSender>,
    state: Mutex<TrackerState>,
}

impl SessionStateTracker {
    pub fn new(
        global: Arc<dyn GlobalState>,
        consumer: Arc<dyn CounterConsumer>,
        send_queue: Box<dyn SessionPacketSender>,
    ) -> Self {
        Self {
            global,
            consumer,
            send_queue,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Replaces the locally-held counter directory.
    ///
    /// Publishes newly-discovered events to the global state, refreshes the
    /// requested-UID map against the current global request set, and, when
    /// capture is active, re-issues the counter selection.
    pub fn on_counter_directory(
        &self,
        devices: BTreeMap<u16, DeviceRecord>,
        counter_sets: BTreeMap<u16, CounterSetRecord>,
        categories: Vec<CategoryRecord>,
    ) -> bool {
        let mut index = BTreeMap::new();
        let mut discovered = Vec::new();
        for (cat_index, category) in categories.iter().enumerate() {
            for (uid, event) in &category.events_by_uid {
                let device = category
                    .device_for(event)
                    .and_then(|d| devices.get(&d))
                    .map(|d| d.name.clone());
                let counter_set = category.counter_set_for(event).and_then(|c| counter_sets.get(&c));
                let id = EventId::new(
                    category.name.clone(),
                    device,
                    counter_set.map(|c| c.name.clone()),
                    event.name.clone(),
                );
                let properties = EventProperties {
                    counter_set_count: counter_set.map(|c| c.count).unwrap_or(0),
                    class: event.class,
                    interpolation: event.interpolation,
                    multiplier: event.multiplier,
                    description: event.description.clone(),
                    units: event.units.clone(),
                };
                if index
                    .insert(
                        id.clone(),
                        CategoryIndexAndUid {
                            index: cat_index,
                            uid: *uid,
                        },
                    )
                    .is_some()
                {
                    warn!(category = %category.name, event = %event.name, "Duplicate event in counter directory");
                }
                discovered.push((id, properties));
            }
        }

        let Ok(mut state) = self.state.lock() else {
            return false;
        };

        // Dedup against previously published events is the global state's
        // concern; everything discovered here is offered.
        self.global.add_events(discovered);

        state.devices = devices;
        state.counter_sets = counter_sets;
        state.categories = categories;
        state.global_id_index = index;
        let requested = Self::form_requested_uids(
            &self.global.requested_counters(),
            &state.global_id_index,
            &state.categories,
            &state.devices,
        );
        state.requested_uids = requested;

        if state.capture_active {
            self.send_counter_selection(&state);
        }
        true
    }

    /// Resolves each globally requested event against this session's
    /// directory. Events absent from the directory are silently omitted;
    /// they may belong to another session's device. An event attached to a
    /// device with N cores occupies N consecutive UIDs, one per core.
    fn form_requested_uids(
        requested: &BTreeMap<EventId, ApcCounterKey>,
        index: &BTreeMap<EventId, CategoryIndexAndUid>,
        categories: &[CategoryRecord],
        devices: &BTreeMap<u16, DeviceRecord>,
    ) -> BTreeMap<u16, KeyAndCore> {
        let mut uids = BTreeMap::new();
        for (id, key) in requested {
            let Some(position) = index.get(id) else {
                continue;
            };
            let Some(category) = categories.get(position.index) else {
                continue;
            };
            let Some(event) = category.events_by_uid.get(&position.uid) else {
                continue;
            };
            let cores = category
                .device_for(event)
                .and_then(|d| devices.get(&d))
                .map(|d| d.cores.max(1))
                .unwrap_or(1);
            for core in 0..cores {
                uids.insert(
                    position.uid + core,
                    KeyAndCore {
                        key: *key,
                        core: u32::from(core),
                    },
                );
            }
        }
        uids
    }

    /// Records the periodic-capture UIDs the session acknowledged.
    pub fn on_periodic_counter_selection(&self, period_us: u32, uids: BTreeSet<u16>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        debug!(period_us, count = uids.len(), "Periodic counter selection");
        state.active_uids = uids;
        true
    }

    /// Records the per-job UIDs the session acknowledged.
    pub fn on_per_job_counter_selection(&self, object_id: u64, uids: BTreeSet<u16>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        debug!(object_id, count = uids.len(), "Per-job counter selection");
        state.active_uids = uids;
        true
    }

    /// Forwards requested counter values from a periodic capture packet.
    pub fn on_periodic_counter_capture(
        &self,
        timestamp: u64,
        values: BTreeMap<u16, u32>,
    ) -> bool {
        self.forward_values(timestamp, &values)
    }

    /// Forwards requested counter values from a per-job capture packet.
    pub fn on_per_job_counter_capture(
        &self,
        is_pre: bool,
        timestamp: u64,
        object_ref: u64,
        values: BTreeMap<u16, u32>,
    ) -> bool {
        trace!(is_pre, object_ref, "Per-job counter capture");
        self.forward_values(timestamp, &values)
    }

    fn forward_values(&self, timestamp: u64, values: &BTreeMap<u16, u32>) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        for (uid, value) in values {
            if let Some(target) = state.requested_uids.get(uid) {
                if !self
                    .consumer
                    .consume_counter_value(target.key, target.core, timestamp, *value)
                {
                    return false;
                }
            }
        }
        true
    }

    /// Starts capturing: sends the currently-computed counter selection.
    pub fn do_enable_capture(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.capture_active = true;
        self.send_counter_selection(&state)
    }

    /// Stops capturing: sends an empty counter selection.
    pub fn do_disable_capture(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.capture_active = false;
        self.send_queue
            .request_counter_selection(self.global.sample_period_us(), &BTreeSet::new())
    }

    fn send_counter_selection(&self, state: &TrackerState) -> bool {
        let uids: BTreeSet<u16> = state.requested_uids.keys().copied().collect();
        self.send_queue
            .request_counter_selection(self.global.sample_period_us(), &uids)
    }

    /// Snapshot of the UIDs currently being captured.
    pub fn active_uids(&self) -> BTreeSet<u16> {
        self.state
            .lock()
            .map(|state| state.active_uids.clone())
            .unwrap_or_default()
    }
}
