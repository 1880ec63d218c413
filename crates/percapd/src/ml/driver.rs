//! Driver claiming ML-runtime counters into the global registry.
//!
//! ML counters are requested on the command line (or in the defaults
//! file) as `ml:<category>:<event>[:<device>[:<counter-set>]]`. Claiming
//! one records the parsed [`EventId`] in the process-wide registry under
//! the assigned capture key; connected sessions resolve it against their
//! own counter directories.

use std::sync::{Arc, Mutex};

use percap_core::{ApcCounterKey, CounterConfig, EventId};

use super::global::GlobalCounterRegistry;
use crate::drivers::Driver;

const ML_PREFIX: &str = "ml:";

/// Parses an `ml:` counter name into an [`EventId`].
///
/// Empty device/counter-set segments mean "absent".
pub fn parse_event_name(name: &str) -> Option<EventId> {
    let rest = name.strip_prefix(ML_PREFIX)?;
    let mut parts = rest.split(':');
    let category = parts.next().filter(|s| !s.is_empty())?;
    let event = parts.next().filter(|s| !s.is_empty())?;
    let device = parts.next().filter(|s| !s.is_empty()).map(str::to_owned);
    let counter_set = parts.next().filter(|s| !s.is_empty()).map(str::to_owned);
    if parts.next().is_some() {
        return None;
    }
    Some(EventId::new(category, device, counter_set, event))
}

/// Driver for ML-runtime session counters.
pub struct MlDriver {
    global: Arc<GlobalCounterRegistry>,
    claimed: Mutex<Vec<(EventId, ApcCounterKey)>>,
}

impl MlDriver {
    pub fn new(global: Arc<GlobalCounterRegistry>) -> Self {
        Self {
            global,
            claimed: Mutex::new(Vec::new()),
        }
    }

    pub fn global(&self) -> &Arc<GlobalCounterRegistry> {
        &self.global
    }
}

impl Driver for MlDriver {
    fn name(&self) -> &'static str {
        "mlrt"
    }

    fn reset_counters(&self) {
        self.global.clear_requested();
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.clear();
        }
    }

    fn claim_counter(&self, config: &CounterConfig, key: ApcCounterKey) -> bool {
        let Some(id) = parse_event_name(&config.name) else {
            return false;
        };
        self.global.request_event(id.clone(), key);
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.push((id, key));
        }
        true
    }
}
