//! Polled drivers sampled by the user-space source.

use std::sync::Mutex;

use sysinfo::System;
use tracing::debug;

use percap_core::{ApcCounterKey, CounterConfig};

use super::Driver;
use crate::source::Sample;

/// A driver whose counters are read by periodic polling on the user-space
/// source rather than by a dedicated producer.
pub trait PolledDriver: Driver {
    /// True when at least one of this driver's counters is enabled.
    fn counters_enabled(&self) -> bool;

    /// Reads every enabled counter once.
    fn sample(&self) -> Vec<Sample>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemCounterKind {
    Used,
    Total,
    Available,
    SwapUsed,
}

impl MemCounterKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "mem.used" => Some(Self::Used),
            "mem.total" => Some(Self::Total),
            "mem.available" => Some(Self::Available),
            "swap.used" => Some(Self::SwapUsed),
            _ => None,
        }
    }
}

/// Memory counters backed by `sysinfo`.
pub struct MemoryDriver {
    claimed: Mutex<Vec<(MemCounterKind, ApcCounterKey)>>,
    system: Mutex<System>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            claimed: Mutex::new(Vec::new()),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "meminfo"
    }

    fn reset_counters(&self) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.clear();
        }
    }

    fn claim_counter(&self, config: &CounterConfig, key: ApcCounterKey) -> bool {
        let Some(kind) = MemCounterKind::from_name(&config.name) else {
            return false;
        };
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.push((kind, key));
        }
        true
    }
}

impl PolledDriver for MemoryDriver {
    fn counters_enabled(&self) -> bool {
        self.claimed.lock().map(|c| !c.is_empty()).unwrap_or(false)
    }

    fn sample(&self) -> Vec<Sample> {
        let claimed = match self.claimed.lock() {
            Ok(claimed) => claimed.clone(),
            Err(_) => return Vec::new(),
        };
        if claimed.is_empty() {
            return Vec::new();
        }
        let Ok(mut system) = self.system.lock() else {
            debug!("Memory sampler lock poisoned");
            return Vec::new();
        };
        system.refresh_memory();
        claimed
            .iter()
            .map(|(kind, key)| {
                let value = match kind {
                    MemCounterKind::Used => system.used_memory(),
                    MemCounterKind::Total => system.total_memory(),
                    MemCounterKind::Available => system.available_memory(),
                    MemCounterKind::SwapUsed => system.used_swap(),
                };
                (*key, 0, value)
            })
            .collect()
    }
}
