//! Driver registry: counter ownership and source construction.
//!
//! Each driver owns a family of counters. During setup every requested
//! counter is offered to the drivers in registry order and the first
//! claimant owns it for the session; the same first-claim rule assigns SPE
//! configurations. Unclaimed requests are logged and skipped, never fatal.

pub mod cpu;
pub mod gpu;
pub mod polled;

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use percap_core::{ApcCounterKey, CapturedSpe, CounterConfig, SpeConfig};

use crate::ml::driver::MlDriver;
use crate::ml::global::GlobalCounterRegistry;

pub use cpu::CpuDriver;
pub use gpu::GpuDriver;
pub use polled::{MemoryDriver, PolledDriver};

/// A family of counters with a common backing facility.
pub trait Driver: Send + Sync {
    /// Stable driver name for logs and metadata.
    fn name(&self) -> &'static str;

    /// Clears all per-session counter state.
    fn reset_counters(&self);

    /// Offers one counter request; returns true when this driver owns it.
    fn claim_counter(&self, config: &CounterConfig, key: ApcCounterKey) -> bool;

    /// Offers one SPE configuration.
    fn setup_spe(&self, _spe: &SpeConfig, _key: ApcCounterKey) -> Option<CapturedSpe> {
        None
    }
}

/// A counter that some driver claimed for this session.
#[derive(Debug, Clone, Serialize)]
pub struct EnabledCounter {
    pub name: String,
    pub key: ApcCounterKey,
    pub driver: &'static str,
}

/// Counter and SPE defaults merged with command-line requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CounterDefaults {
    #[serde(default)]
    pub counters: Vec<CounterConfig>,
    #[serde(default)]
    pub spes: Vec<SpeConfig>,
}

impl CounterDefaults {
    /// Built-in defaults used when no defaults file is given.
    pub fn builtin() -> Self {
        Self {
            counters: vec![
                CounterConfig::named("cpu.user"),
                CounterConfig::named("cpu.system"),
                CounterConfig::named("cpu.idle"),
                CounterConfig::named("cpu.context_switches"),
                CounterConfig::named("mem.used"),
                CounterConfig::named("mem.available"),
            ],
            spes: Vec::new(),
        }
    }

    /// Loads defaults from a file, falling back to the built-ins on any
    /// read or parse failure.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(defaults) => defaults,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unparsable defaults file, using built-in defaults");
                    Self::builtin()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable defaults file, using built-in defaults");
                Self::builtin()
            }
        }
    }
}

/// Owns every driver for the life of the session and assigns capture keys.
pub struct DriverRegistry {
    cpu: Arc<CpuDriver>,
    memory: Arc<MemoryDriver>,
    gpu: Arc<GpuDriver>,
    ml: Arc<MlDriver>,
    next_key: AtomicI32,
}

impl DriverRegistry {
    pub fn new(global: Arc<GlobalCounterRegistry>) -> Self {
        Self {
            cpu: Arc::new(CpuDriver::new()),
            memory: Arc::new(MemoryDriver::new()),
            gpu: Arc::new(GpuDriver::discover()),
            ml: Arc::new(MlDriver::new(global)),
            next_key: AtomicI32::new(1),
        }
    }

    pub fn cpu(&self) -> &Arc<CpuDriver> {
        &self.cpu
    }

    pub fn gpu(&self) -> &Arc<GpuDriver> {
        &self.gpu
    }

    pub fn ml(&self) -> &Arc<MlDriver> {
        &self.ml
    }

    /// Every driver, in claim-priority order.
    pub fn all(&self) -> Vec<Arc<dyn Driver>> {
        vec![
            self.cpu.clone(),
            self.memory.clone(),
            self.gpu.clone(),
            self.ml.clone(),
        ]
    }

    /// Drivers sampled by the user-space polled source.
    pub fn polled(&self) -> Vec<Arc<dyn PolledDriver>> {
        vec![self.memory.clone()]
    }

    fn next_key(&self) -> ApcCounterKey {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        for driver in self.all() {
            driver.reset_counters();
        }
    }

    /// Offers every requested counter to the drivers.
    pub fn setup_counters(&self, counters: &BTreeSet<CounterConfig>) -> Vec<EnabledCounter> {
        let mut enabled = Vec::new();
        for counter in counters {
            let key = self.next_key();
            let claimant = self.all().into_iter().find(|d| d.claim_counter(counter, key));
            match claimant {
                Some(driver) => {
                    debug!(counter = %counter.name, key, driver = driver.name(), "Counter enabled");
                    enabled.push(EnabledCounter {
                        name: counter.name.clone(),
                        key,
                        driver: driver.name(),
                    });
                }
                None => warn!(counter = %counter.name, "No driver claimed counter"),
            }
        }
        enabled
    }

    /// Assigns each SPE configuration to the first driver that claims it.
    pub fn setup_spes(&self, spes: &BTreeSet<SpeConfig>) -> Vec<CapturedSpe> {
        let mut captured = Vec::new();
        for spe in spes {
            let key = self.next_key();
            let claimed = self.all().iter().find_map(|d| d.setup_spe(spe, key));
            match claimed {
                Some(spe) => captured.push(spe),
                None => warn!(spe = %spe.id, "No driver claimed SPE configuration"),
            }
        }
        captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use percap_core::CounterCaptureMode;

    fn registry() -> DriverRegistry {
        DriverRegistry::new(Arc::new(GlobalCounterRegistry::new(
            CounterCaptureMode::Periodic,
            10_000,
        )))
    }

    #[test]
    fn test_cpu_counter_is_claimed() {
        let registry = registry();
        let mut counters = BTreeSet::new();
        counters.insert(CounterConfig::named("cpu.user"));
        let enabled = registry.setup_counters(&counters);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].driver, "cpustat");
        assert_eq!(enabled[0].key, 1);
    }

    #[test]
    fn test_unknown_counter_is_skipped() {
        let registry = registry();
        let mut counters = BTreeSet::new();
        counters.insert(CounterConfig::named("nonsense.counter"));
        assert!(registry.setup_counters(&counters).is_empty());
    }

    #[test]
    fn test_keys_are_unique_across_drivers() {
        let registry = registry();
        let mut counters = BTreeSet::new();
        counters.insert(CounterConfig::named("cpu.user"));
        counters.insert(CounterConfig::named("mem.used"));
        counters.insert(CounterConfig::named("ml:inference:cycles"));
        let enabled = registry.setup_counters(&counters);
        let mut keys: Vec<_> = enabled.iter().map(|c| c.key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), enabled.len());
    }

    #[test]
    fn test_spe_first_claim() {
        let registry = registry();
        let mut spes = BTreeSet::new();
        spes.insert(SpeConfig::new("spe.cluster0"));
        spes.insert(SpeConfig::new("unclaimed-id"));
        let captured = registry.setup_spes(&spes);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].id, "spe.cluster0");
    }

    #[test]
    fn test_builtin_defaults_nonempty() {
        let defaults = CounterDefaults::builtin();
        assert!(!defaults.counters.is_empty());
    }

    #[test]
    fn test_load_defaults_missing_file_falls_back() {
        let defaults = CounterDefaults::load(Some(Path::new("/no/such/file.json")));
        assert_eq!(
            defaults.counters.len(),
            CounterDefaults::builtin().counters.len()
        );
    }
}
