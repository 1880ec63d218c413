//! Counter and SPE configuration records.
//!
//! A capture session is parameterized by a set of requested counters and a
//! set of statistical-profiling-extension (SPE) configurations. Both sets
//! are keyed by name/id: a command-line entry overrides a defaults entry
//! with the same key.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One requested counter.
///
/// Ordering and equality are by `name` only, so that sets of counter
/// configurations deduplicate on the counter identity and command-line
/// entries can override defaults with different parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Counter identity, e.g. `cpu.user` or `ml:inference:cycles`.
    pub name: String,

    /// Optional raw event code for event-programmable counters.
    #[serde(default)]
    pub event: Option<u64>,

    /// Event-based sampling period (0 = free running).
    #[serde(default)]
    pub count: u32,

    /// Core mask restriction, if any.
    #[serde(default)]
    pub cores: Option<String>,
}

impl CounterConfig {
    /// Creates a free-running counter request by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event: None,
            count: 0,
            cores: None,
        }
    }
}

impl PartialEq for CounterConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for CounterConfig {}

impl PartialOrd for CounterConfig {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CounterConfig {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Display for CounterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One requested SPE configuration.
///
/// Ordering and equality are by `id` only, mirroring [`CounterConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeConfig {
    /// SPE identity as handed to the claiming driver.
    pub id: String,

    /// Minimum latency filter in cycles (0 = no filter).
    #[serde(default)]
    pub min_latency: u32,

    /// Whether to record load/store/branch operations.
    #[serde(default)]
    pub ops: Vec<String>,
}

impl SpeConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            min_latency: 0,
            ops: Vec::new(),
        }
    }
}

impl PartialEq for SpeConfig {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SpeConfig {}

impl PartialOrd for SpeConfig {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpeConfig {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// An SPE configuration that was claimed by a driver, together with the
/// capture key the driver assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedSpe {
    pub id: String,
    pub key: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_counter_identity_is_name() {
        let a = CounterConfig {
            name: "cpu.user".into(),
            event: Some(0x11),
            count: 1000,
            cores: None,
        };
        let b = CounterConfig::named("cpu.user");
        assert_eq!(a, b);

        let mut set = BTreeSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_counter_ordering_by_name() {
        let a = CounterConfig::named("cpu.idle");
        let b = CounterConfig::named("cpu.user");
        assert!(a < b);
    }

    #[test]
    fn test_spe_identity_is_id() {
        let mut set = BTreeSet::new();
        set.insert(SpeConfig::new("spe.cluster0"));
        let mut dup = SpeConfig::new("spe.cluster0");
        dup.min_latency = 50;
        assert!(!set.insert(dup));
    }
}
