//! The CPU-statistics driver and primary-source provider.
//!
//! Claims the `cpu.*` counter family, backed by `/proc/stat`, and produces
//! the primary capture source whose hot loop drives the session. SPE
//! configurations with a `spe.` id are claimed here as well.

use std::sync::{Arc, Mutex};

use percap_core::{ApcCounterKey, CapturedSpe, CounterConfig, SpeConfig};

use super::Driver;
use crate::sources::primary::{CpuStatSource, PrimaryArgs};

/// Counters derivable from `/proc/stat`.
///
/// All values are cumulative kernel counters; samples are emitted as
/// deltas between consecutive reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuCounterKind {
    User,
    Nice,
    System,
    Idle,
    Iowait,
    Irq,
    Softirq,
    ContextSwitches,
    ProcessesForked,
}

impl CpuCounterKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cpu.user" => Some(Self::User),
            "cpu.nice" => Some(Self::Nice),
            "cpu.system" => Some(Self::System),
            "cpu.idle" => Some(Self::Idle),
            "cpu.iowait" => Some(Self::Iowait),
            "cpu.irq" => Some(Self::Irq),
            "cpu.softirq" => Some(Self::Softirq),
            "cpu.context_switches" => Some(Self::ContextSwitches),
            "cpu.processes" => Some(Self::ProcessesForked),
            _ => None,
        }
    }
}

/// Driver for `/proc/stat` backed counters.
pub struct CpuDriver {
    claimed: Mutex<Vec<(CpuCounterKind, ApcCounterKey)>>,
}

impl CpuDriver {
    pub fn new() -> Self {
        Self {
            claimed: Mutex::new(Vec::new()),
        }
    }

    /// Creates the primary source for this session, or `None` when the
    /// backing facility is missing entirely.
    pub fn create_primary(&self, args: PrimaryArgs) -> Option<Arc<CpuStatSource>> {
        if !std::path::Path::new(CpuStatSource::PROC_STAT).exists() {
            return None;
        }
        let claimed = self
            .claimed
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        Some(CpuStatSource::new(claimed, args))
    }
}

impl Default for CpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for CpuDriver {
    fn name(&self) -> &'static str {
        "cpustat"
    }

    fn reset_counters(&self) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.clear();
        }
    }

    fn claim_counter(&self, config: &CounterConfig, key: ApcCounterKey) -> bool {
        let Some(kind) = CpuCounterKind::from_name(&config.name) else {
            return false;
        };
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.push((kind, key));
        }
        true
    }

    fn setup_spe(&self, spe: &SpeConfig, key: ApcCounterKey) -> Option<CapturedSpe> {
        if !spe.id.starts_with("spe.") {
            return None;
        }
        Some(CapturedSpe {
            id: spe.id.clone(),
            key,
        })
    }
}
