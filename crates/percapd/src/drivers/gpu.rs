//! GPU hardware-counter driver backed by devfreq sysfs nodes.
//!
//! Counter availability depends on a devfreq node being present; on hosts
//! without one the `gpu.*` counters simply go unclaimed and the GPU source
//! is never created.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use percap_core::{ApcCounterKey, CounterConfig};

use super::Driver;
use crate::source::Sample;

const DEVFREQ_ROOT: &str = "/sys/class/devfreq";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpuCounterKind {
    CurFreq,
    MaxFreq,
    MinFreq,
}

impl GpuCounterKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "gpu.freq" => Some(Self::CurFreq),
            "gpu.freq.max" => Some(Self::MaxFreq),
            "gpu.freq.min" => Some(Self::MinFreq),
            _ => None,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::CurFreq => "cur_freq",
            Self::MaxFreq => "max_freq",
            Self::MinFreq => "min_freq",
        }
    }
}

/// Driver for devfreq-backed GPU counters.
pub struct GpuDriver {
    device: Option<PathBuf>,
    claimed: Mutex<Vec<(GpuCounterKind, ApcCounterKey)>>,
}

impl GpuDriver {
    /// Discovers the first devfreq device, if any.
    pub fn discover() -> Self {
        Self::with_root(DEVFREQ_ROOT)
    }

    fn with_root(root: &str) -> Self {
        let device = fs::read_dir(root)
            .ok()
            .and_then(|mut entries| entries.next())
            .and_then(|entry| entry.ok())
            .map(|entry| entry.path());
        if let Some(device) = &device {
            debug!(device = %device.display(), "Found devfreq GPU device");
        }
        Self {
            device,
            claimed: Mutex::new(Vec::new()),
        }
    }

    /// True when the GPU source should be created for this session.
    pub fn counters_enabled(&self) -> bool {
        self.claimed.lock().map(|c| !c.is_empty()).unwrap_or(false)
    }

    /// Reads every claimed counter once.
    pub fn sample(&self) -> Vec<Sample> {
        let Some(device) = &self.device else {
            return Vec::new();
        };
        let claimed = match self.claimed.lock() {
            Ok(claimed) => claimed.clone(),
            Err(_) => return Vec::new(),
        };
        claimed
            .iter()
            .filter_map(|(kind, key)| {
                let raw = fs::read_to_string(device.join(kind.file_name())).ok()?;
                let value = raw.trim().parse().ok()?;
                Some((*key, 0, value))
            })
            .collect()
    }
}

impl Driver for GpuDriver {
    fn name(&self) -> &'static str {
        "devfreq"
    }

    fn reset_counters(&self) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.clear();
        }
    }

    fn claim_counter(&self, config: &CounterConfig, key: ApcCounterKey) -> bool {
        let Some(kind) = GpuCounterKind::from_name(&config.name) else {
            return false;
        };
        if self.device.is_none() {
            // Known name, but no device to read it from.
            return false;
        }
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.push((kind, key));
        }
        true
    }
}
