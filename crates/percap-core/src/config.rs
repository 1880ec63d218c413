//! Session configuration and client-supplied settings.
//!
//! [`SessionConfig`] is assembled by the binary from command-line arguments
//! and is immutable once the capture run begins. [`SessionSettings`] is the
//! serde surface a client (or a local settings file) may use to adjust the
//! session before capture starts; missing fields leave the configured value
//! untouched.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::counter::{CounterConfig, SpeConfig};
use crate::error::DomainError;

/// Default polled-source sample interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default primary-source sample interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Immutable configuration for one capture session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Requested counters (command line wins over defaults).
    pub counters: BTreeSet<CounterConfig>,

    /// Requested SPE configurations.
    pub spes: BTreeSet<SpeConfig>,

    /// Optional command to spawn and profile (argv).
    pub capture_command: Vec<String>,

    /// Pids given on the command line (`--pid`).
    pub pids: BTreeSet<u32>,

    /// Process name to wait for before starting sources.
    pub wait_process: Option<String>,

    /// Capture duration; `None` means unbounded.
    pub duration: Option<Duration>,

    /// One-shot mode: hold all data until end-of-session, flush once.
    pub one_shot: bool,

    /// End the session when all watched pids have exited.
    pub stop_on_exit: bool,

    /// Local (on-disk) capture rather than a live client.
    pub local_capture: bool,

    /// Target capture directory for local mode.
    pub target_dir: Option<PathBuf>,

    /// Binary images to copy into the capture directory.
    pub images: Vec<PathBuf>,

    /// Optional path to a defaults file merged with command-line counters.
    pub defaults_path: Option<PathBuf>,

    /// Optional path to a local session settings file.
    pub settings_path: Option<PathBuf>,

    /// Stream bytes from the tracefs pipe through the external source.
    pub ftrace: bool,

    /// Primary-source sample interval.
    pub sample_interval: Duration,

    /// Polled-source sample interval.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            counters: BTreeSet::new(),
            spes: BTreeSet::new(),
            capture_command: Vec::new(),
            pids: BTreeSet::new(),
            wait_process: None,
            duration: None,
            one_shot: false,
            stop_on_exit: false,
            local_capture: false,
            target_dir: None,
            images: Vec::new(),
            defaults_path: None,
            settings_path: None,
            ftrace: false,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl SessionConfig {
    /// Applies client-supplied settings on top of this configuration.
    ///
    /// Fields absent from the settings payload keep their configured value.
    /// A duration of zero means unbounded.
    pub fn apply_settings(&mut self, settings: &SessionSettings) {
        if let Some(secs) = settings.duration_s {
            self.duration = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(u64::from(secs)))
            };
        }
        if let Some(one_shot) = settings.one_shot {
            self.one_shot = one_shot;
        }
        if let Some(ms) = settings.sample_interval_ms {
            if ms == 0 {
                warn!("Ignoring zero sample interval from session settings");
            } else {
                self.sample_interval = Duration::from_millis(u64::from(ms));
            }
        }
    }
}

/// Session settings as supplied by the client during the setup exchange,
/// or read from the local settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Capture duration in seconds; 0 = unbounded.
    #[serde(default)]
    pub duration_s: Option<u32>,

    /// One-shot buffer mode.
    #[serde(default)]
    pub one_shot: Option<bool>,

    /// Primary sample interval in milliseconds.
    #[serde(default)]
    pub sample_interval_ms: Option<u32>,
}

impl SessionSettings {
    /// Decodes a settings payload from its JSON wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self, DomainError> {
        serde_json::from_slice(bytes).map_err(|e| DomainError::SettingsParse {
            reason: e.to_string(),
        })
    }
}
