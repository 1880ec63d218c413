//! Pre-capture session setup.
//!
//! Live mode: the client drives a setup phase over the control channel and
//! ends it with a START command, optionally carrying session settings.
//! PINGs are answered throughout so a slow setup never looks dead.
//! Local mode: the same settings are read from a file on disk; a read
//! failure falls back to the configured defaults.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use percap_core::SessionSettings;
use percap_protocol::FrameType;

use crate::control::{ControlChannel, SetupEvent};
use crate::sender::Sender;

/// How the setup exchange concluded.
#[derive(Debug)]
pub enum SetupOutcome {
    /// START received; capture may begin.
    Proceed(Option<SessionSettings>),
    /// STOP or disconnect before capture started.
    Aborted,
}

/// Serves the live setup exchange until the client starts or aborts.
pub async fn live_exchange(
    control: &mut ControlChannel,
    sender: &Arc<Mutex<Sender>>,
) -> SetupOutcome {
    loop {
        match control.next_setup_event().await {
            SetupEvent::Ping => {
                debug!("Ping command received during setup");
                let mut sender = sender.lock().await;
                if sender.write_data(FrameType::Ack, &[], false).await.is_ok() {
                    let _ = sender.flush().await;
                }
            }
            SetupEvent::Start(settings) => {
                info!(has_settings = settings.is_some(), "Start command received");
                return SetupOutcome::Proceed(settings);
            }
            SetupEvent::Stop => {
                info!("Stop command received during setup");
                return SetupOutcome::Aborted;
            }
            SetupEvent::Closed => {
                info!("Client disconnected during setup");
                return SetupOutcome::Aborted;
            }
        }
    }
}

/// Reads local session settings; any failure means defaults.
pub fn load_local_settings(path: Option<&Path>) -> Option<SessionSettings> {
    let path = path?;
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to read session settings, using default values");
            return None;
        }
    };
    match SessionSettings::from_json(&bytes) {
        Ok(settings) => Some(settings),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to parse session settings, using default values");
            None
        }
    }
}
