//! Local capture directory handling.
//!
//! A local capture produces a target directory containing the capture data
//! file, copies of any configured binary images, and three metadata
//! documents: the events available for capture, the session as captured,
//! and the counters that were enabled. On fatal error the whole directory
//! is removed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use percap_core::CapturedSpe;

use crate::drivers::EnabledCounter;

pub const EVENTS_FILE_NAME: &str = "events.json";
pub const CAPTURED_FILE_NAME: &str = "captured.json";
pub const COUNTERS_FILE_NAME: &str = "counters.json";

/// The session as captured, written after the capture completes.
#[derive(Debug, Serialize)]
pub struct CapturedMeta {
    pub duration_s: u64,
    pub one_shot: bool,
    pub command: Vec<String>,
    pub pids: Vec<u32>,
    pub spes: Vec<CapturedSpe>,
}

/// Creates the target capture directory, replacing any previous capture
/// at the same path.
pub fn create_capture_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)
}

/// Removes the capture directory and everything in it.
pub fn remove_capture_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Copies configured binary images into the capture directory.
///
/// A missing image is logged and skipped; the capture proceeds without it.
pub fn copy_images(images: &[PathBuf], dir: &Path) {
    for image in images {
        let Some(file_name) = image.file_name() else {
            warn!(image = %image.display(), "Image path has no file name, skipping");
            continue;
        };
        match fs::copy(image, dir.join(file_name)) {
            Ok(bytes) => debug!(image = %image.display(), bytes, "Copied image"),
            Err(e) => warn!(image = %image.display(), error = %e, "Failed to copy image"),
        }
    }
}

/// Writes the events metadata before capture starts.
pub fn write_events_meta(dir: &Path, counters: &[EnabledCounter]) -> io::Result<()> {
    write_json(&dir.join(EVENTS_FILE_NAME), &counters)
}

/// Writes the captured-session metadata after capture completes.
pub fn write_captured_meta(dir: &Path, meta: &CapturedMeta) -> io::Result<()> {
    write_json(&dir.join(CAPTURED_FILE_NAME), meta)
}

/// Writes the enabled-counters metadata after capture completes.
pub fn write_counters_meta(dir: &Path, counters: &[EnabledCounter]) -> io::Result<()> {
    write_json(&dir.join(COUNTERS_FILE_NAME), &counters)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("percap-local-{tag}-{}", std::process::id()))
    }

    #[test]
    fn test_create_replaces_previous_capture() {
        let dir = temp_dir("create");
        create_capture_dir(&dir).expect("create");
        fs::write(dir.join("stale"), b"old").expect("write");

        create_capture_dir(&dir).expect("recreate");
        assert!(!dir.join("stale").exists());

        remove_capture_dir(&dir).expect("remove");
        assert!(!dir.exists());
    }

    #[test]
    fn test_remove_missing_dir_is_ok() {
        let dir = temp_dir("missing");
        assert!(remove_capture_dir(&dir).is_ok());
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = temp_dir("meta");
        create_capture_dir(&dir).expect("create");

        let counters = vec![EnabledCounter {
            name: "cpu.user".into(),
            key: 1,
            driver: "cpustat",
        }];
        write_events_meta(&dir, &counters).expect("events");
        write_counters_meta(&dir, &counters).expect("counters");
        write_captured_meta(
            &dir,
            &CapturedMeta {
                duration_s: 10,
                one_shot: false,
                command: vec!["ls".into()],
                pids: vec![42],
                spes: Vec::new(),
            },
        )
        .expect("captured");

        let events: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.join(EVENTS_FILE_NAME)).expect("read"))
                .expect("json");
        assert_eq!(events[0]["name"], "cpu.user");
        assert!(dir.join(CAPTURED_FILE_NAME).exists());
        assert!(dir.join(COUNTERS_FILE_NAME).exists());

        remove_capture_dir(&dir).expect("remove");
    }
}
