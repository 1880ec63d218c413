//! `/proc` scanning helpers for pid liveness and process lookup.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Returns the set of pids currently alive, from the numeric entries of
/// `/proc`.
pub fn alive_pids() -> BTreeSet<u32> {
    numeric_entries(Path::new("/proc"))
}

fn numeric_entries(dir: &Path) -> BTreeSet<u32> {
    let mut pids = BTreeSet::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return pids;
    };
    for entry in entries.flatten() {
        if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            pids.insert(pid);
        }
    }
    pids
}

/// Returns the pids whose command name matches `name`.
///
/// A process matches when its `comm` equals `name`, or the basename of the
/// first `cmdline` argument equals `name`.
pub fn pids_matching(name: &str) -> BTreeSet<u32> {
    let mut matched = BTreeSet::new();
    for pid in alive_pids() {
        if process_matches(pid, name) {
            matched.insert(pid);
        }
    }
    matched
}

fn process_matches(pid: u32, name: &str) -> bool {
    let comm_path = format!("/proc/{pid}/comm");
    if let Ok(comm) = fs::read_to_string(&comm_path) {
        if comm.trim_end() == name {
            return true;
        }
    }
    let cmdline_path = format!("/proc/{pid}/cmdline");
    if let Ok(cmdline) = fs::read(&cmdline_path) {
        if let Some(argv0) = cmdline.split(|b| *b == 0).next() {
            let argv0 = String::from_utf8_lossy(argv0);
            if Path::new(argv0.as_ref())
                .file_name()
                .is_some_and(|base| base == name)
            {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        let pids = alive_pids();
        assert!(pids.contains(&std::process::id()));
    }

    #[test]
    fn test_dead_pid_is_absent() {
        // Pid numbers wrap below pid_max; u32::MAX is never allocated.
        assert!(!alive_pids().contains(&u32::MAX));
    }

    #[test]
    fn test_no_match_for_unlikely_name() {
        assert!(pids_matching("percap-no-such-process-name").is_empty());
    }
}
