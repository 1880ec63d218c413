//! Process-wide fatal-error accounting and exit codes.
//!
//! A fatal error is handled at most twice: the first one runs the cleanup
//! path (report to the client, remove the incomplete capture directory);
//! a second fatal error arriving during that cleanup exits immediately
//! with a distinct code. Fatal exits go through `process::exit` rather
//! than unwinding because other tasks may still be running.

use std::sync::atomic::{AtomicU32, Ordering};

/// Uncaught fatal error.
pub const EXIT_FATAL: i32 = 1;

/// A second fatal error arrived during fatal cleanup.
pub const EXIT_SECOND_FATAL: i32 = 2;

/// A termination trigger fired but no capture session was live.
pub const EXIT_NO_SESSION: i32 = 5;

/// A terminal signal could not be forwarded to the stop task.
pub const EXIT_SIGNAL_WAKE_FAILED: i32 = 6;

static FATAL_COUNT: AtomicU32 = AtomicU32::new(0);

/// Claims the fatal cleanup path.
///
/// Returns `true` for the first fatal error in the process; every later
/// call returns `false` and the caller must exit with
/// [`EXIT_SECOND_FATAL`] without attempting further cleanup.
pub fn first_fatal() -> bool {
    FATAL_COUNT.fetch_add(1, Ordering::AcqRel) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_fatal_claims_cleanup() {
        // The counter is process-global, so this test owns all of it.
        assert!(first_fatal());
        assert!(!first_fatal());
        assert!(!first_fatal());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            EXIT_FATAL,
            EXIT_SECOND_FATAL,
            EXIT_NO_SESSION,
            EXIT_SIGNAL_WAKE_FAILED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
