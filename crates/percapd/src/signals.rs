//! Terminal-signal bridge.
//!
//! Signal handlers must not log or take locks, so the only thing the
//! signal path does is record the signal number and forward one in-band
//! wake-up to the stop task; all cleanup runs there in normal context.
//! The driver task listens for SIGINT, SIGTERM and SIGABRT for the whole
//! life of the session.

use std::process;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::capture::{self, StopHandle};
use crate::fatal::EXIT_NO_SESSION;

/// Human-readable name for a terminal signal number.
pub fn signal_name(signum: i32) -> &'static str {
    match signum {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGABRT => "SIGABRT",
        _ => "unknown signal",
    }
}

/// Spawns the signal driver task.
///
/// Each terminal signal is converted into a stop request on the given
/// handle. A signal arriving when no session is live is an invariant
/// violation and exits with [`EXIT_NO_SESSION`]; a wake that cannot be
/// delivered exits inside [`StopHandle::raise_signal`].
pub fn spawn(stop: StopHandle) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigabrt = signal(SignalKind::from_raw(libc::SIGABRT))?;

    Ok(tokio::spawn(async move {
        loop {
            let signum = wait_for_terminal_signal(&mut sigint, &mut sigterm, &mut sigabrt).await;
            if !capture::session_is_live() {
                // Handlers are only installed while a session exists.
                process::exit(EXIT_NO_SESSION);
            }
            debug!(signal = signal_name(signum), "Terminal signal received");
            stop.raise_signal(signum);
        }
    }))
}

async fn wait_for_terminal_signal(
    sigint: &mut Signal,
    sigterm: &mut Signal,
    sigabrt: &mut Signal,
) -> i32 {
    tokio::select! {
        _ = sigint.recv() => libc::SIGINT,
        _ = sigterm.recv() => libc::SIGTERM,
        _ = sigabrt.recv() => libc::SIGABRT,
    }
}
