//! The capture command: an application spawned and profiled for the
//! duration of the session.
//!
//! The command is spawned stopped (it raises `SIGSTOP` before exec) so
//! that no application code runs until the primary source is capturing;
//! the primary source's started-callback resumes it with `SIGCONT`.

use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to the spawned capture command.
#[derive(Debug)]
pub struct CaptureCommand {
    pid: u32,
    started: AtomicBool,
    cancelled: AtomicBool,
    waiter: Mutex<Option<JoinHandle<Option<ExitStatus>>>>,
}

impl CaptureCommand {
    /// Spawns `argv` stopped and registers `on_exit` to run when the
    /// process terminates.
    pub fn spawn(
        argv: &[String],
        on_exit: impl FnOnce() + Send + 'static,
    ) -> io::Result<Arc<Self>> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty capture command")
        })?;

        let mut command = Command::new(program);
        command.args(args);
        // Stop ourselves before exec; the parent resumes us once capture
        // has actually started.
        unsafe {
            command.pre_exec(|| {
                libc::raise(libc::SIGSTOP);
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned child has no pid"))?;

        let handle = tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(error = %e, "Failed waiting for capture command");
                    None
                }
            };
            debug!(status = ?status, "Capture command exited");
            on_exit();
            status
        });

        Ok(Arc::new(Self {
            pid,
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            waiter: Mutex::new(Some(handle)),
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Resumes the stopped command. Idempotent.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.kill(libc::SIGCONT);
        }
    }

    /// Terminates the command. Idempotent; also resumes a still-stopped
    /// process so the termination signal can be delivered.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.kill(libc::SIGTERM);
            self.kill(libc::SIGCONT);
        }
    }

    /// Waits for the command to exit.
    pub async fn join(&self) -> Option<ExitStatus> {
        let handle = self.waiter.lock().ok().and_then(|mut slot| slot.take());
        match handle {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        }
    }

    fn kill(&self, signum: i32) {
        let rc = unsafe { libc::kill(self.pid as i32, signum) };
        if rc != 0 {
            debug!(
                pid = self.pid,
                signal = signum,
                "kill failed (process already gone?)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn test_command_runs_after_start() {
        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()];
        let command = CaptureCommand::spawn(&argv, move || {
            flag.store(true, Ordering::Release);
        })
        .expect("spawn");

        // The command is stopped until started; give it a moment to make
        // the window observable, then resume and join.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!exited.load(Ordering::Acquire));

        command.start();
        let status = command.join().await.expect("exit status");
        assert!(status.success());
        assert!(exited.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_cancel_terminates_stopped_command() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 30".to_string(),
        ];
        let command = CaptureCommand::spawn(&argv, || {}).expect("spawn");
        command.cancel();
        let status = command.join().await.expect("exit status");
        assert!(!status.success());
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = CaptureCommand::spawn(&[], || {}).expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
