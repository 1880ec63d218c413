//! The capture session: owns every source, the sender, and the auxiliary
//! tasks, and funnels every termination trigger into one end-of-session.
//!
//! Startup order is load-bearing: the sender first (so fatal errors can be
//! reported), then counter setup, the setup exchange, the capture command
//! (spawned stopped), the stop task (so PINGs are answered during slow
//! setup), the primary source, the external source before the drain
//! starts, the remaining sources, and finally the drain task, after which
//! the primary source's hot loop runs on this task until the session ends.
//!
//! Shutdown is a single funnel: every trigger - terminal signal, client
//! STOP, duration expiry, watched pids gone, capture command exit - wakes
//! the stop task, which calls [`CaptureSession::do_end_session`] exactly
//! once. `do_end_session` is idempotent and interrupts every source,
//! including any source registered after the session already ended.

use std::collections::BTreeSet;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use percap_core::{CapturedSpe, SessionConfig};
use percap_protocol::FrameType;

use crate::command::CaptureCommand;
use crate::control::{ControlChannel, ControlEvent};
use crate::drain;
use crate::drivers::{CounterDefaults, DriverRegistry, EnabledCounter};
use crate::error::CaptureError;
use crate::fatal::{self, EXIT_FATAL, EXIT_SECOND_FATAL, EXIT_SIGNAL_WAKE_FAILED};
use crate::local;
use crate::ml::{MlSource, SessionHub};
use crate::proc;
use crate::sender::Sender;
use crate::setup::{self, SetupOutcome};
use crate::signals::signal_name;
use crate::source::{CaptureClock, PrimarySource, Source};
use crate::sources::external::FtraceSource;
use crate::sources::gpu::GpuCounterSource;
use crate::sources::primary::PrimaryArgs;
use crate::sources::userspace::PolledSource;

/// Wait-for-process poll cadence.
const WAIT_PROCESS_POLL: Duration = Duration::from_millis(1);

/// Watched-pid poll cadence.
const WATCH_PIDS_POLL: Duration = Duration::from_secs(1);

static SESSION_LIVE: AtomicBool = AtomicBool::new(false);

/// True while a capture session exists in this process.
pub fn session_is_live() -> bool {
    SESSION_LIVE.load(Ordering::Acquire)
}

/// Requests end-of-session from any task; cheap to clone.
///
/// Termination triggers never clean up themselves - they record the signal
/// (if any) and wake the stop task, which performs the fan-out in normal
/// context.
#[derive(Clone)]
pub struct StopHandle {
    wake: mpsc::UnboundedSender<()>,
    signal: Arc<AtomicI32>,
}

impl StopHandle {
    /// Requests end-of-session with no associated signal.
    pub fn request_stop(&self) {
        self.deliver(0);
    }

    /// Requests end-of-session on behalf of a terminal signal.
    pub fn raise_signal(&self, signum: i32) {
        self.deliver(signum);
    }

    fn deliver(&self, signum: i32) {
        if signum != 0 {
            self.signal.store(signum, Ordering::Release);
        }
        if self.wake.send(()).is_err() {
            if signum != 0 {
                // A terminal signal that cannot reach the stop task leaves
                // no safe way to shut down.
                process::exit(EXIT_SIGNAL_WAKE_FAILED);
            }
            debug!("Stop requested after the stop task exited");
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (wake, rx) = mpsc::unbounded_channel();
        (
            Self {
                wake,
                signal: Arc::new(AtomicI32::new(0)),
            },
            rx,
        )
    }
}

#[derive(Default)]
struct SessionState {
    ended: bool,
    primary: Option<Arc<dyn PrimarySource>>,
    others: Vec<Arc<dyn Source>>,
    command: Option<Arc<CaptureCommand>>,
}

/// One profiling session's lifecycle owner.
///
/// Exactly one may exist per process at a time; constructing a second
/// while one is live asserts.
pub struct CaptureSession {
    cfg: SessionConfig,
    drivers: DriverRegistry,
    state: StdMutex<SessionState>,
    active: AtomicBool,
    signal_number: Arc<AtomicI32>,
    wake_tx: mpsc::UnboundedSender<()>,
    wake_rx: StdMutex<Option<mpsc::UnboundedReceiver<()>>>,
    data_ready: Arc<Semaphore>,
    halt: Arc<Semaphore>,
    sender: Arc<Mutex<Sender>>,
    control: StdMutex<Option<ControlChannel>>,
    ml_hub: Arc<SessionHub>,
    clock: Arc<CaptureClock>,
    waiting_on_client: AtomicBool,
    live: bool,
}

impl CaptureSession {
    /// Creates a session writing to a live client connection.
    pub fn new_live(
        cfg: SessionConfig,
        drivers: DriverRegistry,
        control: ControlChannel,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Arc<Self> {
        Self::new(cfg, drivers, Some(control), Sender::live(writer))
    }

    /// Creates a session writing to a local capture directory.
    pub fn new_local(cfg: SessionConfig, drivers: DriverRegistry) -> Arc<Self> {
        Self::new(cfg, drivers, None, Sender::local())
    }

    fn new(
        cfg: SessionConfig,
        drivers: DriverRegistry,
        control: Option<ControlChannel>,
        sender: Sender,
    ) -> Arc<Self> {
        let previous = SESSION_LIVE.swap(true, Ordering::AcqRel);
        assert!(!previous, "two capture sessions active concurrently");

        let live = sender.is_live();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let ml_hub = SessionHub::new(drivers.ml().global().clone());

        Arc::new(Self {
            cfg,
            drivers,
            state: StdMutex::new(SessionState::default()),
            active: AtomicBool::new(true),
            signal_number: Arc::new(AtomicI32::new(0)),
            wake_tx,
            wake_rx: StdMutex::new(Some(wake_rx)),
            data_ready: Arc::new(Semaphore::new(0)),
            halt: Arc::new(Semaphore::new(0)),
            sender: Arc::new(Mutex::new(sender)),
            control: StdMutex::new(control),
            ml_hub,
            clock: CaptureClock::new(),
            waiting_on_client: AtomicBool::new(false),
            live,
        })
    }

    /// Handle used by every termination trigger.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            wake: self.wake_tx.clone(),
            signal: self.signal_number.clone(),
        }
    }

    /// Registration point for connecting ML-runtime sessions.
    pub fn ml_hub(&self) -> &Arc<SessionHub> {
        &self.ml_hub
    }

    /// True until `do_end_session` runs.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ended(&self) -> bool {
        self.state().ended
    }

    /// Runs the whole session. Errors are setup-fatal; the caller reports
    /// them through the fatal funnel.
    pub async fn run(self: &Arc<Self>) -> Result<(), CaptureError> {
        let mut cfg = self.cfg.clone();

        // Merge requested counters with defaults; command-line entries win.
        let mut counters = cfg.counters.clone();
        let mut spes = cfg.spes.clone();
        if (counters.is_empty() && spes.is_empty()) || cfg.defaults_path.is_some() {
            let defaults = CounterDefaults::load(cfg.defaults_path.as_deref());
            for counter in defaults.counters {
                if counters.contains(&counter) {
                    debug!(counter = %counter.name, "Overriding counter from defaults");
                } else {
                    counters.insert(counter);
                }
            }
            for spe in defaults.spes {
                if spes.contains(&spe) {
                    debug!(spe = %spe.id, "Overriding SPE from defaults");
                } else {
                    spes.insert(spe);
                }
            }
        }
        self.drivers.reset_counters();
        let enabled = self.drivers.setup_counters(&counters);
        let captured_spes = self.drivers.setup_spes(&spes);

        // Session settings: from the client in live mode, from disk in
        // local mode.
        if self.live {
            self.waiting_on_client.store(true, Ordering::Release);
            let Some(mut control) = self.take_control() else {
                return Err(CaptureError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "control channel missing",
                )));
            };
            let outcome = setup::live_exchange(&mut control, &self.sender).await;
            self.waiting_on_client.store(false, Ordering::Release);
            self.put_control(control);
            match outcome {
                SetupOutcome::Proceed(Some(settings)) => cfg.apply_settings(&settings),
                SetupOutcome::Proceed(None) => {}
                SetupOutcome::Aborted => {
                    self.do_end_session();
                    let mut sender = self.sender.lock().await;
                    let _ = sender.shutdown().await;
                    return Ok(());
                }
            }
        } else {
            if let Some(settings) = setup::load_local_settings(cfg.settings_path.as_deref()) {
                cfg.apply_settings(&settings);
            }
            let Some(target_dir) = cfg.target_dir.clone() else {
                return Err(CaptureError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "local capture without a target directory",
                )));
            };
            local::create_capture_dir(&target_dir)?;
            local::copy_images(&cfg.images, &target_dir);
            self.sender.lock().await.create_data_file(&target_dir).await?;
            local::write_events_meta(&target_dir, &enabled)?;
        }

        // Capture command, spawned stopped; its pid seeds the watch set.
        let mut app_pids: BTreeSet<u32> = BTreeSet::new();
        if !cfg.capture_command.is_empty() {
            info!(command = ?cfg.capture_command, "Running command");
            let stop = self.stop_handle();
            let stop_on_exit = cfg.stop_on_exit;
            let command = CaptureCommand::spawn(&cfg.capture_command, move || {
                if stop_on_exit {
                    info!("Ending session because command exited");
                    stop.request_stop();
                }
            })?;
            app_pids.insert(command.pid());
            info!(pid = command.pid(), "Profiling pid");
            self.state().command = Some(command);
        }

        // Stop task, early, so PINGs are answered while the setup below is
        // still running.
        let stop_task = {
            let session = self.clone();
            let wake_rx = self
                .wake_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let control = self.take_control();
            let Some(wake_rx) = wake_rx else {
                return Err(CaptureError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "session run twice",
                )));
            };
            tokio::spawn(session.stop_task(wake_rx, control))
        };

        if let Some(name) = cfg.wait_process.clone() {
            info!(process = %name, "Waiting for pids");
            while self.is_active() {
                let found = proc::pids_matching(&name);
                if !found.is_empty() {
                    info!(process = %name, pids = ?found, "Got pids");
                    app_pids.extend(found);
                    break;
                }
                tokio::time::sleep(WAIT_PROCESS_POLL).await;
            }
        }

        // --pid entries count for stop-on-exit only when no app was given.
        let watch_pids = if app_pids.is_empty() {
            cfg.pids.clone()
        } else {
            app_pids
        };

        let wait_till_start = CancellationToken::new();
        let wait_till_end = CancellationToken::new();

        let mut primary: Option<Arc<dyn PrimarySource>> = None;
        let mut should_continue = false;
        if !self.ended() {
            let started = {
                let wait_till_start = wait_till_start.clone();
                let command = self.state().command.clone();
                Box::new(move || {
                    wait_till_start.cancel();
                    if let Some(command) = command {
                        command.start();
                    }
                })
            };
            let new_primary = self
                .drivers
                .cpu()
                .create_primary(PrimaryArgs {
                    data_ready: self.data_ready.clone(),
                    clock: self.clock.clone(),
                    started,
                    interval: cfg.sample_interval,
                    one_shot: cfg.one_shot,
                    stop: self.stop_handle(),
                })
                .ok_or(CaptureError::PrimaryInit)? as Arc<dyn PrimarySource>;

            let mut state = self.state();
            state.primary = Some(new_primary.clone());
            if state.ended {
                // A terminal trigger won the installation race; the new
                // source must not outlive the fan-out it just missed.
                new_primary.interrupt();
            }
            should_continue = !state.ended;
            drop(state);
            primary = Some(new_primary);
        }

        let mut drain_task: Option<JoinHandle<Result<(), crate::sender::SenderError>>> = None;
        let mut duration_task: Option<JoinHandle<()>> = None;
        let mut watch_task: Option<JoinHandle<()>> = None;

        if should_continue {
            let primary = primary.clone().ok_or(CaptureError::PrimaryInit)?;

            // The external source exists before the drain starts; late
            // trace data would skew time sync in the consumer.
            let external = FtraceSource::new(cfg.ftrace, self.data_ready.clone());
            self.prepare_and_start(external, "external").await?;

            // After the session settings are final.
            primary
                .prepare()
                .await
                .map_err(CaptureError::PrimaryPrepare)?;

            if self.drivers.gpu().counters_enabled() {
                let gpu = GpuCounterSource::new(
                    self.drivers.gpu().clone(),
                    cfg.poll_interval,
                    self.clock.clone(),
                    self.data_ready.clone(),
                );
                self.prepare_and_start(gpu, "gpu hardware counters").await?;
            }

            // The drain stays gated in one-shot mode until end-of-session.
            self.halt.add_permits(if cfg.one_shot { 0 } else { 2 });

            if let Some(duration) = cfg.duration {
                let stop = self.stop_handle();
                let start_gate = wait_till_start.clone();
                let end_gate = wait_till_end.clone();
                duration_task = Some(tokio::spawn(async move {
                    start_gate.cancelled().await;
                    if timeout(duration, end_gate.cancelled()).await.is_err() {
                        info!("Duration expired");
                        stop.request_stop();
                    }
                    debug!("Exit duration task");
                }));
            }

            if cfg.stop_on_exit && !watch_pids.is_empty() {
                let stop = self.stop_handle();
                let end_gate = wait_till_end.clone();
                watch_task = Some(tokio::spawn(watch_pids_task(watch_pids, end_gate, stop)));
            }

            let polled = self.drivers.polled();
            if PolledSource::should_start(&polled) {
                let userspace = PolledSource::new(
                    polled,
                    cfg.poll_interval,
                    self.clock.clone(),
                    self.data_ready.clone(),
                );
                self.prepare_and_start(userspace, "userspace").await?;
            }

            let ml = MlSource::new(self.ml_hub.clone(), self.data_ready.clone());
            self.prepare_and_start(ml, "ML runtime").await?;

            // All sources are registered; the drain may start.
            drain_task = Some(tokio::spawn({
                let stop = self.stop_handle();
                let halt = self.halt.clone();
                let data_ready = self.data_ready.clone();
                let others = self.state().others.clone();
                let primary = primary.clone();
                let sender = self.sender.clone();
                let live = self.live;
                async move {
                    let result = drain::run(halt, data_ready, others, primary, sender, live).await;
                    if let Err(e) = &result {
                        error!(error = %e, "Capture drain failed");
                        stop.request_stop();
                    }
                    result
                }
            }));

            primary.run().await;
            info!("Primary source finished running");
        }

        // Wake all sleepers, then join in reverse dependency order.
        wait_till_end.cancel();

        let others = self.state().others.clone();
        for source in others.iter().rev() {
            source.join().await;
        }
        if let Some(task) = watch_task {
            let _ = task.await;
        }
        let mut drain_failure = None;
        if let Some(task) = drain_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => drain_failure = Some(e),
                Err(e) => error!(error = %e, "Drain task panicked"),
            }
        }
        if let Some(task) = duration_task {
            let _ = task.await;
        }

        // Keep the wake receiver until teardown completes so late stop
        // requests do not look like a missing session.
        let _wake_rx = stop_task.await;

        if let Some(e) = drain_failure {
            return Err(e.into());
        }

        if cfg.local_capture {
            if let Some(target_dir) = cfg.target_dir.as_deref() {
                self.write_local_metadata(target_dir, &cfg, &enabled, captured_spes)?;
            }
        }

        info!("Profiling ended");

        {
            let mut state = self.state();
            state.others.clear();
            state.primary = None;
        }
        self.sender.lock().await.shutdown().await?;

        let command = self.state().command.clone();
        if let Some(command) = command {
            info!(pid = command.pid(), "Waiting for command");
            command.join().await;
            info!("Command finished");
        }
        Ok(())
    }

    fn write_local_metadata(
        &self,
        target_dir: &std::path::Path,
        cfg: &SessionConfig,
        enabled: &[EnabledCounter],
        spes: Vec<CapturedSpe>,
    ) -> Result<(), CaptureError> {
        local::write_captured_meta(
            target_dir,
            &local::CapturedMeta {
                duration_s: cfg.duration.map(|d| d.as_secs()).unwrap_or(0),
                one_shot: cfg.one_shot,
                command: cfg.capture_command.clone(),
                pids: cfg.pids.iter().copied().collect(),
                spes,
            },
        )?;
        local::write_counters_meta(target_dir, enabled)?;
        Ok(())
    }

    /// Prepares and starts a secondary source, registering it under the
    /// state mutex. A source registered after end-of-session is
    /// interrupted before anything can observe it running.
    async fn prepare_and_start(
        &self,
        source: Arc<dyn Source>,
        name: &'static str,
    ) -> Result<(), CaptureError> {
        source
            .prepare()
            .await
            .map_err(|e| CaptureError::SourcePrepare { name, source: e })?;
        source.start();
        let mut state = self.state();
        if state.ended {
            source.interrupt();
        }
        state.others.push(source);
        Ok(())
    }

    /// The single end-of-session fan-out. Idempotent.
    pub fn do_end_session(&self) {
        let mut state = self.state();
        state.ended = true;
        if let Some(command) = &state.command {
            command.cancel();
        }
        self.active.store(false, Ordering::Release);
        if let Some(primary) = &state.primary {
            primary.interrupt();
        }
        for source in &state.others {
            source.interrupt();
        }
        self.halt.add_permits(1);
    }

    /// Stop task: waits for any termination trigger, answers PINGs, then
    /// performs the end-of-session fan-out. Returns the wake receiver so
    /// the orchestrator can keep it alive through teardown.
    async fn stop_task(
        self: Arc<Self>,
        mut wake_rx: mpsc::UnboundedReceiver<()>,
        control: Option<ControlChannel>,
    ) -> mpsc::UnboundedReceiver<()> {
        let mut control = control;
        loop {
            match &mut control {
                Some(channel) => {
                    tokio::select! {
                        biased;
                        _ = wake_rx.recv() => {
                            self.log_wake_reason();
                            break;
                        }
                        event = channel.next_capture_event() => match event {
                            ControlEvent::Stop => {
                                info!("Stop command received");
                                break;
                            }
                            ControlEvent::Ping => {
                                debug!("Ping command received");
                                let mut sender = self.sender.lock().await;
                                if sender.write_data(FrameType::Ack, &[], false).await.is_ok() {
                                    let _ = sender.flush().await;
                                }
                            }
                            ControlEvent::Closed => {
                                info!("Client disconnected");
                                break;
                            }
                        }
                    }
                }
                None => {
                    let _ = wake_rx.recv().await;
                    self.log_wake_reason();
                    break;
                }
            }
        }

        self.do_end_session();
        debug!("Exit stop task");
        wake_rx
    }

    fn log_wake_reason(&self) {
        let signum = self.signal_number.load(Ordering::Acquire);
        if signum != 0 {
            info!(signal = signal_name(signum), "Shutting down due to signal");
        }
    }

    fn take_control(&self) -> Option<ControlChannel> {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn put_control(&self, control: ControlChannel) {
        *self.control.lock().unwrap_or_else(PoisonError::into_inner) = Some(control);
    }

    /// Fatal funnel: report the error, tear the sink down, remove an
    /// incomplete local capture, and exit. A second fatal error during
    /// this cleanup exits immediately.
    pub async fn cleanup_fatal(&self, message: &str) -> ! {
        if !fatal::first_fatal() {
            info!("Received multiple fatal errors, terminating");
            process::exit(EXIT_SECOND_FATAL);
        }

        let command = self.state().command.clone();
        if let Some(command) = command {
            command.cancel();
        }

        if self.live {
            let mut sender = self.sender.lock().await;
            let _ = sender
                .write_data(FrameType::Error, message.as_bytes(), true)
                .await;
            let _ = sender.flush().await;
            // The client cannot close before it has issued its command;
            // wait for one byte so the ERROR frame is observed.
            if self.waiting_on_client.load(Ordering::Acquire) {
                if let Some(mut control) = self.take_control() {
                    control.read_ack_byte().await;
                }
            }
            let _ = sender.shutdown().await;
        }

        if self.cfg.local_capture {
            if let Some(target_dir) = self.cfg.target_dir.as_deref() {
                info!("Cleaning incomplete capture directory");
                if let Err(e) = local::remove_capture_dir(target_dir) {
                    error!(error = %e, "Could not remove incomplete capture directory");
                }
            }
        }

        process::exit(EXIT_FATAL);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let previous = SESSION_LIVE.swap(false, Ordering::AcqRel);
        debug_assert!(previous, "capture session dropped twice");
    }
}

/// Ends the session once every watched pid has exited, polling `/proc`
/// once a second.
async fn watch_pids_task(mut pids: BTreeSet<u32>, end_gate: CancellationToken, stop: StopHandle) {
    while !pids.is_empty() {
        if timeout(WATCH_PIDS_POLL, end_gate.cancelled()).await.is_ok() {
            debug!("Exit watch pids task by request");
            return;
        }
        let alive = proc::alive_pids();
        pids.retain(|pid| {
            let still_alive = alive.contains(pid);
            if !still_alive {
                debug!(pid, "Watched pid exited");
            }
            still_alive
        });
    }
    info!("Ending session because all watched processes have exited");
    stop.request_stop();
    debug!("Exit watch pids task");
}
