//! percapd - capture child of the percap profiling daemon
//!
//! Runs one capture session and exits. Live mode accepts a single
//! profiler client on a TCP port and streams framed capture data to it;
//! local mode writes the capture into an on-disk directory.
//!
//! # Usage
//!
//! ```bash
//! # Live mode: wait for one client on port 8080
//! percapd --port 8080
//!
//! # Local capture for 10 seconds into ./session.apc
//! percapd --output ./session.apc --duration 10
//!
//! # Profile a command, stopping when it exits
//! percapd --output ./session.apc --stop-on-exit -- ./my-benchmark --iterations 100
//!
//! # Watch existing pids
//! percapd --output ./session.apc --stop-on-exit --pid 1234 --pid 5678
//!
//! # Enable debug logging
//! RUST_LOG=percapd=debug percapd --port 8080
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use percap_core::{CounterCaptureMode, CounterConfig, SessionConfig, SpeConfig};
use percapd::capture::CaptureSession;
use percapd::control::ControlChannel;
use percapd::drivers::DriverRegistry;
use percapd::ml::GlobalCounterRegistry;
use percapd::signals;

/// ML sample period handed to connected sessions, in microseconds.
const ML_SAMPLE_PERIOD_US: u32 = 10_000;

/// percap capture daemon
#[derive(Parser, Debug)]
#[command(name = "percapd", version, about)]
struct Args {
    /// Live mode: accept one profiler client on this TCP port
    #[arg(long, conflicts_with = "output")]
    port: Option<u16>,

    /// Local mode: target capture directory
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Counter to capture (repeatable), e.g. cpu.user or ml:inference:cycles
    #[arg(short = 'C', long = "counter")]
    counters: Vec<String>,

    /// SPE configuration id to capture (repeatable)
    #[arg(long = "spe")]
    spes: Vec<String>,

    /// Pid to watch (repeatable)
    #[arg(long = "pid")]
    pids: Vec<u32>,

    /// Wait until a process with this name exists before capturing
    #[arg(long)]
    wait_process: Option<String>,

    /// Capture duration in seconds (0 = unbounded)
    #[arg(short = 'd', long, default_value_t = 0)]
    duration: u64,

    /// Hold all data until end-of-session, then flush once
    #[arg(long)]
    one_shot: bool,

    /// End the session when all watched pids have exited
    #[arg(long)]
    stop_on_exit: bool,

    /// Stream the tracefs pipe through the external source
    #[arg(long)]
    ftrace: bool,

    /// Counter defaults file merged with command-line counters
    #[arg(long)]
    defaults: Option<PathBuf>,

    /// Session settings file (local mode)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Binary image to copy into the capture directory (repeatable)
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// Command to spawn and profile
    #[arg(last = true)]
    command: Vec<String>,
}

impl Args {
    fn into_config(self) -> Result<(SessionConfig, Option<u16>)> {
        if self.port.is_none() && self.output.is_none() {
            bail!("either --port (live) or --output (local) is required");
        }
        let cfg = SessionConfig {
            counters: self.counters.into_iter().map(CounterConfig::named).collect(),
            spes: self.spes.into_iter().map(SpeConfig::new).collect(),
            capture_command: self.command,
            pids: self.pids.into_iter().collect::<BTreeSet<u32>>(),
            wait_process: self.wait_process,
            duration: match self.duration {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            one_shot: self.one_shot,
            stop_on_exit: self.stop_on_exit,
            local_capture: self.output.is_some(),
            target_dir: self.output,
            images: self.images,
            defaults_path: self.defaults,
            settings_path: self.settings,
            ftrace: self.ftrace,
            ..SessionConfig::default()
        };
        Ok((cfg, self.port))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("percapd=info".parse()?)
                .add_directive("percap_core=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let (cfg, port) = args.into_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        live = port.is_some(),
        "percapd starting"
    );

    let global = Arc::new(GlobalCounterRegistry::new(
        CounterCaptureMode::Periodic,
        ML_SAMPLE_PERIOD_US,
    ));
    let drivers = DriverRegistry::new(global);

    let session = match port {
        Some(port) => {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("Failed to bind port {port}"))?;
            info!(port, "Waiting for client");
            let (stream, peer) = listener
                .accept()
                .await
                .context("Failed to accept client")?;
            info!(peer = %peer, "Client connected");
            let (reader, writer) = stream.into_split();
            CaptureSession::new_live(cfg, drivers, ControlChannel::new(reader), writer)
        }
        None => CaptureSession::new_local(cfg, drivers),
    };

    // Handlers are installed only after the session singleton exists.
    let _signal_driver =
        signals::spawn(session.stop_handle()).context("Failed to install signal handlers")?;

    if let Err(e) = session.run().await {
        error!(error = %e, "Fatal capture error");
        session.cleanup_fatal(&e.to_string()).await;
    }

    info!("percapd stopped");
    Ok(())
}
