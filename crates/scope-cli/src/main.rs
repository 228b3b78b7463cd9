//! `scope-cli` – the `scope-camera` device service
//!
//! Starts one camera service:
//!
//! 1. Loads `scope.toml` (or the file given with `--config`), layers
//!    `SCOPE_*` environment overrides and then command-line flags on top.
//! 2. Spawns the WebSocket bridge on a background Tokio runtime: command
//!    ingest, status forwarding and the data endpoint.
//! 3. Opens the sensor, prepares acquisition and runs the acquisition loop
//!    on the main thread until a `shutdown` command arrives.
//! 4. Intercepts **Ctrl-C** and turns it into a `shutdown` command so the
//!    hardware is always released through the normal path.

mod config;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

use scope_hal::HardwareSession;
use scope_hal::sim::SimSensor;
use scope_kernel::AcquisitionStateMachine;
use scope_middleware::MessageBus;
use scope_middleware::WsBridge;
use scope_middleware::ws_bridge::client_url;
use scope_runtime::{AcquisitionLoop, CommandRouter, LogFormat, StatusPublisher, init_tracing};
use scope_types::DeviceError;

use crate::config::Config;

/// Command-line flags. Every flag overrides the matching config entry.
#[derive(Parser, Debug)]
#[command(name = "scope-camera", version, about = "Imaging device control service")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "scope.toml")]
    config: PathBuf,

    /// Device name, also the command topic.
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    serial_number: Option<String>,

    /// Command hub address, e.g. `localhost:5001`.
    #[arg(long)]
    commands: Option<String>,

    /// Status hub address, e.g. `localhost:5000`.
    #[arg(long)]
    status: Option<String>,

    /// Data endpoint listen address, e.g. `*:5003`.
    #[arg(long)]
    data: Option<String>,

    /// `1` = internal, `2` = external exposure.
    #[arg(long)]
    trigger_mode: Option<i64>,

    #[arg(long)]
    stack_size: Option<u32>,

    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Args {
    fn apply(self, cfg: &mut Config) {
        if let Some(v) = self.name {
            cfg.name = v;
        }
        if let Some(v) = self.serial_number {
            cfg.serial_number = v;
        }
        if let Some(v) = self.commands {
            cfg.commands = v;
        }
        if let Some(v) = self.status {
            cfg.status = v;
        }
        if let Some(v) = self.data {
            cfg.data = v;
        }
        if let Some(v) = self.trigger_mode {
            cfg.trigger_mode = v;
        }
        if let Some(v) = self.stack_size {
            cfg.stack_size = v;
        }
        if let Some(v) = self.log_format {
            cfg.log_format = v;
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let mut cfg = match config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut cfg);

    // ── Structured logging ────────────────────────────────────────────────
    let _guard = init_tracing("scope-camera", cfg.log_format);

    match run(&cfg) {
        Ok(()) => {
            info!(device = %cfg.name, "service stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(device = %cfg.name, error = %e, "service aborted");
            ExitCode::FAILURE
        }
    }
}

fn run(cfg: &Config) -> Result<(), DeviceError> {
    let device = cfg.device_config()?;
    info!(
        device = %device.name(),
        serial = %device.serial_number(),
        trigger = ?device.trigger_mode(),
        geometry = %device.geometry(),
        stack_size = device.batch_size(),
        "starting device service"
    );

    // ── Transport ─────────────────────────────────────────────────────────
    let bus = MessageBus::default();
    let commands = bus.subscribe_commands(device.name());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| DeviceError::Channel(format!("failed to start I/O runtime: {e}")))?;
    let listener = runtime.block_on(WsBridge::bind_data(&cfg.data))?;
    let bridge = WsBridge::new(bus.clone());
    runtime.spawn(bridge.clone().serve_data(listener));
    runtime.spawn(bridge.clone().ingest_commands(client_url(&cfg.commands)));
    runtime.spawn(bridge.forward_status(client_url(&cfg.status)));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let bus_ctrlc = bus.clone();
    let shutdown_line = format!("{} shutdown", device.name());
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Ctrl-C received, shutting down");
        if let Err(e) = bus_ctrlc.publish_command(shutdown_line.as_str()) {
            error!(error = %e, "failed to deliver shutdown command");
        }
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not release the sensor cleanly");
    }

    // ── Hardware ──────────────────────────────────────────────────────────
    let sensor = SimSensor::open(device.serial_number())?;
    let session = HardwareSession::open(sensor, cfg.slot_count, cfg.frame_timeout())?;
    for (property, value) in session.describe() {
        info!(property = %property, value = %value, "sensor property");
    }

    let mut machine = AcquisitionStateMachine::new(session, *device.settings());
    match machine.prepare() {
        Ok(()) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => warn!(error = %e, "initial configuration rejected; device stays idle"),
    }

    // ── Acquisition loop ──────────────────────────────────────────────────
    let publisher = StatusPublisher::new(bus.clone(), cfg.listeners.clone());
    let router = CommandRouter::new(device);
    let result = AcquisitionLoop::new(machine, router, commands, publisher, bus).run();

    runtime.shutdown_background();
    result
}
