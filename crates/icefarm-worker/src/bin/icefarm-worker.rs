//! Worker binary entry point: wires the database, device manager, worker
//! event bus and HTTP server together (spec.md §4.1-§4.3). CLI shape follows
//! the teacher's `vaultbackup-rs` (`#[derive(Parser)]`, `anyhow::Result` at
//! `main`). The console logger is installed once, optionally behind
//! `log_forward`'s buffering wrapper when `--control-url` is given.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use icefarm_common::model::Worker;
use icefarm_db::Db;
use icefarm_worker::control_client::ControlClient;
use icefarm_worker::device::env::DeviceEnv;
use icefarm_worker::device::firmware::{FirmwareImage, FirmwareSet};
use icefarm_worker::device::DeviceManager;
use icefarm_worker::hotplug::{ChannelHotplugSource, ChannelKernelEventSource};
use icefarm_worker::usbip::CliUsbIpController;

#[derive(Debug, Parser)]
#[clap(name = "icefarm-worker")]
#[clap(about = "iCEFARM worker: manages the boards attached to this host.", long_about = None)]
struct Cli {
    /// This worker's unique name, advertised to control.
    #[clap(long)]
    name: String,

    /// Address this worker's HTTP API (reserve/unreserve) listens on.
    #[clap(long, default_value = "0.0.0.0:7000")]
    http_bind: String,

    /// Address this worker's event bus (client connections) listens on.
    #[clap(long, default_value = "0.0.0.0:7001")]
    bus_bind: String,

    /// Advertised IP, as control and clients should dial it.
    #[clap(long)]
    advertise_ip: String,

    /// Path to the sqlite database shared with control.
    #[clap(long)]
    db_path: String,

    /// Path to the default firmware image (installed on every unreserve).
    #[clap(long)]
    default_firmware: PathBuf,

    /// Path to the pulse-count reservable firmware image.
    #[clap(long)]
    pulsecount_firmware: PathBuf,

    /// USB model ids (`vendor:product`) this worker will adopt as devices.
    #[clap(long, value_delimiter = ',', default_value = "1209:3613")]
    allow_list: Vec<String>,

    /// Path to the `usbip` binary.
    #[clap(long, default_value = "usbip")]
    usbip_binary: String,

    /// Seconds to wait for a flash attempt before marking the board broken.
    #[clap(long, default_value_t = 30)]
    flash_timeout_secs: u64,

    /// Seconds between heartbeats written to the shared database.
    #[clap(long, default_value_t = 10)]
    heartbeat_interval_secs: u64,

    /// Base URL of the control HTTP API, for pushing aggregated logs
    /// (spec.md §6 `/log`). Log forwarding is disabled if omitted.
    #[clap(long)]
    control_url: Option<String>,

    /// Seconds between log-forwarding flushes to control.
    #[clap(long, default_value_t = 30)]
    log_forward_interval_secs: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let console_logger = env_logger::Builder::from_default_env().build();
    let max_level = console_logger.filter();
    let log_buffer = match &cli.control_url {
        Some(url) => {
            let handle = icefarm_worker::log_forward::install(Box::new(console_logger), log::Level::Info)
                .context("installing log forwarder")?;
            log::set_max_level(max_level);
            Some((handle, ControlClient::new(url, cli.name.clone()).context("parsing control URL")?))
        }
        None => {
            log::set_boxed_logger(Box::new(console_logger)).context("installing console logger")?;
            log::set_max_level(max_level);
            None
        }
    };

    let db = Db::open(&cli.db_path).with_context(|| format!("opening database at {}", cli.db_path))?;

    let http_port = parse_port(&cli.http_bind)?;
    let bus_port = parse_port(&cli.bus_bind)?;

    let mut reservables = BTreeSet::new();
    reservables.insert(icefarm_worker::device::state::pulsecount::KIND.to_string());

    icefarm_db::queries::worker::add_worker(
        &db,
        &Worker {
            name: cli.name.clone(),
            ip: cli.advertise_ip.clone(),
            port: http_port,
            bus_port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            reservables,
            last_heartbeat: Utc::now(),
            shutting_down: false,
        },
    )
    .context("registering worker row")?;

    let default_image = FirmwareImage {
        kind: "default".into(),
        bytes: std::fs::read(&cli.default_firmware).context("reading default firmware image")?,
    };
    let pulsecount_image = FirmwareImage {
        kind: icefarm_worker::device::state::pulsecount::KIND.to_string(),
        bytes: std::fs::read(&cli.pulsecount_firmware).context("reading pulse-count firmware image")?,
    };
    let firmware = Arc::new(FirmwareSet::new(default_image).with_reservable(pulsecount_image));

    let usbip = Arc::new(CliUsbIpController::new(cli.usbip_binary));
    let bootloader_fs = Arc::new(icefarm_worker::device::bootloader_fs::RealBootloaderFs);

    // The bus publish closure and the serial-port opener both need the
    // `WorkerBus`/real port, but `DeviceEnv` is built before the bus exists;
    // break the cycle with a once-populated slot the closure reads through.
    let bus_slot: Arc<std::sync::OnceLock<Arc<icefarm_worker::bus::WorkerBus>>> = Arc::new(std::sync::OnceLock::new());
    let bus_slot_for_publish = bus_slot.clone();
    let publish = Arc::new(move |event: icefarm_common::Event| {
        if let Some(bus) = bus_slot_for_publish.get() {
            bus.publish(event);
        }
    });
    let open_serial = Arc::new(|path: &str| {
        icefarm_worker::serial::RealSerialPort::open(path, 115_200)
            .map(|p| Box::new(p) as Box<dyn icefarm_worker::serial::SerialPort>)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    });

    let env = Arc::new(DeviceEnv::new(
        cli.name.clone(),
        db.clone(),
        usbip,
        bootloader_fs,
        firmware,
        Duration::from_secs(cli.flash_timeout_secs),
        publish,
        open_serial,
    ));

    let allow_list: BTreeSet<String> = cli.allow_list.into_iter().collect();
    let manager = Arc::new(DeviceManager::new(cli.name.clone(), env, allow_list));

    let bus = icefarm_worker::bus::WorkerBus::new(db.clone(), manager.clone());
    bus_slot.set(bus.clone()).ok();

    // Hot-plug / kernel-event sourcing: udev parsing is out of scope
    // (spec.md §1); this binary exposes the channel senders for an
    // out-of-tree udev bridge to feed, and performs the cold-boot replay
    // with whatever (possibly empty) initial snapshot that bridge supplies
    // up front. A bare `icefarm-worker` invocation with no bridge attached
    // simply manages zero devices until one connects.
    let (_hotplug_tx, hotplug_source) = ChannelHotplugSource::new();
    let (_kernel_tx, kernel_source) = ChannelKernelEventSource::new();
    manager.initial_scan(Vec::new());

    let exiting = Arc::new(AtomicBool::new(false));
    let heartbeat_db = db.clone();
    let heartbeat_name = cli.name.clone();
    let heartbeat_interval = Duration::from_secs(cli.heartbeat_interval_secs);
    let heartbeat_exiting = exiting.clone();
    std::thread::spawn(move || icefarm_worker::heartbeat::run(heartbeat_db, heartbeat_name, heartbeat_interval, heartbeat_exiting));

    if let Some((buffer, control_client)) = log_buffer {
        let interval = Duration::from_secs(cli.log_forward_interval_secs);
        let exiting = exiting.clone();
        std::thread::spawn(move || icefarm_worker::log_forward::run(buffer, control_client, interval, exiting));
    }

    {
        let manager = manager.clone();
        std::thread::spawn(move || manager.run_hotplug(&hotplug_source));
    }

    {
        let manager = manager.clone();
        std::thread::spawn(move || manager.run_kernel_events(&kernel_source));
    }

    {
        let bus_bind = cli.bus_bind.clone();
        std::thread::spawn(move || {
            if let Err(err) = bus.serve(&bus_bind) {
                log::error!(target: "icefarm_worker", "event bus server exited: {err}");
            }
        });
    }

    log::info!(target: "icefarm_worker", "worker {} starting, http api on {}", cli.name, cli.http_bind);
    icefarm_worker::http_api::serve(manager, &cli.http_bind)?;
    Ok(())
}

fn parse_port(bind: &str) -> Result<u16> {
    bind.rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .with_context(|| format!("could not parse a port out of bind address {bind}"))
}
