//! Control binary entry point: wires the database, reservation engine,
//! control event bus and HTTP server together (spec.md §4.4-§4.5). CLI shape
//! follows the teacher's `vaultbackup-rs` (`#[derive(Parser)]`,
//! `anyhow::Result` at `main`, `env_logger::init()` once).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use clap::Parser;
use icefarm_common::config::LeaseConfig;
use icefarm_control::bus::ControlBus;
use icefarm_control::engine::Engine;
use icefarm_db::Db;

#[derive(Debug, Parser)]
#[clap(name = "icefarm-control")]
#[clap(about = "iCEFARM control: reservation engine for the fleet.", long_about = None)]
struct Cli {
    /// Address the control HTTP API (reserve/extend/end/...) listens on.
    #[clap(long, default_value = "0.0.0.0:8000")]
    http_bind: String,

    /// Address the control event bus (client connections) listens on.
    #[clap(long, default_value = "0.0.0.0:8001")]
    bus_bind: String,

    /// Path to the sqlite database shared with every worker.
    #[clap(long)]
    db_path: String,

    /// Reservation lease duration, in seconds.
    #[clap(long, default_value_t = 60)]
    lease_secs: i64,

    /// How long before expiry a reservation is flagged "ending soon".
    #[clap(long, default_value_t = 20)]
    warning_window_secs: i64,

    /// How long a worker may go without a heartbeat before it is considered lost.
    #[clap(long, default_value_t = 30)]
    worker_timeout_secs: i64,

    /// How often the ending-soon / expiry / worker-timeout scans run.
    #[clap(long, default_value_t = 5)]
    scan_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let db = Db::open(&cli.db_path).with_context(|| format!("opening database at {}", cli.db_path))?;

    let lease = LeaseConfig {
        lease: ChronoDuration::seconds(cli.lease_secs),
        warning_window: ChronoDuration::seconds(cli.warning_window_secs),
        worker_timeout: ChronoDuration::seconds(cli.worker_timeout_secs),
    };

    let bus = ControlBus::new();
    let engine = Engine::new(db.clone(), bus.clone(), lease);

    {
        let notify = db.notify.clone();
        let bus = bus.clone();
        std::thread::spawn(move || icefarm_control::bus::run_notify_fanout(notify, bus));
    }

    let scan_interval = Duration::from_secs(cli.scan_interval_secs);
    {
        let engine = engine.clone();
        std::thread::spawn(move || engine.run_ending_soon_scan(scan_interval));
    }
    {
        let engine = engine.clone();
        std::thread::spawn(move || engine.run_expiry_scan(scan_interval));
    }
    {
        let engine = engine.clone();
        std::thread::spawn(move || engine.run_worker_timeout_scan(scan_interval));
    }

    {
        let bus_bind = cli.bus_bind.clone();
        let bus = bus.clone();
        std::thread::spawn(move || {
            if let Err(err) = bus.serve(&bus_bind) {
                log::error!(target: "icefarm_control", "event bus server exited: {err}");
            }
        });
    }

    log::info!(target: "icefarm_control", "control starting, http api on {}", cli.http_bind);
    icefarm_control::http_api::serve(engine, &cli.http_bind)?;
    Ok(())
}
