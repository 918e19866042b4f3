//! Keeps this worker's row fresh in the shared database so control's
//! `handle_worker_timeouts` periodic task (spec.md §4.4) never treats a live
//! worker as lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use icefarm_db::Db;

/// Runs on its own thread until `exiting` is set, heartbeating every
/// `interval`. `interval` should be comfortably under the control side's
/// `worker_timeout` (spec.md §5 "Graceful shutdown sets an `exiting` flag
/// visible to every waiting goroutine").
pub fn run(db: Db, worker_name: String, interval: Duration, exiting: Arc<AtomicBool>) {
    while !exiting.load(Ordering::SeqCst) {
        if let Err(err) = icefarm_db::queries::worker::heartbeat_worker(&db, &worker_name, Utc::now()) {
            log::error!(target: "icefarm_worker::heartbeat", "heartbeat failed: {err}");
        }
        std::thread::sleep(interval);
    }
}
