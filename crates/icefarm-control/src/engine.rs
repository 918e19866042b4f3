//! Control reservation engine (spec.md §4.4): assignment, extension,
//! expiry, worker-timeout scans, and worker dispatch. Every mutation runs
//! through `icefarm-db`'s transactional stored routines; "concurrent-
//! reservation races are resolved inside the database operation ... not in
//! engine code" - this module only orchestrates dispatch and fan-out around
//! those calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::Utc;
use icefarm_common::config::LeaseConfig;
use icefarm_common::event::{Event, EventKind};
use icefarm_db::Db;
use serde_json::Value;

use crate::bus::ControlBus;
use crate::worker_client;

#[derive(Debug)]
pub enum EngineError {
    Db(rusqlite::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Db(err) => write!(f, "database error: {err}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Db(err)
    }
}

pub struct Engine {
    db: Db,
    bus: Arc<ControlBus>,
    lease: LeaseConfig,
}

impl Engine {
    pub fn new(db: Db, bus: Arc<ControlBus>, lease: LeaseConfig) -> Arc<Self> {
        Arc::new(Engine { db, bus, lease })
    }

    /// `reserve(amount, client_id, kind, args)` (spec.md §4.4). Returns the
    /// connection tuples for whatever subset of `amount` was actually
    /// available; dispatches an async `reserve` call to each selected
    /// device's worker without blocking on the outcome.
    pub fn reserve(
        &self,
        amount: usize,
        client_id: &str,
        kind: &str,
        args: HashMap<String, Value>,
    ) -> Result<Vec<(String, String, u16)>, EngineError> {
        let now = Utc::now();
        let selected = icefarm_db::queries::reservation::make_reservations(&self.db, amount, client_id, kind, now, self.lease.lease)?;
        let tuples = selected.iter().map(|(d, w)| (d.serial.clone(), w.ip.clone(), w.bus_port)).collect();
        self.dispatch_reserves(selected, kind, args);
        Ok(tuples)
    }

    /// `reserveSpecific`: reserves exactly the requested serials that are
    /// currently `available`, skipping the rest.
    pub fn reserve_specific(
        &self,
        serials: &[String],
        client_id: &str,
        kind: &str,
        args: HashMap<String, Value>,
    ) -> Result<Vec<(String, String, u16)>, EngineError> {
        let now = Utc::now();
        let selected = icefarm_db::queries::reservation::reserve_specific(&self.db, serials, client_id, now, self.lease.lease)?;
        let tuples = selected.iter().map(|(d, w)| (d.serial.clone(), w.ip.clone(), w.bus_port)).collect();
        self.dispatch_reserves(selected, kind, args);
        Ok(tuples)
    }

    fn dispatch_reserves(&self, selected: Vec<(icefarm_common::model::Device, icefarm_common::model::Worker)>, kind: &str, args: HashMap<String, Value>) {
        for (device, worker) in selected {
            let kind = kind.to_string();
            let args = args.clone();
            thread::spawn(move || worker_client::dispatch_reserve(&worker.ip, worker.port, &device.serial, &kind, args));
        }
    }

    pub fn extend(&self, client_id: &str, serials: &[String]) -> Result<Vec<String>, EngineError> {
        Ok(icefarm_db::queries::reservation::extend_reservations(&self.db, client_id, serials, Utc::now(), self.lease.lease)?)
    }

    pub fn extend_all(&self, client_id: &str) -> Result<Vec<String>, EngineError> {
        Ok(icefarm_db::queries::reservation::extend_all_reservations(&self.db, client_id, Utc::now(), self.lease.lease)?)
    }

    pub fn end(&self, client_id: &str, serials: &[String]) -> Result<Vec<String>, EngineError> {
        let ended = icefarm_db::queries::reservation::end_reservations(&self.db, client_id, serials)?;
        for serial in &ended {
            self.dispatch_unreserve(serial);
        }
        Ok(ended)
    }

    pub fn end_all(&self, client_id: &str) -> Result<Vec<String>, EngineError> {
        let ended = icefarm_db::queries::reservation::end_all_reservations(&self.db, client_id)?;
        for serial in &ended {
            self.dispatch_unreserve(serial);
        }
        Ok(ended)
    }

    fn dispatch_unreserve(&self, serial: &str) {
        let Ok(Some(device)) = icefarm_db::queries::device::get_device(&self.db, serial) else { return };
        let Ok(Some(worker)) = icefarm_db::queries::worker::get_worker(&self.db, &device.worker) else { return };
        let serial = serial.to_string();
        thread::spawn(move || worker_client::dispatch_unreserve(&worker.ip, worker.port, &serial));
    }

    pub fn available(&self) -> Result<u32, EngineError> {
        Ok(icefarm_db::queries::device::available_count(&self.db)?)
    }

    /// `reboot` (spec.md §4.4's verb list): forwards a `reset` request into
    /// the device's state handler registry via the worker's `/request`
    /// route. Out of scope for §6's HTTP table, which only details the
    /// reservation verbs.
    pub fn reboot(&self, serial: &str) -> Result<(), EngineError> {
        let Ok(Some(device)) = icefarm_db::queries::device::get_device(&self.db, serial) else { return Ok(()) };
        let Ok(Some(worker)) = icefarm_db::queries::worker::get_worker(&self.db, &device.worker) else { return Ok(()) };
        let serial = serial.to_string();
        thread::spawn(move || worker_client::dispatch_request(&worker.ip, worker.port, &serial, "reset", HashMap::new()));
        Ok(())
    }

    /// `delete` (spec.md §3 "destroyed only on explicit removal or worker
    /// teardown"): ends any outstanding reservation regardless of owner,
    /// then removes the device row.
    pub fn delete(&self, serial: &str) -> Result<(), EngineError> {
        if let Some(owner) = icefarm_db::queries::reservation::get_reservation_owner(&self.db, serial)? {
            icefarm_db::queries::reservation::end_reservations(&self.db, &owner, &[serial.to_string()])?;
            self.dispatch_unreserve(serial);
        }
        icefarm_db::queries::device::delete_device(&self.db, serial)?;
        Ok(())
    }

    /// `/log` (spec.md §6): workers push textual diagnostics here for
    /// aggregation; control just logs them under the worker's name.
    pub fn log(&self, worker_name: &str, lines: Vec<String>) {
        for line in lines {
            log::info!(target: "icefarm_control::worker_log", "[{worker_name}] {line}");
        }
    }

    /// Periodic task (a): reservations ending within the warning window get
    /// a `reservation ending soon` push to their owning client. Runs until
    /// the process exits.
    pub fn run_ending_soon_scan(&self, interval: StdDuration) {
        loop {
            match icefarm_db::queries::reservation::get_reservations_ending_soon(&self.db, Utc::now(), self.lease.warning_window) {
                Ok(reservations) => {
                    for r in reservations {
                        self.bus.send_to(&r.client_id, &Event::new(r.serial, EventKind::ReservationEndingSoon));
                    }
                }
                Err(err) => log::error!(target: "icefarm_control::engine", "ending-soon scan failed: {err}"),
            }
            thread::sleep(interval);
        }
    }

    /// Periodic task (b): expires reservations past their deadline and
    /// unreserves the freed device on its worker. The `reservation end` push
    /// to the prior owner is not done here - `handle_reservation_timeouts`
    /// already publishes `ReservationExpired` on the shared notify bus, and
    /// `run_notify_fanout` is the single place that turns notifications into
    /// bus pushes, so every expiry path (this scan, direct `end`, worker
    /// loss) fans out exactly once.
    pub fn run_expiry_scan(&self, interval: StdDuration) {
        loop {
            match icefarm_db::queries::reservation::handle_reservation_timeouts(&self.db, Utc::now()) {
                Ok(expired) => {
                    for (serial, _client_id) in expired {
                        self.dispatch_unreserve(&serial);
                    }
                }
                Err(err) => log::error!(target: "icefarm_control::engine", "expiry scan failed: {err}"),
            }
            thread::sleep(interval);
        }
    }

    /// Periodic task (c): workers whose heartbeat has gone stale are treated
    /// as lost; `handle_worker_timeouts` deletes their devices' reservations
    /// and publishes `WorkerLost`, which `run_notify_fanout` turns into a
    /// `failure` push for each prior owner (spec.md §7 "Worker loss").
    pub fn run_worker_timeout_scan(&self, interval: StdDuration) {
        loop {
            if let Err(err) = icefarm_db::queries::worker::handle_worker_timeouts(&self.db, Utc::now(), self.lease.worker_timeout) {
                log::error!(target: "icefarm_control::engine", "worker-timeout scan failed: {err}");
            }
            thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use icefarm_common::model::{DeviceStatus, Worker};
    use std::collections::BTreeSet;

    fn seed_worker(db: &Db, name: &str, kind: &str) {
        let mut reservables = BTreeSet::new();
        reservables.insert(kind.to_string());
        icefarm_db::queries::add_worker(
            db,
            &Worker { name: name.into(), ip: "127.0.0.1".into(), port: 9100, bus_port: 9101, version: "1".into(), reservables, last_heartbeat: Utc::now(), shutting_down: false },
        )
        .unwrap();
    }

    fn engine_with(db: Db) -> Arc<Engine> {
        let bus = ControlBus::new();
        Engine::new(db, bus, LeaseConfig { lease: Duration::seconds(60), warning_window: Duration::seconds(20), worker_timeout: Duration::seconds(30) })
    }

    #[test]
    fn reserve_respects_kind_and_amount() {
        let db = Db::open_in_memory().unwrap();
        seed_worker(&db, "w1", "pulsecount");
        icefarm_db::queries::add_device(&db, "s1", "w1").unwrap();
        icefarm_db::queries::update_device_status(&db, "s1", DeviceStatus::Available).unwrap();
        let engine = engine_with(db);

        let reserved = engine.reserve(1, "client-a", "pulsecount", HashMap::new()).unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].0, "s1");
    }

    #[test]
    fn delete_ends_reservation_regardless_of_caller() {
        let db = Db::open_in_memory().unwrap();
        seed_worker(&db, "w1", "pulsecount");
        icefarm_db::queries::add_device(&db, "s1", "w1").unwrap();
        icefarm_db::queries::update_device_status(&db, "s1", DeviceStatus::Available).unwrap();
        let engine = engine_with(db.clone());
        engine.reserve(1, "client-a", "pulsecount", HashMap::new()).unwrap();

        engine.delete("s1").unwrap();
        assert!(icefarm_db::queries::device::get_device(&db, "s1").unwrap().is_none());
        assert!(!icefarm_db::queries::reservation::has_reservations(&db, "client-a").unwrap());
    }

    #[test]
    fn available_reflects_fleet_state() {
        let db = Db::open_in_memory().unwrap();
        seed_worker(&db, "w1", "pulsecount");
        icefarm_db::queries::add_device(&db, "s1", "w1").unwrap();
        icefarm_db::queries::update_device_status(&db, "s1", DeviceStatus::Available).unwrap();
        let engine = engine_with(db);
        assert_eq!(engine.available().unwrap(), 1);
    }
}
