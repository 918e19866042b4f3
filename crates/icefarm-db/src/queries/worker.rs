//! `add_worker`, `heartbeat_worker`, `shutdown_worker`, `handle_worker_timeouts`,
//! and the supplemented `list_workers`/`get_worker` diagnostics (spec.md §6,
//! plus `original_source/src/icefarm/control/ControlDatabase.py`).

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use icefarm_common::model::Worker;
use rusqlite::{params, OptionalExtension};

use crate::notify::Notification;
use crate::pool::Db;
use crate::time::{from_epoch, to_epoch};

fn row_to_worker(row: &rusqlite::Row) -> rusqlite::Result<Worker> {
    let reservables_json: String = row.get("reservables")?;
    let reservables: BTreeSet<String> = serde_json::from_str(&reservables_json).unwrap_or_default();
    Ok(Worker {
        name: row.get("name")?,
        ip: row.get("ip")?,
        port: row.get::<_, i64>("port")? as u16,
        bus_port: row.get::<_, i64>("bus_port")? as u16,
        version: row.get("version")?,
        reservables,
        last_heartbeat: from_epoch(row.get("last_heartbeat")?),
        shutting_down: row.get::<_, i64>("shutting_down")? != 0,
    })
}

/// Insert (or replace, on restart with the same name) a worker row at
/// startup.
pub fn add_worker(db: &Db, worker: &Worker) -> rusqlite::Result<()> {
    let conn = db.lock();
    let reservables_json = serde_json::to_string(&worker.reservables).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO worker (name, ip, port, bus_port, version, reservables, last_heartbeat, shutting_down)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
         ON CONFLICT(name) DO UPDATE SET
            ip=excluded.ip, port=excluded.port, bus_port=excluded.bus_port, version=excluded.version,
            reservables=excluded.reservables, last_heartbeat=excluded.last_heartbeat, shutting_down=0",
        params![worker.name, worker.ip, worker.port as i64, worker.bus_port as i64, worker.version, reservables_json, to_epoch(worker.last_heartbeat)],
    )?;
    Ok(())
}

pub fn heartbeat_worker(db: &Db, name: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
    let conn = db.lock();
    conn.execute("UPDATE worker SET last_heartbeat = ?1 WHERE name = ?2", params![to_epoch(now), name])?;
    Ok(())
}

/// Graceful exit: deletes the worker row and all of its devices (a device's
/// `worker` column must reference an existing row - spec.md §3 Invariant).
/// Any devices that were reserved are returned as `(serial, client_id)` pairs
/// so the caller can raise `failure` for their clients, mirroring
/// `handle_worker_timeouts` below so graceful and ungraceful departure share
/// one notification path.
pub fn shutdown_worker(db: &Db, name: &str) -> rusqlite::Result<Vec<(String, String)>> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let reserved: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT device.serial, reservation.client_id FROM device
             JOIN reservation ON reservation.serial = device.serial
             WHERE device.worker = ?1",
        )?;
        let rows = stmt.query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };
    tx.execute(
        "DELETE FROM reservation WHERE serial IN (SELECT serial FROM device WHERE worker = ?1)",
        params![name],
    )?;
    tx.execute("DELETE FROM device WHERE worker = ?1", params![name])?;
    tx.execute("DELETE FROM worker WHERE name = ?1", params![name])?;
    tx.commit()?;
    for (serial, client_id) in &reserved {
        db.notify.publish(Notification::WorkerLost { serial: serial.clone(), client_id: client_id.clone() });
    }
    Ok(reserved)
}

/// Periodic task (c): workers whose `last_heartbeat` is stale are treated as
/// lost. Returns the `(serial, client_id)` pairs that had an active
/// reservation, so the caller emits `failure` for each owner (spec.md §4.4,
/// §7 "Worker loss").
pub fn handle_worker_timeouts(db: &Db, now: DateTime<Utc>, worker_timeout: Duration) -> rusqlite::Result<Vec<(String, String)>> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let stale_workers: Vec<String> = {
        let mut stmt = tx.prepare("SELECT name FROM worker WHERE last_heartbeat < ?1")?;
        let cutoff = now - worker_timeout;
        let rows = stmt.query_map(params![to_epoch(cutoff)], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let mut lost_reserved = Vec::new();
    for name in &stale_workers {
        let reserved: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT device.serial, reservation.client_id FROM device
                 JOIN reservation ON reservation.serial = device.serial
                 WHERE device.worker = ?1",
            )?;
            let rows = stmt.query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        tx.execute(
            "DELETE FROM reservation WHERE serial IN (SELECT serial FROM device WHERE worker = ?1)",
            params![name],
        )?;
        tx.execute("DELETE FROM device WHERE worker = ?1", params![name])?;
        tx.execute("DELETE FROM worker WHERE name = ?1", params![name])?;
        lost_reserved.extend(reserved);
    }
    tx.commit()?;
    for (serial, client_id) in &lost_reserved {
        db.notify.publish(Notification::WorkerLost { serial: serial.clone(), client_id: client_id.clone() });
    }
    Ok(lost_reserved)
}

pub fn list_workers(db: &Db) -> rusqlite::Result<Vec<Worker>> {
    let conn = db.lock();
    let mut stmt = conn.prepare("SELECT * FROM worker ORDER BY name")?;
    let rows = stmt.query_map([], row_to_worker)?;
    rows.collect()
}

pub fn get_worker(db: &Db, name: &str) -> rusqlite::Result<Option<Worker>> {
    let conn = db.lock();
    conn.query_row("SELECT * FROM worker WHERE name = ?1", params![name], row_to_worker).optional()
}
