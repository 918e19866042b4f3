//! `add_device`, `update_device_status`, `delete_device`, and the
//! diagnostics query backing `/available`.

use icefarm_common::model::{Device, DeviceStatus};
use rusqlite::{params, OptionalExtension};

use crate::notify::Notification;
use crate::pool::Db;

fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
    let status_str: String = row.get("status")?;
    let status = DeviceStatus::from_str(&status_str).unwrap_or(DeviceStatus::Broken);
    Ok(Device { serial: row.get("serial")?, worker: row.get("worker")?, status, client_id: row.get("client_id")? })
}

/// Created on first hot-plug on a worker (spec.md §3). Idempotent: a device
/// that already exists on the same worker is left untouched (a replay of
/// the initial hot-plug scan must not clobber live reservation state).
pub fn add_device(db: &Db, serial: &str, worker: &str) -> rusqlite::Result<()> {
    let conn = db.lock();
    conn.execute(
        "INSERT INTO device (serial, worker, status, client_id)
         VALUES (?1, ?2, ?3, NULL)
         ON CONFLICT(serial) DO NOTHING",
        params![serial, worker, DeviceStatus::FlashingDefault.as_str()],
    )?;
    Ok(())
}

/// Mutated exclusively by the owning worker. Does not touch `client_id` -
/// reservation columns are control's half of the row. A transition into
/// `available` publishes `device_available(amount)` (spec.md §6) with the
/// fleet-wide available count, broadcast to every connected client.
pub fn update_device_status(db: &Db, serial: &str, status: DeviceStatus) -> rusqlite::Result<()> {
    let became_available = {
        let conn = db.lock();
        conn.execute("UPDATE device SET status = ?1 WHERE serial = ?2", params![status.as_str(), serial])?;
        status == DeviceStatus::Available
    };
    if became_available {
        let amount = available_count(db)?;
        db.notify.publish(Notification::DeviceAvailable { amount });
    }
    Ok(())
}

pub fn delete_device(db: &Db, serial: &str) -> rusqlite::Result<()> {
    let conn = db.lock();
    conn.execute("DELETE FROM reservation WHERE serial = ?1", params![serial])?;
    conn.execute("DELETE FROM device WHERE serial = ?1", params![serial])?;
    Ok(())
}

pub fn get_device(db: &Db, serial: &str) -> rusqlite::Result<Option<Device>> {
    let conn = db.lock();
    conn.query_row("SELECT * FROM device WHERE serial = ?1", params![serial], row_to_device).optional()
}

pub fn list_devices_for_worker(db: &Db, worker: &str) -> rusqlite::Result<Vec<Device>> {
    let conn = db.lock();
    let mut stmt = conn.prepare("SELECT * FROM device WHERE worker = ?1 ORDER BY serial")?;
    let rows = stmt.query_map(params![worker], row_to_device)?;
    rows.collect()
}

/// Backs `GET /available`: count of devices currently `available`.
pub fn available_count(db: &Db) -> rusqlite::Result<u32> {
    let conn = db.lock();
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM device WHERE status = ?1",
        params![DeviceStatus::Available.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notification;
    use chrono::Utc;
    use icefarm_common::model::Worker;
    use std::collections::BTreeSet;

    fn seed_worker(db: &Db) {
        crate::queries::add_worker(
            db,
            &Worker {
                name: "w1".into(),
                ip: "127.0.0.1".into(),
                port: 9000,
                bus_port: 9001,
                version: "1".into(),
                reservables: BTreeSet::new(),
                last_heartbeat: Utc::now(),
                shutting_down: false,
            },
        )
        .unwrap();
    }

    #[test]
    fn becoming_available_publishes_device_available_with_fleet_count() {
        let db = Db::open_in_memory().unwrap();
        seed_worker(&db);
        add_device(&db, "s1", "w1").unwrap();
        add_device(&db, "s2", "w1").unwrap();
        let rx = db.notify.subscribe();

        update_device_status(&db, "s1", DeviceStatus::Available).unwrap();
        assert_eq!(rx.recv().unwrap(), Notification::DeviceAvailable { amount: 1 });

        update_device_status(&db, "s2", DeviceStatus::Available).unwrap();
        assert_eq!(rx.recv().unwrap(), Notification::DeviceAvailable { amount: 2 });
    }

    #[test]
    fn non_available_transitions_publish_nothing() {
        let db = Db::open_in_memory().unwrap();
        seed_worker(&db);
        add_device(&db, "s1", "w1").unwrap();
        let rx = db.notify.subscribe();

        update_device_status(&db, "s1", DeviceStatus::Testing).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
