//! `make_reservations`, `extend_reservations`, `extend_all_reservations`,
//! `end_reservations`, `end_all_reservations`, `handle_reservation_timeouts`,
//! `get_reservations_ending_soon`, `has_reservations` (spec.md §4.4, §6).
//!
//! Every mutation here runs inside a sqlite transaction, and sqlite itself
//! serialises writers, so "concurrent-reservation races are resolved inside
//! the database operation" (spec.md §4.4) holds without any extra locking in
//! the engine.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use icefarm_common::model::{Device, Reservation, Worker};
use rusqlite::{params, OptionalExtension};

use crate::notify::Notification;
use crate::pool::Db;
use crate::time::{from_epoch, to_epoch};

fn fetch_candidates(tx: &rusqlite::Transaction) -> rusqlite::Result<Vec<(Device, Worker)>> {
    let mut stmt = tx.prepare(
        "SELECT device.serial as d_serial, device.worker as d_worker, device.status as d_status, device.client_id as d_client,
                worker.name as w_name, worker.ip as w_ip, worker.port as w_port, worker.bus_port as w_bus_port, worker.version as w_version,
                worker.reservables as w_reservables, worker.last_heartbeat as w_heartbeat, worker.shutting_down as w_down
         FROM device JOIN worker ON worker.name = device.worker
         WHERE device.status = 'available' AND worker.shutting_down = 0
         ORDER BY device.serial",
    )?;
    let rows = stmt.query_map([], |row| {
        let device = Device {
            serial: row.get("d_serial")?,
            worker: row.get("d_worker")?,
            status: icefarm_common::model::DeviceStatus::from_str(&row.get::<_, String>("d_status")?)
                .unwrap_or(icefarm_common::model::DeviceStatus::Broken),
            client_id: row.get("d_client")?,
        };
        let reservables_json: String = row.get("w_reservables")?;
        let reservables: BTreeSet<String> = serde_json::from_str(&reservables_json).unwrap_or_default();
        let worker = Worker {
            name: row.get("w_name")?,
            ip: row.get("w_ip")?,
            port: row.get::<_, i64>("w_port")? as u16,
            bus_port: row.get::<_, i64>("w_bus_port")? as u16,
            version: row.get("w_version")?,
            reservables,
            last_heartbeat: from_epoch(row.get("w_heartbeat")?),
            shutting_down: row.get::<_, i64>("w_down")? != 0,
        };
        Ok((device, worker))
    })?;
    rows.collect()
}

fn reserve_selected(tx: &rusqlite::Transaction, selected: &[(Device, Worker)], client_id: &str, expires_at: DateTime<Utc>) -> rusqlite::Result<()> {
    for (device, _) in selected {
        tx.execute(
            "UPDATE device SET status = 'reserved', client_id = ?1 WHERE serial = ?2",
            params![client_id, device.serial],
        )?;
        tx.execute(
            "INSERT INTO reservation (serial, client_id, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(serial) DO UPDATE SET client_id = excluded.client_id, expires_at = excluded.expires_at",
            params![device.serial, client_id, to_epoch(expires_at)],
        )?;
    }
    Ok(())
}

/// Atomically selects up to `amount` devices whose status is `available`
/// and whose worker advertises `kind`, reserves them to `client_id`. An
/// `amount` of zero returns an empty list without side effects.
pub fn make_reservations(db: &Db, amount: usize, client_id: &str, kind: &str, now: DateTime<Utc>, lease: Duration) -> rusqlite::Result<Vec<(Device, Worker)>> {
    if amount == 0 {
        return Ok(Vec::new());
    }
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let selected: Vec<(Device, Worker)> =
        fetch_candidates(&tx)?.into_iter().filter(|(_, w)| w.reservables.contains(kind)).take(amount).collect();
    let expires_at = now + lease;
    reserve_selected(&tx, &selected, client_id, expires_at)?;
    tx.commit()?;
    for (device, _) in &selected {
        db.notify.publish(Notification::ReservationGranted { serial: device.serial.clone(), client_id: client_id.to_string() });
    }
    Ok(selected)
}

/// Reserves exactly the requested serials, skipping any that are not
/// currently `available` (the `reserveSpecific` control verb).
pub fn reserve_specific(db: &Db, serials: &[String], client_id: &str, now: DateTime<Utc>, lease: Duration) -> rusqlite::Result<Vec<(Device, Worker)>> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let wanted: BTreeSet<&str> = serials.iter().map(String::as_str).collect();
    let selected: Vec<(Device, Worker)> =
        fetch_candidates(&tx)?.into_iter().filter(|(d, _)| wanted.contains(d.serial.as_str())).collect();
    let expires_at = now + lease;
    reserve_selected(&tx, &selected, client_id, expires_at)?;
    tx.commit()?;
    for (device, _) in &selected {
        db.notify.publish(Notification::ReservationGranted { serial: device.serial.clone(), client_id: client_id.to_string() });
    }
    Ok(selected)
}

/// Refreshes expiry only for serials currently reserved to `client_id`.
/// Extending a reservation owned by a different client extends none.
pub fn extend_reservations(db: &Db, client_id: &str, serials: &[String], now: DateTime<Utc>, lease: Duration) -> rusqlite::Result<Vec<String>> {
    let conn = db.lock();
    let expires_at = now + lease;
    let mut extended = Vec::new();
    for serial in serials {
        let changed = conn.execute(
            "UPDATE reservation SET expires_at = ?1 WHERE serial = ?2 AND client_id = ?3",
            params![to_epoch(expires_at), serial, client_id],
        )?;
        if changed > 0 {
            extended.push(serial.clone());
        }
    }
    Ok(extended)
}

pub fn extend_all_reservations(db: &Db, client_id: &str, now: DateTime<Utc>, lease: Duration) -> rusqlite::Result<Vec<String>> {
    let conn = db.lock();
    let expires_at = now + lease;
    let mut stmt = conn.prepare("SELECT serial FROM reservation WHERE client_id = ?1")?;
    let serials: Vec<String> = stmt.query_map(params![client_id], |row| row.get(0))?.collect::<Result<_, _>>()?;
    drop(stmt);
    conn.execute("UPDATE reservation SET expires_at = ?1 WHERE client_id = ?2", params![to_epoch(expires_at), client_id])?;
    Ok(serials)
}

fn end_selected(tx: &rusqlite::Transaction, serials: &[String]) -> rusqlite::Result<()> {
    for serial in serials {
        tx.execute(
            "UPDATE device SET status = 'await_flash_default', client_id = NULL WHERE serial = ?1",
            params![serial],
        )?;
        tx.execute("DELETE FROM reservation WHERE serial = ?1", params![serial])?;
    }
    Ok(())
}

/// Idempotent: re-ending an already-ended reservation is a no-op and
/// contributes nothing to the returned set.
pub fn end_reservations(db: &Db, client_id: &str, serials: &[String]) -> rusqlite::Result<Vec<String>> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let owned: Vec<String> = {
        let mut stmt = tx.prepare("SELECT serial FROM reservation WHERE client_id = ?1 AND serial = ?2")?;
        let mut owned = Vec::new();
        for serial in serials {
            let found: Option<String> = stmt.query_row(params![client_id, serial], |row| row.get(0)).ok();
            if let Some(s) = found {
                owned.push(s);
            }
        }
        owned
    };
    end_selected(&tx, &owned)?;
    tx.commit()?;
    for serial in &owned {
        db.notify.publish(Notification::ReservationEnded { serial: serial.clone(), client_id: client_id.to_string() });
    }
    Ok(owned)
}

pub fn end_all_reservations(db: &Db, client_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let owned: Vec<String> = {
        let mut stmt = tx.prepare("SELECT serial FROM reservation WHERE client_id = ?1")?;
        let rows = stmt.query_map(params![client_id], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    end_selected(&tx, &owned)?;
    tx.commit()?;
    for serial in &owned {
        db.notify.publish(Notification::ReservationEnded { serial: serial.clone(), client_id: client_id.to_string() });
    }
    Ok(owned)
}

/// Periodic task (b): expire reservations past their deadline. Returns the
/// expired `(serial, client_id)` pairs so the caller can raise `reservation
/// end` for the prior owner (spec.md §4.4, §7).
pub fn handle_reservation_timeouts(db: &Db, now: DateTime<Utc>) -> rusqlite::Result<Vec<(String, String)>> {
    let mut conn = db.lock();
    let tx = conn.transaction()?;
    let expired: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT serial, client_id FROM reservation WHERE expires_at <= ?1")?;
        let rows = stmt.query_map(params![to_epoch(now)], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };
    let serials: Vec<String> = expired.iter().map(|(s, _)| s.clone()).collect();
    end_selected(&tx, &serials)?;
    tx.commit()?;
    for (serial, client_id) in &expired {
        db.notify.publish(Notification::ReservationExpired { serial: serial.clone(), client_id: client_id.clone() });
    }
    Ok(expired)
}

/// Periodic task (a): reservations expiring within `warning_window`.
pub fn get_reservations_ending_soon(db: &Db, now: DateTime<Utc>, warning_window: Duration) -> rusqlite::Result<Vec<Reservation>> {
    let conn = db.lock();
    let mut stmt = conn.prepare("SELECT serial, client_id, expires_at FROM reservation")?;
    let rows = stmt.query_map([], |row| {
        let expires_at: i64 = row.get(2)?;
        Ok(Reservation { serial: row.get(0)?, client_id: row.get(1)?, expires_at: from_epoch(expires_at) })
    })?;
    let all: Vec<Reservation> = rows.collect::<Result<_, _>>()?;
    Ok(all.into_iter().filter(|r| r.ending_soon(now, warning_window)).collect())
}

/// Supplemented: backs the admin `delete` verb (spec.md §4.4), which must
/// end whatever reservation exists on a serial regardless of who owns it
/// before the device row itself is removed.
pub fn get_reservation_owner(db: &Db, serial: &str) -> rusqlite::Result<Option<String>> {
    let conn = db.lock();
    conn.query_row("SELECT client_id FROM reservation WHERE serial = ?1", params![serial], |row| row.get(0)).optional()
}

pub fn has_reservations(db: &Db, client_id: &str) -> rusqlite::Result<bool> {
    let conn = db.lock();
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM reservation WHERE client_id = ?1", params![client_id], |row| row.get(0))?;
    Ok(count > 0)
}

/// Supplemented: used by the client event bus to decide when a worker
/// socket can be torn down (spec.md §4.5 "torn down when the client no
/// longer holds any reservation on that worker").
pub fn has_reservations_on_worker(db: &Db, client_id: &str, worker: &str) -> rusqlite::Result<bool> {
    let conn = db.lock();
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM reservation
         JOIN device ON device.serial = reservation.serial
         WHERE reservation.client_id = ?1 AND device.worker = ?2",
        params![client_id, worker],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use icefarm_common::model::DeviceStatus;

    fn seed_worker(db: &Db, name: &str, kind: &str) {
        let mut reservables = BTreeSet::new();
        reservables.insert(kind.to_string());
        crate::queries::add_worker(
            db,
            &Worker { name: name.into(), ip: "127.0.0.1".into(), port: 9000, bus_port: 9001, version: "1".into(), reservables, last_heartbeat: Utc::now(), shutting_down: false },
        )
        .unwrap();
    }

    #[test]
    fn make_reservations_is_atomic_and_respects_kind() {
        let db = Db::open_in_memory().unwrap();
        seed_worker(&db, "w1", "pulsecount");
        crate::queries::add_device(&db, "s1", "w1").unwrap();
        crate::queries::add_device(&db, "s2", "w1").unwrap();
        crate::queries::update_device_status(&db, "s1", DeviceStatus::Available).unwrap();
        crate::queries::update_device_status(&db, "s2", DeviceStatus::Available).unwrap();

        let now = Utc::now();
        let reserved = make_reservations(&db, 1, "client-a", "pulsecount", now, Duration::seconds(60)).unwrap();
        assert_eq!(reserved.len(), 1);

        // zero amount is a true no-op
        assert!(make_reservations(&db, 0, "client-a", "pulsecount", now, Duration::seconds(60)).unwrap().is_empty());
    }

    #[test]
    fn extend_only_affects_owning_client() {
        let db = Db::open_in_memory().unwrap();
        seed_worker(&db, "w1", "pulsecount");
        crate::queries::add_device(&db, "s1", "w1").unwrap();
        crate::queries::update_device_status(&db, "s1", DeviceStatus::Available).unwrap();
        let now = Utc::now();
        make_reservations(&db, 1, "owner", "pulsecount", now, Duration::seconds(60)).unwrap();

        let extended = extend_reservations(&db, "not-owner", &["s1".to_string()], now, Duration::seconds(60)).unwrap();
        assert!(extended.is_empty());

        let extended = extend_reservations(&db, "owner", &["s1".to_string()], now, Duration::seconds(60)).unwrap();
        assert_eq!(extended, vec!["s1".to_string()]);
    }

    #[test]
    fn ending_twice_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        seed_worker(&db, "w1", "pulsecount");
        crate::queries::add_device(&db, "s1", "w1").unwrap();
        crate::queries::update_device_status(&db, "s1", DeviceStatus::Available).unwrap();
        let now = Utc::now();
        make_reservations(&db, 1, "owner", "pulsecount", now, Duration::seconds(60)).unwrap();

        let first = end_reservations(&db, "owner", &["s1".to_string()]).unwrap();
        assert_eq!(first, vec!["s1".to_string()]);
        let second = end_reservations(&db, "owner", &["s1".to_string()]).unwrap();
        assert!(second.is_empty());
    }
}
