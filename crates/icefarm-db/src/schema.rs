//! Schema for the three tables of spec.md §3. Treated abstractly by the
//! spec ("the relational schema (treated abstractly in §3)") - this module
//! is the one concrete choice the expansion makes, picking `sqlite` so the
//! whole fleet manager can run without an external database process.

use rusqlite::Connection;

pub const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS worker (
    name            TEXT PRIMARY KEY,
    ip              TEXT NOT NULL,
    port            INTEGER NOT NULL,
    bus_port        INTEGER NOT NULL,
    version         TEXT NOT NULL,
    reservables     TEXT NOT NULL, -- JSON array of strings
    last_heartbeat  INTEGER NOT NULL, -- unix seconds, UTC
    shutting_down   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS device (
    serial      TEXT PRIMARY KEY,
    worker      TEXT NOT NULL REFERENCES worker(name),
    status      TEXT NOT NULL,
    client_id   TEXT
);

CREATE TABLE IF NOT EXISTS reservation (
    serial      TEXT PRIMARY KEY REFERENCES device(serial),
    client_id   TEXT NOT NULL,
    expires_at  INTEGER NOT NULL -- unix seconds, UTC
);

CREATE INDEX IF NOT EXISTS idx_device_worker ON device(worker);
CREATE INDEX IF NOT EXISTS idx_device_status ON device(status);
CREATE INDEX IF NOT EXISTS idx_reservation_client ON reservation(client_id);
"#;

pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_SCHEMA)
}
