//! Connection handle. Sqlite serialises writers at the OS/library level
//! already; wrapping the single connection in a `Mutex` gives us the same
//! "guarded only across lookup/insert, never across I/O" discipline spec.md
//! §5 asks of the `worker_sockets`/`devs` maps, applied to the database.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::notify::NotifyBus;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    pub notify: Arc<NotifyBus>,
}

impl Db {
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        crate::schema::create_schema(&conn)?;
        Ok(Db { conn: Arc::new(Mutex::new(conn)), notify: Arc::new(NotifyBus::new()) })
    }

    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        crate::schema::create_schema(&conn)?;
        Ok(Db { conn: Arc::new(Mutex::new(conn)), notify: Arc::new(NotifyBus::new()) })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database connection mutex poisoned")
    }
}
