//! Persisted state for iCEFARM: the `worker`/`device`/`reservation` tables
//! of spec.md §3, exposed as the stored routines named in spec.md §6, plus
//! the `reservation_updates`/`device_available` notification channels.

pub mod notify;
pub mod pool;
pub mod queries;
pub mod schema;
pub mod time;

pub use notify::{NotifyBus, Notification};
pub use pool::Db;
pub use queries::*;
