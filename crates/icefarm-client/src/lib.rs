//! iCEFARM client (spec.md §4.5 client half + §4.6): the base reservation
//! client, the control/worker event bus connections, the bundle batch
//! scheduler, and the pulse-count evaluation driver.

pub mod base_client;
pub mod bundle;
pub mod bus;
pub mod error;
pub mod pulsecount;
pub mod scheduler;

pub use base_client::{BaseClient, Connection, ReservationGuard};
pub use error::ClientError;
pub use pulsecount::PulseCountClient;
pub use scheduler::{BundleScheduler, ResultTriple, SchedulerPolicy};
