//! Shared data model, event envelope and error types for the iCEFARM fleet
//! manager. Every other crate in the workspace (`icefarm-db`,
//! `icefarm-worker`, `icefarm-control`, `icefarm-client`) depends on this one
//! so that wire and storage representations agree without duplicating types.

pub mod config;
pub mod error;
pub mod event;
pub mod model;

pub use config::{BatchConfig, LeaseConfig};
pub use error::CommonError;
pub use event::{Event, EventKind};
pub use model::{Batch, Bundle, Device, DeviceStatus, Evaluation, Reservation, Worker};
