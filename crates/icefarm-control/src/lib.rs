//! iCEFARM control (spec.md §4.4-§4.5): the reservation engine, its
//! periodic tasks, the control event bus, and the HTTP front end clients
//! call into.

pub mod bus;
pub mod engine;
pub mod http_api;
pub mod worker_client;
