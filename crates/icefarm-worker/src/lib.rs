//! iCEFARM worker (spec.md §4.1-§4.3): per-board state machine, pulse-count
//! reservable, device manager (hot-plug routing + USB/IP export), worker
//! event bus, and the small HTTP front end control calls into.

pub mod bus;
pub mod control_client;
pub mod device;
pub mod devicefile;
pub mod heartbeat;
pub mod hotplug;
pub mod http_api;
pub mod log_forward;
pub mod serial;
pub mod usbip;
