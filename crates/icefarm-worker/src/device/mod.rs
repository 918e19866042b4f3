//! One board's runtime: the actor/switch-latch, its shared environment, the
//! state machine (spec.md §4.1/§4.2), and the manager that routes hot-plug
//! events and USB/IP export across every board on this worker (spec.md §4.3).

pub mod actor;
pub mod bootloader_fs;
pub mod env;
pub mod firmware;
pub mod manager;
pub mod registry;
pub mod state;

pub use actor::DeviceActor;
pub use env::DeviceEnv;
pub use manager::DeviceManager;
