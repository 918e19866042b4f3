pub mod device;
pub mod reservation;
pub mod worker;

pub use device::*;
pub use reservation::*;
pub use worker::*;
