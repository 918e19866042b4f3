//! Shared services a device's state machine asks for by id rather than
//! dereferencing a raw back-pointer (spec.md Design Notes §9, "Cyclic
//! references between Device, DeviceManager, and State").

use std::sync::{Arc, Weak};
use std::time::Duration;

use icefarm_common::Event;
use icefarm_db::Db;

use super::actor::DeviceActor;
use super::bootloader_fs::BootloaderFs;
use super::firmware::FirmwareSet;
use crate::serial::SerialPort;
use crate::usbip::UsbIpController;

/// Services shared by every device on one worker. Held behind an `Arc` and
/// cloned into each `DeviceCtx`; nothing here is per-device.
pub struct DeviceEnv {
    pub worker_name: String,
    pub db: Db,
    pub usbip: Arc<dyn UsbIpController>,
    pub bootloader_fs: Arc<dyn BootloaderFs>,
    pub firmware: Arc<FirmwareSet>,
    pub flash_timeout: Duration,
    /// Pushes an event toward the owning client over the worker event bus.
    /// A plain closure rather than a trait object with more methods, since
    /// "emit an event addressed to this serial's client" is the only thing
    /// state code ever needs from the bus.
    publish: Arc<dyn Fn(Event) + Send + Sync>,
    open_serial: Arc<dyn Fn(&str) -> std::io::Result<Box<dyn SerialPort>> + Send + Sync>,
}

impl DeviceEnv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_name: String,
        db: Db,
        usbip: Arc<dyn UsbIpController>,
        bootloader_fs: Arc<dyn BootloaderFs>,
        firmware: Arc<FirmwareSet>,
        flash_timeout: Duration,
        publish: Arc<dyn Fn(Event) + Send + Sync>,
        open_serial: Arc<dyn Fn(&str) -> std::io::Result<Box<dyn SerialPort>> + Send + Sync>,
    ) -> Self {
        DeviceEnv { worker_name, db, usbip, bootloader_fs, firmware, flash_timeout, publish, open_serial }
    }

    pub fn publish(&self, event: Event) {
        (self.publish)(event);
    }

    pub fn open_serial(&self, path: &str) -> std::io::Result<Box<dyn SerialPort>> {
        (self.open_serial)(path)
    }

    #[cfg(test)]
    pub fn for_test(usbip: Arc<dyn UsbIpController>) -> Self {
        use crate::device::bootloader_fs::MockBootloaderFs;
        use crate::serial::MockSerialPort;

        DeviceEnv::new(
            "test-worker".into(),
            Db::open_in_memory().expect("in-memory db"),
            usbip,
            Arc::new(MockBootloaderFs::valid()),
            Arc::new(FirmwareSet::new(FirmwareImageForTest::default_image())),
            Duration::from_secs(5),
            Arc::new(|_event| {}),
            Arc::new(|_path| Ok(Box::new(MockSerialPort::new(vec![])) as Box<dyn SerialPort>)),
        )
    }
}

#[cfg(test)]
struct FirmwareImageForTest;

#[cfg(test)]
impl FirmwareImageForTest {
    fn default_image() -> super::firmware::FirmwareImage {
        super::firmware::FirmwareImage { kind: "default".into(), bytes: vec![0u8; 4] }
    }
}

/// Per-call handle a state's `enter`/`exit`/`on_event` receives: the device's
/// identity, the shared `DeviceEnv`, and a non-owning handle back to the
/// `DeviceActor` so a spawned timer thread can request a transition later
/// without the state holding a strong reference (which would leak the actor
/// as long as the state lives).
#[derive(Clone)]
pub struct DeviceCtx {
    pub serial: String,
    pub env: Arc<DeviceEnv>,
    pub handle: Weak<DeviceActor>,
}

impl DeviceCtx {
    pub fn new(serial: String, env: Arc<DeviceEnv>, handle: Weak<DeviceActor>) -> Self {
        DeviceCtx { serial, env, handle }
    }

    #[cfg(test)]
    pub fn for_test(serial: String, env: Arc<DeviceEnv>) -> Self {
        DeviceCtx { serial, env, handle: Weak::new() }
    }
}
