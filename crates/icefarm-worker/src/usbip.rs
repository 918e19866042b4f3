//! USB/IP export capability (spec.md §4.3): "a four-function interface...
//! The manager does not shell out itself - that is an adapter concern."

use std::collections::BTreeSet;
use std::process::Command;
use std::sync::Mutex;

pub trait UsbIpController: Send + Sync {
    fn bind(&self, busid: &str) -> std::io::Result<()>;
    fn unbind(&self, busid: &str) -> std::io::Result<()>;
    fn list_exported(&self) -> std::io::Result<BTreeSet<String>>;
}

/// Adopts the Open Question resolution of spec.md §9: "`getBus` /
/// `getDeviceExportedBus` disagree in return type ... adopt 'string bus-id
/// or null'." Implemented here as `Option<String>` rather than a bool/list.
pub fn busid_of(device_info: &crate::devicefile::DeviceFile) -> Option<String> {
    // The normalised device-file path carries the busid as its last
    // dash-free path segment once udev has been consumed (out of scope);
    // `None` if the file can't be associated with a USB topology id (e.g.
    // it belongs to a device already detached).
    device_info.path.rsplit('/').next().and_then(|seg| if seg.contains('-') { Some(seg.to_string()) } else { None })
}

/// Shells out to the real `usbip` binary. Never invoked from tests; the
/// command strings are built from busids handed to us by the manager, never
/// from unvalidated external input, so no shell interpolation risk applies
/// (`Command` execs argv directly, no shell).
pub struct CliUsbIpController {
    binary: String,
}

impl CliUsbIpController {
    pub fn new(binary: impl Into<String>) -> Self {
        CliUsbIpController { binary: binary.into() }
    }
}

impl UsbIpController for CliUsbIpController {
    fn bind(&self, busid: &str) -> std::io::Result<()> {
        let status = Command::new(&self.binary).args(["bind", "-b", busid]).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::Other, format!("usbip bind {busid} failed: {status}")))
        }
    }

    fn unbind(&self, busid: &str) -> std::io::Result<()> {
        let status = Command::new(&self.binary).args(["unbind", "-b", busid]).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::Other, format!("usbip unbind {busid} failed: {status}")))
        }
    }

    fn list_exported(&self) -> std::io::Result<BTreeSet<String>> {
        let output = Command::new(&self.binary).args(["list", "-p", "-l"]).output()?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .filter_map(|line| line.strip_prefix("busid="))
            .map(|rest| rest.split('#').next().unwrap_or(rest).trim().to_string())
            .collect())
    }
}

/// Deterministic in-memory double used throughout `icefarm-worker`'s tests.
#[derive(Default)]
pub struct MockUsbIpController {
    exported: Mutex<BTreeSet<String>>,
}

impl MockUsbIpController {
    pub fn new() -> Self {
        MockUsbIpController::default()
    }
}

impl UsbIpController for MockUsbIpController {
    fn bind(&self, busid: &str) -> std::io::Result<()> {
        self.exported.lock().unwrap().insert(busid.to_string());
        Ok(())
    }

    fn unbind(&self, busid: &str) -> std::io::Result<()> {
        self.exported.lock().unwrap().remove(busid);
        Ok(())
    }

    fn list_exported(&self) -> std::io::Result<BTreeSet<String>> {
        Ok(self.exported.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicefile::{DeviceFile, DeviceFileKind};

    #[test]
    fn busid_of_extracts_trailing_segment() {
        let file = DeviceFile { path: "/dev/bus/usb/1-2".into(), kind: DeviceFileKind::Tty };
        assert_eq!(busid_of(&file), Some("1-2".to_string()));
    }

    #[test]
    fn busid_of_is_none_without_a_dash() {
        let file = DeviceFile { path: "/dev/ttyACM0".into(), kind: DeviceFileKind::Tty };
        assert_eq!(busid_of(&file), None);
    }

    #[test]
    fn mock_controller_round_trips_bind_unbind() {
        let ctl = MockUsbIpController::new();
        ctl.bind("1-2").unwrap();
        assert!(ctl.list_exported().unwrap().contains("1-2"));
        ctl.unbind("1-2").unwrap();
        assert!(!ctl.list_exported().unwrap().contains("1-2"));
    }
}
