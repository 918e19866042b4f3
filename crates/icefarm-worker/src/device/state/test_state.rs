//! `TestState` (spec.md §4.1): "entry: mark device `testing`. On the first
//! add-event carrying a device-file, run a 'default firmware' validity
//! check; switch to Ready on success or Broken on failure. Idempotency is
//! ensured by a local exit-once latch so spurious subsequent events cannot
//! double-switch."

use std::time::Duration;

use icefarm_common::model::DeviceStatus;
use icefarm_db::queries::device::update_device_status;

use super::broken::BrokenState;
use super::ready::ReadyState;
use super::{State, StateInput, Transition};
use crate::device::env::DeviceCtx;
use crate::devicefile::{DeviceFileEvent, DeviceFileKind};

const CHECK_TIMEOUT: Duration = Duration::from_millis(500);

pub struct TestState {
    checked: bool,
}

impl TestState {
    pub fn new() -> Self {
        TestState { checked: false }
    }
}

impl Default for TestState {
    fn default() -> Self {
        Self::new()
    }
}

impl State for TestState {
    fn name(&self) -> &'static str {
        "testing"
    }

    fn enter(&mut self, ctx: &DeviceCtx) {
        if let Err(err) = update_device_status(&ctx.env.db, &ctx.serial, DeviceStatus::Testing) {
            log::error!(target: "icefarm_worker::device", "failed to mark {} testing: {err}", ctx.serial);
        }
    }

    fn on_event(&mut self, ctx: &DeviceCtx, input: StateInput) -> Transition {
        if self.checked {
            return Transition::Stay;
        }
        let StateInput::File(DeviceFileEvent::Added { file, .. }) = input else {
            return Transition::Stay;
        };
        if file.kind != DeviceFileKind::Tty {
            return Transition::Stay;
        }

        self.checked = true;
        if default_firmware_responds(ctx, &file.path) {
            Transition::Switch(Box::new(ReadyState::new()))
        } else {
            log::warn!(target: "icefarm_worker::device", "default firmware check failed on {}", ctx.serial);
            Transition::Switch(Box::new(BrokenState))
        }
    }
}

/// The source protocol's default-firmware handshake is not part of the
/// distilled spec beyond "run a validity check"; this opens the tty and
/// treats any line received within `CHECK_TIMEOUT` as the board being alive
/// and running known-good firmware.
fn default_firmware_responds(ctx: &DeviceCtx, path: &str) -> bool {
    match ctx.env.open_serial(path) {
        Ok(mut port) => matches!(port.read_line(CHECK_TIMEOUT), Ok(Some(_))),
        Err(err) => {
            log::error!(target: "icefarm_worker::device", "could not open {path} for {}: {err}", ctx.serial);
            false
        }
    }
}
