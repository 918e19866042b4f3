//! `FlashState` (spec.md §4.1): drives a board through bootloader mode and
//! installs an image, then hands off to `next_factory()`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{State, StateInput, Transition};
use crate::device::env::DeviceCtx;
use crate::device::firmware::FirmwareImage;
use crate::devicefile::{DeviceFile, DeviceFileEvent, DeviceFileKind};

/// Sent to the board's tty to request a reboot into the UF2 bootloader. The
/// exact byte sequence is board-firmware defined; this one matches the
/// pico-ice default application image's console command.
const ENTER_BOOTLOADER_LINE: &str = "icefarm:enter-bootloader";

type NextFactory = Box<dyn FnOnce(&DeviceCtx) -> Box<dyn State> + Send>;

pub struct FlashState {
    firmware: FirmwareImage,
    next_factory: Option<NextFactory>,
    timeout: Option<Duration>,
    known_files: Vec<DeviceFile>,
    cancel: Arc<AtomicBool>,
}

impl FlashState {
    pub fn new(
        firmware: FirmwareImage,
        next_factory: NextFactory,
        timeout: Option<Duration>,
        known_files: Vec<DeviceFile>,
    ) -> Self {
        FlashState { firmware, next_factory: Some(next_factory), timeout, known_files, cancel: Arc::new(AtomicBool::new(false)) }
    }

    fn handle_tty(&self, ctx: &DeviceCtx, path: &str) {
        match ctx.env.open_serial(path) {
            Ok(mut port) => {
                if let Err(err) = port.write_line(ENTER_BOOTLOADER_LINE) {
                    log::warn!(target: "icefarm_worker::device", "failed to request bootloader on {path}: {err}");
                }
            }
            Err(err) => log::warn!(target: "icefarm_worker::device", "could not open {path} to request bootloader: {err}"),
        }
    }

    /// `Ok(true)` on a completed flash, `Ok(false)` if the partition's file
    /// set didn't match the UF2 bootloader's known shape (spec.md: "wrong
    /// file set aborts the current attempt without switching").
    fn try_flash_partition(&self, ctx: &DeviceCtx, path: &str) -> std::io::Result<bool> {
        let expected: BTreeSet<String> = ["INDEX.HTM", "INFO_UF2.TXT"].into_iter().map(String::from).collect();

        let mount_point = ctx.env.bootloader_fs.mount(path)?;
        let files = ctx.env.bootloader_fs.list_files(&mount_point)?;
        if files != expected {
            let _ = ctx.env.bootloader_fs.unmount(&mount_point);
            return Ok(false);
        }

        ctx.env.bootloader_fs.copy_firmware(&mount_point, &self.firmware.bytes)?;
        if let Err(err) = ctx.env.bootloader_fs.unmount(&mount_point) {
            log::warn!(target: "icefarm_worker::device", "unmount of {path} failed (non-fatal): {err}");
        }
        Ok(true)
    }

    fn handle_file(&mut self, ctx: &DeviceCtx, file: &DeviceFile) -> Transition {
        match file.kind {
            DeviceFileKind::Tty => {
                self.handle_tty(ctx, &file.path);
                Transition::Stay
            }
            DeviceFileKind::Partition => match self.try_flash_partition(ctx, &file.path) {
                Ok(true) => {
                    self.cancel.store(true, Ordering::SeqCst);
                    let next = self.next_factory.take().expect("flash completes at most once");
                    Transition::Switch(next(ctx))
                }
                Ok(false) => {
                    log::warn!(
                        target: "icefarm_worker::device",
                        "partition {} on {} is not the expected bootloader image, ignoring",
                        file.path, ctx.serial
                    );
                    Transition::Stay
                }
                Err(err) => {
                    log::error!(target: "icefarm_worker::device", "flash of {} failed: {err}", ctx.serial);
                    Transition::Stay
                }
            },
        }
    }
}

impl State for FlashState {
    fn name(&self) -> &'static str {
        "flashing"
    }

    fn enter(&mut self, ctx: &DeviceCtx) {
        if let Some(timeout) = self.timeout {
            let cancel = self.cancel.clone();
            let handle = ctx.handle.clone();
            thread::spawn(move || {
                thread::sleep(timeout);
                if cancel.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(actor) = handle.upgrade() {
                    log::warn!(target: "icefarm_worker::device", "flash timeout on {}, marking broken", actor.serial);
                    actor.force_switch(Box::new(super::broken::BrokenState));
                }
            });
        }

        let known = std::mem::take(&mut self.known_files);
        for file in known {
            self.handle_file(ctx, &file);
        }
    }

    fn exit(&mut self, _ctx: &DeviceCtx) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn on_event(&mut self, ctx: &DeviceCtx, input: StateInput) -> Transition {
        match input {
            StateInput::File(DeviceFileEvent::Added { file, .. }) => self.handle_file(ctx, &file),
            StateInput::File(DeviceFileEvent::Removed { .. }) => Transition::Stay,
            StateInput::Request { .. } => Transition::Stay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::bootloader_fs::{BootloaderFs, MockBootloaderFs};
    use crate::device::env::DeviceEnv;
    use crate::device::firmware::FirmwareSet;
    use crate::usbip::MockUsbIpController;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    fn env_with_fs(fs: MockBootloaderFs) -> Arc<DeviceEnv> {
        use crate::serial::MockSerialPort;
        Arc::new(DeviceEnv::new(
            "w1".into(),
            icefarm_db::Db::open_in_memory().unwrap(),
            Arc::new(MockUsbIpController::new()),
            Arc::new(fs),
            Arc::new(FirmwareSet::new(FirmwareImage { kind: "default".into(), bytes: vec![9, 9] })),
            Duration::from_millis(50),
            Arc::new(|_event| {}),
            Arc::new(|_path| Ok(Box::new(MockSerialPort::new(vec![])) as Box<dyn crate::serial::SerialPort>)),
        ))
    }

    #[test]
    fn valid_partition_flashes_and_switches() {
        let fs = MockBootloaderFs::valid();
        let env = env_with_fs(fs);
        let ctx = DeviceCtx::for_test("s1".into(), env.clone());
        let switched = Arc::new(StdAtomicBool::new(false));
        let switched2 = switched.clone();

        let mut state = FlashState::new(
            FirmwareImage { kind: "pulsecount".into(), bytes: vec![1, 2, 3] },
            Box::new(move |_ctx| {
                switched2.store(true, Ordering::SeqCst);
                Box::new(super::super::ready::ReadyState::new())
            }),
            None,
            Vec::new(),
        );

        let file = DeviceFile { path: "/dev/part1".into(), kind: DeviceFileKind::Partition };
        let transition = state.handle_file(&ctx, &file);
        assert!(matches!(transition, Transition::Switch(_)));
        assert!(switched.load(Ordering::SeqCst));
    }

    #[test]
    fn wrong_file_set_does_not_switch() {
        let fs = MockBootloaderFs::with_extra_file();
        let env = env_with_fs(fs);
        let ctx = DeviceCtx::for_test("s1".into(), env);

        let mut state = FlashState::new(
            FirmwareImage { kind: "pulsecount".into(), bytes: vec![1] },
            Box::new(|_ctx| Box::new(super::super::ready::ReadyState::new())),
            None,
            Vec::new(),
        );

        let file = DeviceFile { path: "/dev/part1".into(), kind: DeviceFileKind::Partition };
        let transition = state.handle_file(&ctx, &file);
        assert!(matches!(transition, Transition::Stay));
    }

    #[test]
    fn unmount_failure_is_non_fatal() {
        let mut fs = MockBootloaderFs::valid();
        fs.fail_unmount = true;
        let env = env_with_fs(fs);
        let ctx = DeviceCtx::for_test("s1".into(), env);

        let mut state = FlashState::new(
            FirmwareImage { kind: "pulsecount".into(), bytes: vec![1] },
            Box::new(|_ctx| Box::new(super::super::ready::ReadyState::new())),
            None,
            Vec::new(),
        );

        let file = DeviceFile { path: "/dev/part1".into(), kind: DeviceFileKind::Partition };
        let transition = state.handle_file(&ctx, &file);
        assert!(matches!(transition, Transition::Switch(_)));
    }
}
