//! `DeviceManager` (spec.md §4.3): hot-plug routing, USB/IP export, kernel
//! disconnect detection, initial cold-boot scan. "The manager does not shell
//! out itself - that is an adapter concern" - all USB/IP verbs go through
//! the `UsbIpController` trait, mounting/flashing through `BootloaderFs`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use icefarm_db::queries::device::add_device;

use super::actor::DeviceActor;
use super::env::DeviceEnv;
use super::state::flash::FlashState;
use super::state::test_state::TestState;
use super::state::{State, StateInput};
use crate::devicefile::{DeviceFile, DeviceFileEvent};
use crate::hotplug::{HotplugSource, KernelEventSource, KernelUsbRemove};

/// Everything the manager needs to know about one board beyond its actor:
/// the most recently observed bus id (used to bind/unbind USB/IP export) and
/// whether that bus id is currently bound.
#[derive(Default, Clone)]
struct Tracking {
    last_busid: Option<String>,
    exported: bool,
}

pub struct DeviceManager {
    worker_name: String,
    env: Arc<DeviceEnv>,
    allow_list: BTreeSet<String>,
    devices: Mutex<HashMap<String, Arc<DeviceActor>>>,
    tracking: Mutex<HashMap<String, Tracking>>,
}

impl DeviceManager {
    pub fn new(worker_name: impl Into<String>, env: Arc<DeviceEnv>, allow_list: BTreeSet<String>) -> Self {
        DeviceManager {
            worker_name: worker_name.into(),
            env,
            allow_list,
            devices: Mutex::new(HashMap::new()),
            tracking: Mutex::new(HashMap::new()),
        }
    }

    /// "On startup the manager performs an initial scan by enumerating
    /// existing devices and replaying them as synthesised add-events -
    /// hot-plug and cold-boot share one path" (spec.md §4.3).
    pub fn initial_scan(&self, existing: Vec<DeviceFileEvent>) {
        for event in existing {
            self.handle_user_event(event);
        }
    }

    pub fn devices(&self) -> Vec<String> {
        self.devices.lock().expect("device map poisoned").keys().cloned().collect()
    }

    fn actor_for(&self, serial: &str) -> Option<Arc<DeviceActor>> {
        self.devices.lock().expect("device map poisoned").get(serial).cloned()
    }

    /// Creates the `Device` row and a fresh actor the first time a serial is
    /// sighted. A freshly discovered board is treated exactly like one just
    /// unreserved: flash the default image, run the validity check, then sit
    /// `Ready` (spec.md §4.1 "On unreserve ... Flash(default) -> Test ->
    /// Ready"). `known` seeds the entry flash with whatever device-files
    /// arrived in the same sighting (spec.md: "entry: list currently known
    /// device-files for this serial and replay them as add-events").
    fn create_device(&self, serial: &str, known: Vec<DeviceFile>) -> Arc<DeviceActor> {
        if let Err(err) = add_device(&self.env.db, serial, &self.worker_name) {
            log::error!(target: "icefarm_worker::manager", "failed to insert device row for {serial}: {err}");
        }
        let initial = FlashState::new(
            self.env.firmware.default_image().clone(),
            Box::new(|_ctx| Box::new(TestState::new()) as Box<dyn State>),
            Some(self.env.flash_timeout),
            known,
        );
        let actor = DeviceActor::new(serial.to_string(), self.env.clone(), Box::new(initial));
        self.devices.lock().expect("device map poisoned").insert(serial.to_string(), actor.clone());
        actor
    }

    fn note_busid(&self, serial: &str, busid: Option<&str>) {
        if let Some(busid) = busid {
            let mut tracking = self.tracking.lock().expect("tracking poisoned");
            tracking.entry(serial.to_string()).or_default().last_busid = Some(busid.to_string());
        }
    }

    /// Routes one normalised user-subsystem event (spec.md §4.3 "User
    /// events"). Unrecognised hardware on a serial not yet known is dropped
    /// without creating a device row.
    pub fn handle_user_event(&self, event: DeviceFileEvent) {
        match &event {
            DeviceFileEvent::Added { serial, file, busid, model_id } => {
                let known_actor = self.actor_for(serial);
                if let Some(actor) = known_actor {
                    self.note_busid(serial, busid.as_deref());
                    actor.dispatch_file_event(event.clone());
                    return;
                }

                match model_id {
                    Some(model_id) if self.allow_list.contains(model_id) => {}
                    Some(model_id) => {
                        log::debug!(
                            target: "icefarm_worker::manager",
                            "ignoring {serial}: model {model_id} is not in the supported allow-list"
                        );
                        return;
                    }
                    None => {
                        log::debug!(
                            target: "icefarm_worker::manager",
                            "ignoring unrecognised new serial {serial}: no model id on sighting"
                        );
                        return;
                    }
                }

                self.note_busid(serial, busid.as_deref());
                self.create_device(serial, vec![file.clone()]);
            }
            DeviceFileEvent::Removed { serial, .. } => {
                if let Some(actor) = self.actor_for(serial) {
                    actor.dispatch_file_event(event.clone());
                }
            }
        }
    }

    /// Kernel-event half of spec.md §4.3: "when a USB remove arrives for a
    /// bus id currently marked as exported via USB/IP but that bus is no
    /// longer in the exported-bus list, treat the client as having detached
    /// and clear `exported_busid` on the owning device."
    pub fn handle_kernel_remove(&self, event: KernelUsbRemove) {
        let currently_exported = match self.env.usbip.list_exported() {
            Ok(set) => set,
            Err(err) => {
                log::warn!(target: "icefarm_worker::manager", "could not list usbip exports: {err}");
                return;
            }
        };
        if currently_exported.contains(&event.busid) {
            return;
        }
        let mut tracking = self.tracking.lock().expect("tracking poisoned");
        for (serial, state) in tracking.iter_mut() {
            if state.exported && state.last_busid.as_deref() == Some(event.busid.as_str()) {
                log::info!(target: "icefarm_worker::manager", "usbip client for {serial} detached ({})", event.busid);
                state.exported = false;
            }
        }
    }

    /// Binds the device's last-known bus id for USB/IP export. A no-op if
    /// already exported, or if no bus id has been observed yet for this
    /// serial (spec.md §5 "re-binding requires prior unbind" - we never bind
    /// twice without an intervening unbind).
    pub fn export(&self, serial: &str) {
        let busid = {
            let mut tracking = self.tracking.lock().expect("tracking poisoned");
            let entry = tracking.entry(serial.to_string()).or_default();
            if entry.exported {
                return;
            }
            entry.last_busid.clone()
        };
        let Some(busid) = busid else {
            log::warn!(target: "icefarm_worker::manager", "no known bus id for {serial}, cannot export");
            return;
        };
        match self.env.usbip.bind(&busid) {
            Ok(()) => {
                self.tracking.lock().expect("tracking poisoned").entry(serial.to_string()).or_default().exported = true;
            }
            Err(err) => log::error!(target: "icefarm_worker::manager", "usbip bind {busid} for {serial} failed: {err}"),
        }
    }

    pub fn unexport(&self, serial: &str) {
        let busid = {
            let mut tracking = self.tracking.lock().expect("tracking poisoned");
            let Some(entry) = tracking.get_mut(serial) else { return };
            if !entry.exported {
                return;
            }
            entry.exported = false;
            entry.last_busid.clone()
        };
        if let Some(busid) = busid {
            if let Err(err) = self.env.usbip.unbind(&busid) {
                log::warn!(target: "icefarm_worker::manager", "usbip unbind {busid} for {serial} failed: {err}");
            }
        }
    }

    /// Dispatches the control-originated `reserve(serial, kind, args)` HTTP
    /// call into the device's state machine, exporting its bus first (spec.md
    /// §4.4 "the engine dispatches an HTTP reserve(serial, kind, args) to the
    /// owning worker"). `args` is opaque client-supplied configuration passed
    /// straight through to the reservable state's handler.
    pub fn handle_reserve(&self, serial: &str, kind: &str, args: HashMap<String, serde_json::Value>) -> bool {
        let Some(actor) = self.actor_for(serial) else {
            log::warn!(target: "icefarm_worker::manager", "reserve for unknown serial {serial}");
            return false;
        };
        self.export(serial);
        let mut contents = args;
        contents.insert("kind".to_string(), serde_json::Value::String(kind.to_string()));
        actor.dispatch_request("reserve", contents);
        true
    }

    pub fn handle_unreserve(&self, serial: &str) -> bool {
        let Some(actor) = self.actor_for(serial) else {
            log::warn!(target: "icefarm_worker::manager", "unreserve for unknown serial {serial}");
            return false;
        };
        actor.dispatch_request("unreserve", HashMap::new());
        self.unexport(serial);
        true
    }

    /// Routes a `request(serial, event, contents)` client event (spec.md §6)
    /// into the owning device's state handler registry.
    pub fn handle_client_request(&self, serial: &str, event_kind: &str, contents: HashMap<String, serde_json::Value>) {
        let Some(actor) = self.actor_for(serial) else {
            log::debug!(target: "icefarm_worker::manager", "request {event_kind} for unknown serial {serial}, dropping");
            return;
        };
        actor.dispatch_request(event_kind, contents);
    }

    /// Runs the hot-plug consumer loop until the source is exhausted
    /// (shutdown). Intended to run on its own thread.
    pub fn run_hotplug(&self, source: &dyn HotplugSource) {
        while let Some(event) = source.next_event() {
            self.handle_user_event(event);
        }
    }

    /// Runs the kernel-event consumer loop until the source is exhausted.
    pub fn run_kernel_events(&self, source: &dyn KernelEventSource) {
        while let Some(event) = source.next_event() {
            self.handle_kernel_remove(event);
        }
    }

    /// Graceful shutdown: "unbinds every exported bus" (spec.md §4.3).
    pub fn shutdown(&self) {
        let serials: Vec<String> = {
            let tracking = self.tracking.lock().expect("tracking poisoned");
            tracking.iter().filter(|(_, t)| t.exported).map(|(s, _)| s.clone()).collect()
        };
        for serial in serials {
            self.unexport(&serial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicefile::DeviceFileKind;
    use crate::usbip::MockUsbIpController;
    use std::sync::Arc as StdArc;

    fn manager_with_allow_list(allow: &[&str]) -> DeviceManager {
        let usbip = StdArc::new(MockUsbIpController::new());
        let env = StdArc::new(DeviceEnv::for_test(usbip));
        DeviceManager::new("w1", env, allow.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn new_device_on_allow_listed_model_creates_actor() {
        let manager = manager_with_allow_list(&["1209:3613"]);
        manager.handle_user_event(DeviceFileEvent::Added {
            serial: "s1".into(),
            file: DeviceFile { path: "/dev/ttyACM0".into(), kind: DeviceFileKind::Tty },
            busid: Some("1-2".into()),
            model_id: Some("1209:3613".into()),
        });
        assert_eq!(manager.devices(), vec!["s1".to_string()]);
    }

    #[test]
    fn handle_reserve_merges_args_into_dispatched_contents() {
        let manager = manager_with_allow_list(&["1209:3613"]);
        manager.handle_user_event(DeviceFileEvent::Added {
            serial: "s1".into(),
            file: DeviceFile { path: "/dev/ttyACM0".into(), kind: DeviceFileKind::Tty },
            busid: Some("1-2".into()),
            model_id: Some("1209:3613".into()),
        });
        let mut args = HashMap::new();
        args.insert("flush_threshold".to_string(), serde_json::json!(8));
        assert!(manager.handle_reserve("s1", "pulsecount", args));
        assert!(manager.env.usbip.list_exported().unwrap().contains("1-2"));
    }

    #[test]
    fn unrecognised_model_is_ignored() {
        let manager = manager_with_allow_list(&["1209:3613"]);
        manager.handle_user_event(DeviceFileEvent::Added {
            serial: "s1".into(),
            file: DeviceFile { path: "/dev/ttyACM0".into(), kind: DeviceFileKind::Tty },
            busid: Some("1-2".into()),
            model_id: Some("dead:beef".into()),
        });
        assert!(manager.devices().is_empty());
    }

    #[test]
    fn kernel_remove_clears_export_when_busid_no_longer_listed() {
        let manager = manager_with_allow_list(&["1209:3613"]);
        manager.handle_user_event(DeviceFileEvent::Added {
            serial: "s1".into(),
            file: DeviceFile { path: "/dev/ttyACM0".into(), kind: DeviceFileKind::Tty },
            busid: Some("1-2".into()),
            model_id: Some("1209:3613".into()),
        });
        manager.export("s1");
        assert!(manager.env.usbip.list_exported().unwrap().contains("1-2"));

        // the usbip client unbinds itself out from under the manager: the
        // next kernel remove for that busid must be noticed even though the
        // manager never called unbind.
        manager.env.usbip.unbind("1-2").unwrap();
        manager.handle_kernel_remove(KernelUsbRemove { busid: "1-2".into() });

        let tracking = manager.tracking.lock().unwrap();
        assert!(!tracking.get("s1").unwrap().exported);
    }

    #[test]
    fn export_requires_unbind_before_rebind() {
        let manager = manager_with_allow_list(&["1209:3613"]);
        manager.handle_user_event(DeviceFileEvent::Added {
            serial: "s1".into(),
            file: DeviceFile { path: "/dev/ttyACM0".into(), kind: DeviceFileKind::Tty },
            busid: Some("1-2".into()),
            model_id: Some("1209:3613".into()),
        });
        manager.export("s1");
        manager.export("s1"); // no-op, already exported
        assert_eq!(manager.env.usbip.list_exported().unwrap().len(), 1);
        manager.unexport("s1");
        assert!(manager.env.usbip.list_exported().unwrap().is_empty());
    }
}
