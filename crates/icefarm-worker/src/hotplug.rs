//! Hot-plug event sourcing (spec.md §4.3). Real udev consumption is out of
//! scope; `HotplugSource` is the small interface the device manager consumes
//! instead, matching spec.md §1's framing of udev as an external collaborator.

use std::sync::mpsc::{Receiver, Sender};

use crate::devicefile::DeviceFileEvent;

/// Source of normalised hot-plug events. `ChannelHotplugSource` is the only
/// implementation in this crate (used by the manager's own initial-scan
/// replay and by tests); a real deployment plugs in a udev-backed source
/// out-of-tree and feeds it through the same channel.
pub trait HotplugSource: Send {
    fn next_event(&self) -> Option<DeviceFileEvent>;
}

/// An `mpsc` channel wrapped as a `HotplugSource`. Whatever feeds normalised
/// udev events into the `Sender` half (a real udev listener, in production;
/// a test driver, in this crate's tests) need not know anything about the
/// device manager's internals.
pub struct ChannelHotplugSource {
    rx: Receiver<DeviceFileEvent>,
}

impl ChannelHotplugSource {
    pub fn new() -> (Sender<DeviceFileEvent>, Self) {
        let (tx, rx) = std::sync::mpsc::channel();
        (tx, ChannelHotplugSource { rx })
    }
}

impl HotplugSource for ChannelHotplugSource {
    fn next_event(&self) -> Option<DeviceFileEvent> {
        self.rx.recv().ok()
    }
}

/// USB kernel-event subset used to detect USB/IP client-side disconnects
/// (spec.md §4.3 "Kernel events"): a remove for a bus id that is exported
/// but no longer in the USB/IP exported-bus list means the remote client
/// detached, not that the board unplugged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelUsbRemove {
    pub busid: String,
}

/// Source of normalised kernel USB-remove events, filtered to USB devices
/// only (spec.md §4.3 "Kernel events for all USB devices"). Kept separate
/// from `HotplugSource` since the two udev streams the manager subscribes to
/// serve disjoint purposes and carry disjoint event shapes.
pub trait KernelEventSource: Send {
    fn next_event(&self) -> Option<KernelUsbRemove>;
}

pub struct ChannelKernelEventSource {
    rx: Receiver<KernelUsbRemove>,
}

impl ChannelKernelEventSource {
    pub fn new() -> (Sender<KernelUsbRemove>, Self) {
        let (tx, rx) = std::sync::mpsc::channel();
        (tx, ChannelKernelEventSource { rx })
    }
}

impl KernelEventSource for ChannelKernelEventSource {
    fn next_event(&self) -> Option<KernelUsbRemove> {
        self.rx.recv().ok()
    }
}
