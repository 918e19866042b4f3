//! Normalised device-file events (spec.md §1: "udev parsing (we consume
//! normalised device events)" is out of scope - this is the shape those
//! events take once normalised).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFileKind {
    /// A serial (tty) endpoint - present while the board runs application
    /// firmware or sits in the USB-serial half of bootloader mode.
    Tty,
    /// A disk partition - present when the board has rebooted as a UF2
    /// mass-storage endpoint.
    Partition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFile {
    pub path: String,
    pub kind: DeviceFileKind,
}

/// A hot-plug add/remove of one device-file belonging to `serial`. A single
/// board reboot can surface several of these in arbitrary interleaving
/// (spec.md §4.1: "Bootloader-mode handling must tolerate the board exposing
/// *multiple* device-files ... in arbitrary interleaving").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFileEvent {
    /// `model_id` is the normalised vendor:product identifier used by the
    /// manager's allow-list filter (spec.md §4.3 "filters to serials
    /// recognised as supported hardware"); `None` for a replayed/synthesised
    /// event about a serial the manager already recognises.
    Added { serial: String, file: DeviceFile, busid: Option<String>, model_id: Option<String> },
    Removed { serial: String, file: DeviceFile },
}

impl DeviceFileEvent {
    pub fn serial(&self) -> &str {
        match self {
            DeviceFileEvent::Added { serial, .. } => serial,
            DeviceFileEvent::Removed { serial, .. } => serial,
        }
    }
}
