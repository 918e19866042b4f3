//! Firmware images the worker can install (spec.md §4.1: "default firmware"
//! and per-reservable-kind firmware, e.g. `FlashState(reservable_firmware,
//! ...)`).

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub kind: String,
    pub bytes: Vec<u8>,
}

/// The worker's known firmware images: exactly one `default` (installed
/// whenever a device is unreserved) plus one per supported reservable kind
/// (spec.md Worker row: "set of supported `reservables`").
pub struct FirmwareSet {
    default: FirmwareImage,
    reservables: HashMap<String, FirmwareImage>,
}

impl FirmwareSet {
    pub fn new(default: FirmwareImage) -> Self {
        FirmwareSet { default, reservables: HashMap::new() }
    }

    pub fn with_reservable(mut self, image: FirmwareImage) -> Self {
        self.reservables.insert(image.kind.clone(), image);
        self
    }

    pub fn default_image(&self) -> &FirmwareImage {
        &self.default
    }

    pub fn reservable(&self, kind: &str) -> Option<&FirmwareImage> {
        self.reservables.get(kind)
    }

    pub fn supported_kinds(&self) -> Vec<String> {
        self.reservables.keys().cloned().collect()
    }
}
