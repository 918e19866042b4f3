//! The entities of spec.md §3: `Device`, `Worker`, `Reservation` on the
//! persisted side, and `Bundle`/`Evaluation`/`Batch` on the client side.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `status ∈ {available, reserved, await_flash_default, flashing_default, testing, broken}`
///
/// Invariant: `status == Reserved` iff the owning `Device::client_id` is
/// `Some`. The two fields are kept in separate columns in `icefarm-db`
/// rather than folded into one enum carrying the client id, because control
/// and the worker each own a disjoint half of this struct (see spec.md §3
/// "Ownership") and need to mutate their half without racing the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Available,
    Reserved,
    AwaitFlashDefault,
    FlashingDefault,
    Testing,
    Broken,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Available => "available",
            DeviceStatus::Reserved => "reserved",
            DeviceStatus::AwaitFlashDefault => "await_flash_default",
            DeviceStatus::FlashingDefault => "flashing_default",
            DeviceStatus::Testing => "testing",
            DeviceStatus::Broken => "broken",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "available" => DeviceStatus::Available,
            "reserved" => DeviceStatus::Reserved,
            "await_flash_default" => DeviceStatus::AwaitFlashDefault,
            "flashing_default" => DeviceStatus::FlashingDefault,
            "testing" => DeviceStatus::Testing,
            "broken" => DeviceStatus::Broken,
            _ => return None,
        })
    }
}

/// A physical board. Identity is the opaque `serial`; everything else is
/// mutable. `client_id` must be `Some` exactly when `status` is `Reserved` -
/// callers constructing a `Device` by hand (tests, the db adapter) are
/// responsible for the invariant, `Device::is_consistent` just checks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub worker: String,
    pub status: DeviceStatus,
    pub client_id: Option<String>,
}

impl Device {
    pub fn new(serial: impl Into<String>, worker: impl Into<String>) -> Self {
        Device { serial: serial.into(), worker: worker.into(), status: DeviceStatus::FlashingDefault, client_id: None }
    }

    pub fn is_consistent(&self) -> bool {
        (self.status == DeviceStatus::Reserved) == self.client_id.is_some()
    }
}

/// A worker host. `reservables` is the set of kinds (e.g. `"pulsecount"`)
/// this worker's devices can be flashed to serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub ip: String,
    pub port: u16,
    /// Port the worker's event bus (spec.md §4.5) listens on, distinct from
    /// `port` (the worker's HTTP reserve/unreserve endpoint control dials).
    /// This is what `reserve`'s connection tuples hand back to clients.
    pub bus_port: u16,
    pub version: String,
    pub reservables: BTreeSet<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub shutting_down: bool,
}

impl Worker {
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}

/// Lease binding `serial` to `client_id`. At most one active reservation per
/// serial (enforced by `icefarm-db`, not here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub serial: String,
    pub client_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn ending_soon(&self, now: DateTime<Utc>, warning_window: chrono::Duration) -> bool {
        !self.is_expired(now) && self.expires_at - now <= warning_window
    }
}

/// One bitstream to run on one or more serials, with a result expected back
/// per serial. `id` is unique within the owning `Bundle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub serials: BTreeSet<String>,
    pub payload: Vec<u8>,
}

impl Evaluation {
    pub fn new(id: impl Into<String>, serials: impl IntoIterator<Item = String>, payload: Vec<u8>) -> Self {
        Evaluation { id: id.into(), serials: serials.into_iter().collect(), payload }
    }
}

/// Client-side work item: a set of evaluations over a set of reserved
/// serials. Invariant (checked by `Bundle::validate`): every evaluation's
/// serials are a subset of `reserved_serials`, and evaluation ids are unique.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    pub reserved_serials: BTreeSet<String>,
    pub evaluations: Vec<Evaluation>,
}

impl Bundle {
    pub fn new(reserved_serials: impl IntoIterator<Item = String>) -> Self {
        Bundle { reserved_serials: reserved_serials.into_iter().collect(), evaluations: Vec::new() }
    }

    pub fn push(&mut self, evaluation: Evaluation) {
        self.evaluations.push(evaluation);
    }

    /// Returns `Err(evaluation_id)` for the first evaluation that violates
    /// the subset or uniqueness invariant.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for ev in &self.evaluations {
            if !seen.insert(&ev.id) {
                return Err(ev.id.clone());
            }
            if !ev.serials.is_subset(&self.reserved_serials) {
                return Err(ev.id.clone());
            }
        }
        Ok(())
    }
}

/// A grouping `{serials -> [Evaluation]}` derived from a `Bundle`: every
/// evaluation in one batch shares the same serial set.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub serials: BTreeSet<String>,
    pub evaluations: Vec<Evaluation>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.evaluations.is_empty()
    }
}

/// Pulse-count result for one evaluation on one serial.
pub type PulseResult = (String, u32);

/// `batch_id -> results` as received over the worker event bus.
pub type ResultsBySerial = HashMap<String, Vec<PulseResult>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_consistency() {
        let mut d = Device::new("serial-1", "worker-a");
        d.status = DeviceStatus::Available;
        assert!(d.is_consistent());
        d.status = DeviceStatus::Reserved;
        assert!(!d.is_consistent());
        d.client_id = Some("client-1".into());
        assert!(d.is_consistent());
    }

    #[test]
    fn bundle_rejects_serial_outside_reservation() {
        let mut bundle = Bundle::new(["A".to_string()]);
        bundle.push(Evaluation::new("ev1", ["A".to_string(), "B".to_string()], vec![]));
        assert_eq!(bundle.validate(), Err("ev1".to_string()));
    }

    #[test]
    fn bundle_rejects_duplicate_evaluation_ids() {
        let mut bundle = Bundle::new(["A".to_string()]);
        bundle.push(Evaluation::new("ev1", ["A".to_string()], vec![1]));
        bundle.push(Evaluation::new("ev1", ["A".to_string()], vec![2]));
        assert_eq!(bundle.validate(), Err("ev1".to_string()));
    }
}
