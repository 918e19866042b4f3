//! Event bus envelope and event kinds (spec.md §5, §6).
//!
//! Wire format: length-prefixed JSON, envelope `{"serial": str, "contents":
//! {"event": str, ...}}`. This module owns the envelope and the set of
//! content shapes; framing (the length prefix) lives in the bus modules of
//! `icefarm-worker`/`icefarm-control`/`icefarm-client` since it is transport,
//! not data.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CommonError;
use crate::model::PulseResult;

/// The outer envelope every event bus message is wrapped in. `serials`
/// carries the full target set for a `requestBatchWorker` dispatch
/// (spec.md §4.5): "groups serials by owning worker and sends one message
/// per worker carrying the full serial set for that group; the receiving
/// worker overwrites the `serial` field of the envelope per-recipient on
/// dispatch into the per-device state machine." `serial` alone still carries
/// every single-recipient message (worker -> client events, and any
/// client -> worker request addressed to exactly one device); `serials` is
/// `None` for those and present only on a batch dispatch, where `serial` is
/// set to the first member for backward-compatible single-serial readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub serial: String,
    pub contents: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serials: Option<Vec<String>>,
}

impl Event {
    pub fn new(serial: impl Into<String>, contents: EventKind) -> Self {
        Event { serial: serial.into(), contents, serials: None }
    }

    /// Constructs a batch dispatch addressed to every serial in `serials`
    /// (spec.md §4.5 `requestBatchWorker`). Panics if `serials` is empty -
    /// callers group by non-empty per-worker serial sets before calling.
    pub fn for_batch(serials: Vec<String>, contents: EventKind) -> Self {
        let first = serials.first().cloned().expect("requestBatchWorker serial set must be non-empty");
        Event { serial: first, contents, serials: Some(serials) }
    }

    /// The serials this envelope is addressed to: the full batch set if
    /// present, otherwise just `serial`.
    pub fn target_serials(&self) -> Vec<String> {
        self.serials.clone().unwrap_or_else(|| vec![self.serial.clone()])
    }

    pub fn to_json(&self) -> Result<String, CommonError> {
        serde_json::to_string(self).map_err(|e| CommonError::Malformed(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self, CommonError> {
        serde_json::from_str(s).map_err(|e| CommonError::Malformed(e.to_string()))
    }
}

/// Every event kind named in spec.md §6, tagged on the `event` field so the
/// JSON matches `{"event": "...", ...fields}` exactly as specified rather
/// than wrapping in an extra enum-variant key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// worker -> client, after reservable state entered.
    Initialized,
    /// control -> client, within lease-warning window.
    ReservationEndingSoon,
    /// control -> client, upon expiry / forced end.
    ReservationEnd,
    /// control -> client, when the hosting worker is considered lost.
    Failure,
    /// control -> all clients.
    DevicesAvailable { amount: u32 },
    /// client -> worker; `event` is dispatched to the device's state handler
    /// registry. `contents` is a free-form field map because the registry
    /// (not this envelope) knows which fields a given `event` requires.
    Request { event: String, contents: HashMap<String, serde_json::Value> },
    /// worker -> client.
    Results { batch_id: String, results: Vec<PulseResult> },
    /// client -> worker (pulse-count request). `files` maps evaluation id to
    /// raw bitstream bytes.
    Evaluate { batch_id: String, files: HashMap<String, Vec<u8>> },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Initialized => "initialized",
            EventKind::ReservationEndingSoon => "reservation ending soon",
            EventKind::ReservationEnd => "reservation end",
            EventKind::Failure => "failure",
            EventKind::DevicesAvailable { .. } => "devices_available",
            EventKind::Request { .. } => "request",
            EventKind::Results { .. } => "results",
            EventKind::Evaluate { .. } => "evaluate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let ev = Event::new("serial-1", EventKind::DevicesAvailable { amount: 3 });
        let json = ev.to_json().unwrap();
        assert!(json.contains("\"devices_available\""));
        let back = Event::from_json(&json).unwrap();
        assert_eq!(back.serial, "serial-1");
        match back.contents {
            EventKind::DevicesAvailable { amount } => assert_eq!(amount, 3),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn batch_dispatch_targets_every_member_serial() {
        let ev = Event::for_batch(
            vec!["s1".to_string(), "s2".to_string()],
            EventKind::Evaluate { batch_id: "b1".into(), files: HashMap::new() },
        );
        assert_eq!(ev.serial, "s1");
        assert_eq!(ev.target_serials(), vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn single_serial_event_targets_itself() {
        let ev = Event::new("s1", EventKind::Initialized);
        assert_eq!(ev.target_serials(), vec!["s1".to_string()]);
    }

    #[test]
    fn malformed_json_is_rejected_not_panicked() {
        let err = Event::from_json("not json").unwrap_err();
        matches!(err, CommonError::Malformed(_));
    }
}
