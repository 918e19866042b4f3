//! The device state machine of spec.md §4.1: one `State` object per board,
//! transitions serialised by the switch-latch in `device::actor`.

pub mod broken;
pub mod flash;
pub mod pulsecount;
pub mod ready;
pub mod test_state;

use std::collections::HashMap;

use serde_json::Value;

use super::env::DeviceCtx;
use crate::devicefile::DeviceFileEvent;

/// What a state's `on_event` is asked to react to.
pub enum StateInput {
    /// A hot-plug add/remove for this serial (spec.md §4.3).
    File(DeviceFileEvent),
    /// A `request(serial, event, contents)` dispatched from the client
    /// (spec.md §6), or a worker-local pseudo-request like `reserve` /
    /// `unreserve` dispatched by the device manager.
    Request { event_kind: String, contents: HashMap<String, Value> },
}

/// What a state wants to happen after handling one input.
pub enum Transition {
    Stay,
    Switch(Box<dyn State>),
}

/// One state in the per-device machine. `enter`/`exit` bound a transition;
/// the switch-latch in `DeviceActor::apply` guarantees the outgoing state's
/// `exit` completes before the incoming state's `enter` runs, and that no
/// event is delivered to both (spec.md §5 ordering guarantees).
pub trait State: Send {
    fn name(&self) -> &'static str;

    fn enter(&mut self, ctx: &DeviceCtx) {
        let _ = ctx;
    }

    fn exit(&mut self, ctx: &DeviceCtx) {
        let _ = ctx;
    }

    fn on_event(&mut self, ctx: &DeviceCtx, input: StateInput) -> Transition;
}
