//! `BrokenState` (spec.md §4.1): "terminal for this boot cycle... Only a
//! hardware reset or explicit delete returns it to the pool."

use icefarm_common::model::DeviceStatus;
use icefarm_db::queries::device::update_device_status;

use super::test_state::TestState;
use super::{State, StateInput, Transition};
use crate::device::env::DeviceCtx;

pub struct BrokenState;

impl State for BrokenState {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn enter(&mut self, ctx: &DeviceCtx) {
        if let Err(err) = update_device_status(&ctx.env.db, &ctx.serial, DeviceStatus::Broken) {
            log::error!(target: "icefarm_worker::device", "failed to mark {} broken: {err}", ctx.serial);
        }
    }

    fn on_event(&mut self, _ctx: &DeviceCtx, input: StateInput) -> Transition {
        // A hardware reset is observed by the manager as a fresh hot-plug on
        // a new DeviceActor, not as an event delivered to this one. The
        // `reset` request is the explicit-recovery half of spec.md's "only a
        // hardware reset or explicit delete returns it to the pool" - it
        // lets an operator force a re-test without physically cycling power.
        if let StateInput::Request { event_kind, .. } = &input {
            if event_kind == "reset" {
                return Transition::Switch(Box::new(TestState::new()));
            }
        }
        Transition::Stay
    }
}
