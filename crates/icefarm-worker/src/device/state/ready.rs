//! `ReadyState` (spec.md §4.1): "entry: mark device `available`. Passive
//! state; responds to reserve requests from the Device Manager by switching
//! to `FlashState(reservable_firmware, next=Reservable(kind))`."

use std::sync::OnceLock;

use icefarm_common::model::DeviceStatus;
use icefarm_db::queries::device::update_device_status;

use super::flash::FlashState;
use super::pulsecount::PulseCountState;
use super::{State, StateInput, Transition};
use crate::device::env::DeviceCtx;
use crate::device::registry::HandlerRegistry;

#[derive(Default)]
pub struct ReadyState;

fn registry() -> &'static HandlerRegistry<ReadyState> {
    static REGISTRY: OnceLock<HandlerRegistry<ReadyState>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = HandlerRegistry::new();
        registry.register("reserve", &["kind"], |_state, ctx, fields| {
            let kind = fields[0].as_str().unwrap_or_default();
            reserve(ctx, kind)
        });
        registry
    })
}

fn reserve(ctx: &DeviceCtx, kind: &str) -> Transition {
    let Some(image) = ctx.env.firmware.reservable(kind) else {
        log::warn!(target: "icefarm_worker::device", "reserve requested unknown kind {kind} for {}", ctx.serial);
        return Transition::Stay;
    };
    let image = image.clone();
    let kind = kind.to_string();
    let timeout = ctx.env.flash_timeout;
    Transition::Switch(Box::new(FlashState::new(
        image,
        Box::new(move |_ctx: &DeviceCtx| Box::new(PulseCountState::new(kind.clone())) as Box<dyn State>),
        Some(timeout),
        Vec::new(),
    )))
}

impl State for ReadyState {
    fn name(&self) -> &'static str {
        "ready"
    }

    fn enter(&mut self, ctx: &DeviceCtx) {
        if let Err(err) = update_device_status(&ctx.env.db, &ctx.serial, DeviceStatus::Available) {
            log::error!(target: "icefarm_worker::device", "failed to mark {} available: {err}", ctx.serial);
        }
    }

    fn on_event(&mut self, ctx: &DeviceCtx, input: StateInput) -> Transition {
        match input {
            StateInput::Request { event_kind, contents } => registry().dispatch(self, ctx, &event_kind, &contents),
            StateInput::File(_) => Transition::Stay,
        }
    }
}
