//! `DeviceActor`: one physical board. Owns the `Mutex<Box<dyn State>>`
//! switch-latch of spec.md §4.1 - the mutex is held across an entire
//! exit+enter sequence, so a successor state's `enter` never observes an
//! event that arrived mid-transition, and no event is ever delivered to both
//! the outgoing and incoming state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use super::env::{DeviceCtx, DeviceEnv};
use super::state::{State, StateInput, Transition};
use crate::devicefile::DeviceFileEvent;

pub struct DeviceActor {
    pub serial: String,
    pub env: Arc<DeviceEnv>,
    state: Mutex<Box<dyn State>>,
    self_handle: Mutex<Weak<DeviceActor>>,
}

impl DeviceActor {
    /// Constructs the actor and runs the initial state's `enter` before
    /// returning it, so callers never observe a not-yet-entered state.
    pub fn new(serial: String, env: Arc<DeviceEnv>, initial: Box<dyn State>) -> Arc<Self> {
        let actor = Arc::new(DeviceActor {
            serial,
            env,
            state: Mutex::new(initial),
            self_handle: Mutex::new(Weak::new()),
        });
        *actor.self_handle.lock().expect("device actor poisoned") = Arc::downgrade(&actor);

        let ctx = actor.ctx();
        actor.state.lock().expect("device actor poisoned").enter(&ctx);
        actor
    }

    pub fn handle(&self) -> Weak<DeviceActor> {
        self.self_handle.lock().expect("device actor poisoned").clone()
    }

    pub fn ctx(&self) -> DeviceCtx {
        DeviceCtx::new(self.serial.clone(), self.env.clone(), self.handle())
    }

    pub fn state_name(&self) -> &'static str {
        self.state.lock().expect("device actor poisoned").name()
    }

    pub fn dispatch_file_event(&self, event: DeviceFileEvent) {
        self.apply(StateInput::File(event));
    }

    pub fn dispatch_request(&self, event_kind: impl Into<String>, contents: HashMap<String, Value>) {
        self.apply(StateInput::Request { event_kind: event_kind.into(), contents });
    }

    fn apply(&self, input: StateInput) {
        let ctx = self.ctx();
        let mut guard = self.state.lock().expect("device actor poisoned");
        match guard.on_event(&ctx, input) {
            Transition::Stay => {}
            Transition::Switch(mut next) => {
                guard.exit(&ctx);
                next.enter(&ctx);
                *guard = next;
            }
        }
    }

    /// Forces a transition from outside the normal event path - used by
    /// timer threads (spec.md §4.1 Flash timeout) that must be able to drive
    /// a switch without routing through `on_event`.
    pub fn force_switch(&self, mut next: Box<dyn State>) {
        let ctx = self.ctx();
        let mut guard = self.state.lock().expect("device actor poisoned");
        guard.exit(&ctx);
        next.enter(&ctx);
        *guard = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::env::DeviceEnv;
    use crate::usbip::MockUsbIpController;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingState {
        entered: Arc<AtomicU32>,
        exited: Arc<AtomicU32>,
        switch_on_event: bool,
    }

    impl State for CountingState {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn enter(&mut self, _ctx: &DeviceCtx) {
            self.entered.fetch_add(1, Ordering::SeqCst);
        }

        fn exit(&mut self, _ctx: &DeviceCtx) {
            self.exited.fetch_add(1, Ordering::SeqCst);
        }

        fn on_event(&mut self, _ctx: &DeviceCtx, _input: StateInput) -> Transition {
            if self.switch_on_event {
                Transition::Switch(Box::new(CountingState {
                    entered: self.entered.clone(),
                    exited: self.exited.clone(),
                    switch_on_event: false,
                }))
            } else {
                Transition::Stay
            }
        }
    }

    #[test]
    fn switch_runs_exit_before_next_enter_exactly_once() {
        let entered = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let env = Arc::new(DeviceEnv::for_test(Arc::new(MockUsbIpController::new())));
        let initial = CountingState { entered: entered.clone(), exited: exited.clone(), switch_on_event: true };
        let actor = DeviceActor::new("s1".into(), env, Box::new(initial));
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert_eq!(exited.load(Ordering::SeqCst), 0);

        actor.dispatch_request("anything", HashMap::new());
        assert_eq!(exited.load(Ordering::SeqCst), 1);
        assert_eq!(entered.load(Ordering::SeqCst), 2);

        // the successor state no longer switches; a second event stays put.
        actor.dispatch_request("anything", HashMap::new());
        assert_eq!(exited.load(Ordering::SeqCst), 1);
        assert_eq!(entered.load(Ordering::SeqCst), 2);
    }
}
