//! Per-state event-handler registry (spec.md Design Notes §9, "Dynamic event
//! dispatch"): handlers are registered once, keyed by `event_kind`, each
//! carrying the list of content-field names it needs. A lookup that finds a
//! registered kind but a content map missing one of the declared fields
//! rejects the event without invoking the handler (spec.md §4.1).

use std::collections::HashMap;

use serde_json::Value;

type Handler<S> = fn(&mut S, &super::env::DeviceCtx, &[Value]) -> super::state::Transition;

struct Entry<S> {
    fields: Vec<&'static str>,
    handler: Handler<S>,
}

pub struct HandlerRegistry<S> {
    entries: HashMap<&'static str, Entry<S>>,
}

impl<S> HandlerRegistry<S> {
    pub fn new() -> Self {
        HandlerRegistry { entries: HashMap::new() }
    }

    pub fn register(&mut self, event_kind: &'static str, fields: &[&'static str], handler: Handler<S>) {
        self.entries.insert(event_kind, Entry { fields: fields.to_vec(), handler });
    }

    /// Looks up `event_kind`, extracts its declared fields positionally from
    /// `contents`, and invokes the handler. Returns `Transition::Stay` (a
    /// no-op) for an unregistered kind or one missing a required field -
    /// spec.md §7 classifies this as a Protocol error: "logged and dropped;
    /// never crash."
    pub fn dispatch(
        &self,
        state: &mut S,
        ctx: &super::env::DeviceCtx,
        event_kind: &str,
        contents: &HashMap<String, Value>,
    ) -> super::state::Transition {
        let Some(entry) = self.entries.get(event_kind) else {
            log::debug!(target: "icefarm_worker::device", "no handler registered for event kind {event_kind}");
            return super::state::Transition::Stay;
        };

        let mut extracted = Vec::with_capacity(entry.fields.len());
        for field in &entry.fields {
            match contents.get(*field) {
                Some(value) => extracted.push(value.clone()),
                None => {
                    log::warn!(
                        target: "icefarm_worker::device",
                        "event {event_kind} missing required field {field}, dropping"
                    );
                    return super::state::Transition::Stay;
                }
            }
        }

        (entry.handler)(state, ctx, &extracted)
    }
}

impl<S> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::env::{DeviceCtx, DeviceEnv};
    use crate::device::state::Transition;
    use crate::usbip::MockUsbIpController;
    use std::sync::Arc;

    struct Dummy {
        seen: Option<String>,
    }

    fn make_ctx() -> DeviceCtx {
        DeviceCtx::for_test("s1".into(), Arc::new(DeviceEnv::for_test(Arc::new(MockUsbIpController::new()))))
    }

    #[test]
    fn rejects_event_missing_required_field() {
        let mut registry: HandlerRegistry<Dummy> = HandlerRegistry::new();
        registry.register("greet", &["name"], |state, _ctx, fields| {
            state.seen = fields[0].as_str().map(|s| s.to_string());
            Transition::Stay
        });

        let mut dummy = Dummy { seen: None };
        let ctx = make_ctx();
        let contents = HashMap::new();
        registry.dispatch(&mut dummy, &ctx, "greet", &contents);
        assert_eq!(dummy.seen, None);
    }

    #[test]
    fn invokes_handler_with_extracted_fields() {
        let mut registry: HandlerRegistry<Dummy> = HandlerRegistry::new();
        registry.register("greet", &["name"], |state, _ctx, fields| {
            state.seen = fields[0].as_str().map(|s| s.to_string());
            Transition::Stay
        });

        let mut dummy = Dummy { seen: None };
        let ctx = make_ctx();
        let mut contents = HashMap::new();
        contents.insert("name".to_string(), Value::String("board".into()));
        registry.dispatch(&mut dummy, &ctx, "greet", &contents);
        assert_eq!(dummy.seen, Some("board".to_string()));
    }
}
