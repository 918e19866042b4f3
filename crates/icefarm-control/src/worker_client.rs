//! Control -> worker HTTP dispatch (spec.md §4.4: "the engine dispatches an
//! HTTP `reserve(serial, kind, args)` to the owning worker asynchronously;
//! workers acknowledge by updating device status themselves, so control
//! never blocks on worker progress"). `ureq`-based, matching the teacher's
//! `apps/mtxchat/src/web.rs` request helpers.

use std::collections::HashMap;

use serde_json::Value;

/// One outbound call, fired on its own thread by the engine so a slow or
/// dead worker never blocks the HTTP response to the client.
pub fn dispatch_reserve(worker_ip: &str, worker_port: u16, serial: &str, kind: &str, args: HashMap<String, Value>) {
    let url = format!("http://{worker_ip}:{worker_port}/reserve");
    let body = serde_json::json!({ "serial": serial, "kind": kind, "args": args });
    if let Err(err) = ureq::post(&url).send_json(body) {
        log::warn!(target: "icefarm_control::worker_client", "reserve dispatch to {url} for {serial} failed: {err}");
    }
}

pub fn dispatch_unreserve(worker_ip: &str, worker_port: u16, serial: &str) {
    let url = format!("http://{worker_ip}:{worker_port}/unreserve");
    let body = serde_json::json!({ "serial": serial });
    if let Err(err) = ureq::post(&url).send_json(body) {
        log::warn!(target: "icefarm_control::worker_client", "unreserve dispatch to {url} for {serial} failed: {err}");
    }
}

/// Used by the `reboot` verb (spec.md §4.4's verb list; not detailed in the
/// §6 HTTP table) to forward an arbitrary event into the device's state
/// handler registry without a dedicated control-side HTTP shape per verb.
pub fn dispatch_request(worker_ip: &str, worker_port: u16, serial: &str, event: &str, contents: HashMap<String, Value>) {
    let url = format!("http://{worker_ip}:{worker_port}/request");
    let body = serde_json::json!({ "serial": serial, "event": event, "contents": contents });
    if let Err(err) = ureq::post(&url).send_json(body) {
        log::warn!(target: "icefarm_control::worker_client", "request dispatch to {url} for {serial} failed: {err}");
    }
}
