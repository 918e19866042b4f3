//! Worker HTTP front end (spec.md §4.4: "the engine dispatches an HTTP
//! `reserve(serial, kind, args)` to the owning worker asynchronously;
//! workers acknowledge by updating device status themselves, so control
//! never blocks on worker progress"). A minimal `tiny_http` server, the
//! natural synchronous-server counterpart to the teacher's `ureq` client use
//! (`apps/mtxchat/src/web.rs`).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tiny_http::{Method, Response, Server};

use crate::device::DeviceManager;

#[derive(Deserialize)]
struct ReserveBody {
    serial: String,
    kind: String,
    #[serde(default)]
    args: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct UnreserveBody {
    serial: String,
}

/// Body for the generic `/request` route: forwards a `reboot` (or any other
/// out-of-band) verb straight into the device's state handler registry, the
/// same path a bus-delivered `request(serial, event, contents)` would take
/// (spec.md §4.4 lists `reboot` among the exposed control verbs but §6's HTTP
/// table only details the reservation verbs; this route covers the rest).
#[derive(Deserialize)]
struct RequestBody {
    serial: String,
    event: String,
    #[serde(default)]
    contents: HashMap<String, serde_json::Value>,
}

/// Runs the worker's HTTP server until the process exits. Every request not
/// matching a known route gets `404`; a body that fails to parse gets `400`
/// (spec.md §6 "`400` malformed").
pub fn serve(manager: Arc<DeviceManager>, addr: &str) -> std::io::Result<()> {
    let server = Server::http(addr).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    log::info!(target: "icefarm_worker::http_api", "worker http api listening on {addr}");

    for mut request in server.incoming_requests() {
        let mut body = String::new();
        if let Err(err) = std::io::Read::read_to_string(request.as_reader(), &mut body) {
            log::warn!(target: "icefarm_worker::http_api", "failed to read request body: {err}");
            let _ = request.respond(Response::from_string("bad request").with_status_code(400));
            continue;
        }

        let (status, reply) = match (request.method(), request.url()) {
            (Method::Post, "/reserve") => handle_reserve(&manager, &body),
            (Method::Post, "/unreserve") => handle_unreserve(&manager, &body),
            (Method::Post, "/request") => handle_request(&manager, &body),
            _ => (404, "not found".to_string()),
        };
        if let Err(err) = request.respond(Response::from_string(reply).with_status_code(status)) {
            log::warn!(target: "icefarm_worker::http_api", "failed to send response: {err}");
        }
    }
    Ok(())
}

fn handle_reserve(manager: &Arc<DeviceManager>, body: &str) -> (u16, String) {
    let parsed: ReserveBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed reserve body: {err}")),
    };
    if manager.handle_reserve(&parsed.serial, &parsed.kind, parsed.args) {
        (200, "{}".to_string())
    } else {
        (500, format!("unknown serial {}", parsed.serial))
    }
}

fn handle_unreserve(manager: &Arc<DeviceManager>, body: &str) -> (u16, String) {
    let parsed: UnreserveBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed unreserve body: {err}")),
    };
    if manager.handle_unreserve(&parsed.serial) {
        (200, "{}".to_string())
    } else {
        (500, format!("unknown serial {}", parsed.serial))
    }
}

fn handle_request(manager: &Arc<DeviceManager>, body: &str) -> (u16, String) {
    let parsed: RequestBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed request body: {err}")),
    };
    manager.handle_client_request(&parsed.serial, &parsed.event, parsed.contents);
    (200, "{}".to_string())
}
