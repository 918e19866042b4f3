//! Control HTTP front end (spec.md §6): the full verb table (`/reserve`,
//! `/extend`, `/extendall`, `/end`, `/endall`, `/available`, `/log`) plus
//! `/reboot` and `/delete` from §4.4's verb list, which the table omits.
//! `tiny_http`, matching the teacher's synchronous-server counterpart to its
//! `ureq` client use.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tiny_http::{Response, Server};

use crate::engine::Engine;

#[derive(Deserialize)]
struct ReserveBody {
    amount: usize,
    name: String,
    kind: String,
    #[serde(default)]
    args: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ReserveSpecificBody {
    serials: Vec<String>,
    name: String,
    kind: String,
    #[serde(default)]
    args: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct SerialsBody {
    name: String,
    serials: Vec<String>,
}

#[derive(Deserialize)]
struct NameBody {
    name: String,
}

#[derive(Deserialize)]
struct LogBody {
    name: String,
    logs: Vec<String>,
}

#[derive(Deserialize)]
struct SerialBody {
    serial: String,
}

/// Runs the control HTTP server until the process exits. `400` on a body
/// that fails to parse, `500` on an engine/database error, `404` on an
/// unmatched route, `200` with a JSON payload on success (spec.md §6).
pub fn serve(engine: Arc<Engine>, addr: &str) -> std::io::Result<()> {
    let server = Server::http(addr).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    log::info!(target: "icefarm_control::http_api", "control http api listening on {addr}");

    for mut request in server.incoming_requests() {
        let mut body = String::new();
        if let Err(err) = std::io::Read::read_to_string(request.as_reader(), &mut body) {
            log::warn!(target: "icefarm_control::http_api", "failed to read request body: {err}");
            let _ = request.respond(Response::from_string("bad request").with_status_code(400));
            continue;
        }

        let (status, reply) = match request.url() {
            "/reserve" => handle_reserve(&engine, &body),
            "/reservespecific" => handle_reserve_specific(&engine, &body),
            "/extend" => handle_extend(&engine, &body),
            "/extendall" => handle_extend_all(&engine, &body),
            "/end" => handle_end(&engine, &body),
            "/endall" => handle_end_all(&engine, &body),
            "/available" => handle_available(&engine),
            "/log" => handle_log(&engine, &body),
            "/reboot" => handle_reboot(&engine, &body),
            "/delete" => handle_delete(&engine, &body),
            _ => (404, "not found".to_string()),
        };
        if let Err(err) = request.respond(Response::from_string(reply).with_status_code(status)) {
            log::warn!(target: "icefarm_control::http_api", "failed to send response: {err}");
        }
    }
    Ok(())
}

fn handle_reserve(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: ReserveBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed reserve body: {err}")),
    };
    match engine.reserve(parsed.amount, &parsed.name, &parsed.kind, parsed.args) {
        Ok(tuples) => (200, connections_json(&tuples)),
        Err(err) => (500, err.to_string()),
    }
}

fn handle_reserve_specific(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: ReserveSpecificBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed reserveSpecific body: {err}")),
    };
    match engine.reserve_specific(&parsed.serials, &parsed.name, &parsed.kind, parsed.args) {
        Ok(tuples) => (200, connections_json(&tuples)),
        Err(err) => (500, err.to_string()),
    }
}

fn connections_json(tuples: &[(String, String, u16)]) -> String {
    let payload: Vec<_> = tuples.iter().map(|(serial, ip, port)| json!({ "serial": serial, "ip": ip, "serverport": port })).collect();
    serde_json::to_string(&payload).unwrap_or_else(|_| "[]".to_string())
}

fn handle_extend(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: SerialsBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed extend body: {err}")),
    };
    match engine.extend(&parsed.name, &parsed.serials) {
        Ok(extended) => (200, serde_json::to_string(&extended).unwrap_or_else(|_| "[]".to_string())),
        Err(err) => (500, err.to_string()),
    }
}

fn handle_extend_all(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: NameBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed extendall body: {err}")),
    };
    match engine.extend_all(&parsed.name) {
        Ok(extended) => (200, serde_json::to_string(&extended).unwrap_or_else(|_| "[]".to_string())),
        Err(err) => (500, err.to_string()),
    }
}

fn handle_end(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: SerialsBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed end body: {err}")),
    };
    match engine.end(&parsed.name, &parsed.serials) {
        Ok(ended) => (200, serde_json::to_string(&ended).unwrap_or_else(|_| "[]".to_string())),
        Err(err) => (500, err.to_string()),
    }
}

fn handle_end_all(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: NameBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed endall body: {err}")),
    };
    match engine.end_all(&parsed.name) {
        Ok(ended) => (200, serde_json::to_string(&ended).unwrap_or_else(|_| "[]".to_string())),
        Err(err) => (500, err.to_string()),
    }
}

fn handle_available(engine: &Arc<Engine>) -> (u16, String) {
    match engine.available() {
        Ok(amount) => (200, json!({ "amount": amount }).to_string()),
        Err(err) => (500, err.to_string()),
    }
}

fn handle_log(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: LogBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed log body: {err}")),
    };
    engine.log(&parsed.name, parsed.logs);
    (200, "{}".to_string())
}

fn handle_reboot(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: SerialBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed reboot body: {err}")),
    };
    match engine.reboot(&parsed.serial) {
        Ok(()) => (200, "{}".to_string()),
        Err(err) => (500, err.to_string()),
    }
}

fn handle_delete(engine: &Arc<Engine>, body: &str) -> (u16, String) {
    let parsed: SerialBody = match serde_json::from_str(body) {
        Ok(b) => b,
        Err(err) => return (400, format!("malformed delete body: {err}")),
    };
    match engine.delete(&parsed.serial) {
        Ok(()) => (200, "{}".to_string()),
        Err(err) => (500, err.to_string()),
    }
}
