//! Worker half of the event bus (spec.md §4.5): "one socket per (client,
//! worker) pair - established by the client only after a reservation
//! assigns it to that worker." Mirrors the `SignalWS` shape in the teacher's
//! `apps/sigchat/src/manager/signal_ws.rs` - a `WebSocket<TcpStream>` behind
//! an `Arc<Mutex<..>>`, one reader thread per connection.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use icefarm_common::event::{Event, EventKind};
use icefarm_db::Db;
use tungstenite::{Message, WebSocket};

use crate::device::DeviceManager;

type Socket = Arc<Mutex<WebSocket<TcpStream>>>;

/// Handshake payload a connecting client sends immediately after the
/// websocket upgrade (spec.md §4.5 "On connect, the initiator supplies
/// `{client_id}`").
#[derive(serde::Deserialize)]
struct Handshake {
    client_id: String,
}

pub struct WorkerBus {
    db: Db,
    manager: Arc<DeviceManager>,
    sockets: Mutex<HashMap<String, Socket>>,
}

impl WorkerBus {
    pub fn new(db: Db, manager: Arc<DeviceManager>) -> Arc<Self> {
        Arc::new(WorkerBus { db, manager, sockets: Mutex::new(HashMap::new()) })
    }

    /// Binds `addr` and accepts connections until the process exits. Each
    /// connection gets its own reader thread (spec.md §5: "no single-threaded
    /// event loop; every long-running component runs on its own task").
    pub fn serve(self: &Arc<Self>, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        log::info!(target: "icefarm_worker::bus", "worker event bus listening on {addr}");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let bus = self.clone();
                    thread::spawn(move || bus.accept(stream));
                }
                Err(err) => log::warn!(target: "icefarm_worker::bus", "accept failed: {err}"),
            }
        }
        Ok(())
    }

    fn accept(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into());
        let mut ws = match tungstenite::accept(stream) {
            Ok(ws) => ws,
            Err(err) => {
                log::warn!(target: "icefarm_worker::bus", "websocket handshake with {peer} failed: {err}");
                return;
            }
        };

        let client_id = match ws.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<Handshake>(&text) {
                Ok(hs) => hs.client_id,
                Err(err) => {
                    log::warn!(target: "icefarm_worker::bus", "malformed handshake from {peer}: {err}");
                    return;
                }
            },
            other => {
                log::warn!(target: "icefarm_worker::bus", "expected handshake text from {peer}, got {other:?}");
                return;
            }
        };

        log::info!(target: "icefarm_worker::bus", "client {client_id} connected from {peer}");
        let socket: Socket = Arc::new(Mutex::new(ws));
        self.sockets.lock().expect("worker bus sockets poisoned").insert(client_id.clone(), socket.clone());
        self.reader_loop(client_id, socket);
    }

    fn reader_loop(self: Arc<Self>, client_id: String, socket: Socket) {
        loop {
            let msg = {
                let mut guard = socket.lock().expect("worker bus socket poisoned");
                guard.read()
            };
            match msg {
                Ok(Message::Text(text)) => match Event::from_json(&text) {
                    Ok(event) => self.dispatch(event),
                    Err(err) => log::warn!(target: "icefarm_worker::bus", "malformed event from {client_id}: {err}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
                Err(err) => {
                    log::warn!(target: "icefarm_worker::bus", "read error from {client_id}: {err}");
                    break;
                }
            }
        }
        log::info!(target: "icefarm_worker::bus", "client {client_id} disconnected");
        self.sockets.lock().expect("worker bus sockets poisoned").remove(&client_id);
    }

    /// Routes one client -> worker message into the device manager. Unknown
    /// event kinds on this bus are dropped (spec.md §7 Protocol errors).
    fn dispatch(&self, event: Event) {
        let targets = event.target_serials();
        match event.contents {
            EventKind::Request { event: kind, contents } => {
                for serial in targets {
                    self.manager.handle_client_request(&serial, &kind, contents.clone());
                }
            }
            EventKind::Evaluate { batch_id, files } => {
                let mut contents = HashMap::new();
                contents.insert("batch_id".to_string(), serde_json::Value::String(batch_id));
                contents.insert(
                    "files".to_string(),
                    serde_json::to_value(&files).unwrap_or(serde_json::Value::Null),
                );
                for serial in targets {
                    self.manager.handle_client_request(&serial, "evaluate", contents.clone());
                }
            }
            other => log::debug!(
                target: "icefarm_worker::bus",
                "worker bus received an event kind it does not accept from clients: {}",
                other.name()
            ),
        }
    }

    /// Pushes a worker -> client event addressed by looking up the device's
    /// current reservation owner in the shared database (spec.md §2: workers
    /// "hold the authoritative database connection"). Dropped silently if
    /// the device has no owner or the owner has no live socket (spec.md
    /// §4.5: "the server ... drops undeliverable events; clients are
    /// expected to reconnect and re-query state").
    pub fn publish(&self, event: Event) {
        let owner = match icefarm_db::queries::device::get_device(&self.db, &event.serial) {
            Ok(Some(device)) => device.client_id,
            Ok(None) => None,
            Err(err) => {
                log::error!(target: "icefarm_worker::bus", "device lookup for {} failed: {err}", event.serial);
                None
            }
        };
        let Some(client_id) = owner else {
            log::debug!(target: "icefarm_worker::bus", "no reservation owner for {}, dropping {}", event.serial, event.contents.name());
            return;
        };
        self.send_to(&client_id, &event);
    }

    fn send_to(&self, client_id: &str, event: &Event) {
        let sockets = self.sockets.lock().expect("worker bus sockets poisoned");
        let Some(socket) = sockets.get(client_id) else {
            log::debug!(target: "icefarm_worker::bus", "no socket for client {client_id}, dropping event");
            return;
        };
        let json = match event.to_json() {
            Ok(json) => json,
            Err(err) => {
                log::error!(target: "icefarm_worker::bus", "failed to encode event for {client_id}: {err}");
                return;
            }
        };
        let mut guard = socket.lock().expect("worker bus socket poisoned");
        if let Err(err) = guard.send(Message::Text(json)) {
            log::warn!(target: "icefarm_worker::bus", "send to {client_id} failed: {err}");
        }
    }
}
