//! Control half of the event bus (spec.md §4.5): "one socket per client.
//! Events pushed to a client are addressed by `client_id`; the server
//! maintains `client_id -> socket` and drops undeliverable events." Mirrors
//! the teacher's `SignalWS` shape (`apps/sigchat/src/manager/signal_ws.rs`).

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use icefarm_common::event::Event;
use tungstenite::{Message, WebSocket};

type Socket = Arc<Mutex<WebSocket<TcpStream>>>;

#[derive(serde::Deserialize)]
struct Handshake {
    client_id: String,
}

pub struct ControlBus {
    sockets: Mutex<HashMap<String, Socket>>,
}

impl ControlBus {
    pub fn new() -> Arc<Self> {
        Arc::new(ControlBus { sockets: Mutex::new(HashMap::new()) })
    }

    pub fn serve(self: &Arc<Self>, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        log::info!(target: "icefarm_control::bus", "control event bus listening on {addr}");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let bus = self.clone();
                    thread::spawn(move || bus.accept(stream));
                }
                Err(err) => log::warn!(target: "icefarm_control::bus", "accept failed: {err}"),
            }
        }
        Ok(())
    }

    fn accept(self: Arc<Self>, stream: TcpStream) {
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into());
        let mut ws = match tungstenite::accept(stream) {
            Ok(ws) => ws,
            Err(err) => {
                log::warn!(target: "icefarm_control::bus", "websocket handshake with {peer} failed: {err}");
                return;
            }
        };

        let client_id = match ws.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<Handshake>(&text) {
                Ok(hs) => hs.client_id,
                Err(err) => {
                    log::warn!(target: "icefarm_control::bus", "malformed handshake from {peer}: {err}");
                    return;
                }
            },
            other => {
                log::warn!(target: "icefarm_control::bus", "expected handshake text from {peer}, got {other:?}");
                return;
            }
        };

        log::info!(target: "icefarm_control::bus", "client {client_id} connected from {peer}");
        let socket: Socket = Arc::new(Mutex::new(ws));
        self.sockets.lock().expect("control bus sockets poisoned").insert(client_id.clone(), socket.clone());
        self.reader_loop(client_id, socket);
    }

    /// The control bus is push-only from the client's perspective (spec.md
    /// §6 lists no client -> control event kinds); a connected client's
    /// reader thread only needs to notice disconnects and prune the socket.
    fn reader_loop(self: Arc<Self>, client_id: String, socket: Socket) {
        loop {
            let msg = {
                let mut guard = socket.lock().expect("control bus socket poisoned");
                guard.read()
            };
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
                Err(err) => {
                    log::warn!(target: "icefarm_control::bus", "read error from {client_id}: {err}");
                    break;
                }
            }
        }
        log::info!(target: "icefarm_control::bus", "client {client_id} disconnected");
        self.sockets.lock().expect("control bus sockets poisoned").remove(&client_id);
    }

    /// Pushes `event` to `client_id`'s socket. Dropped silently if the
    /// client has no live connection (spec.md §4.5 "drops undeliverable
    /// events; clients are expected to reconnect and re-query state").
    pub fn send_to(&self, client_id: &str, event: &Event) {
        let sockets = self.sockets.lock().expect("control bus sockets poisoned");
        let Some(socket) = sockets.get(client_id) else {
            log::debug!(target: "icefarm_control::bus", "no socket for client {client_id}, dropping {}", event.contents.name());
            return;
        };
        let json = match event.to_json() {
            Ok(json) => json,
            Err(err) => {
                log::error!(target: "icefarm_control::bus", "failed to encode event for {client_id}: {err}");
                return;
            }
        };
        let mut guard = socket.lock().expect("control bus socket poisoned");
        if let Err(err) = guard.send(Message::Text(json)) {
            log::warn!(target: "icefarm_control::bus", "send to {client_id} failed: {err}");
        }
    }

    /// Pushes `event` to every connected client (spec.md §6
    /// `devices_available(amount)` - "control -> all clients").
    pub fn broadcast(&self, event: &Event) {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(err) => {
                log::error!(target: "icefarm_control::bus", "failed to encode broadcast event: {err}");
                return;
            }
        };
        let sockets = self.sockets.lock().expect("control bus sockets poisoned");
        for (client_id, socket) in sockets.iter() {
            let mut guard = socket.lock().expect("control bus socket poisoned");
            if let Err(err) = guard.send(Message::Text(json.clone())) {
                log::warn!(target: "icefarm_control::bus", "broadcast to {client_id} failed: {err}");
            }
        }
    }
}

/// Consumes `icefarm-db`'s notification bus and fans each notification out
/// over the control event bus (spec.md §4.4 "fanned out over the event bus
/// to the affected client and to all connected clients respectively").
/// Runs until the notify bus's sender side is dropped (process exit).
pub fn run_notify_fanout(notify: Arc<icefarm_db::NotifyBus>, bus: Arc<ControlBus>) {
    use icefarm_common::event::{Event, EventKind};
    use icefarm_db::Notification;

    let rx = notify.subscribe();
    while let Ok(notification) = rx.recv() {
        match notification {
            // Reservation creation has no client-visible bus event (the
            // caller already learns the outcome synchronously from the HTTP
            // response); only the terminal transitions are pushed.
            Notification::ReservationGranted { .. } => {}
            Notification::ReservationEnded { .. } => {}
            Notification::ReservationExpired { serial, client_id } => {
                bus.send_to(&client_id, &Event::new(serial, EventKind::ReservationEnd));
            }
            Notification::WorkerLost { serial, client_id } => {
                bus.send_to(&client_id, &Event::new(serial, EventKind::Failure));
            }
            Notification::DeviceAvailable { amount } => {
                bus.broadcast(&Event::new(String::new(), EventKind::DevicesAvailable { amount }));
            }
        }
    }
}
