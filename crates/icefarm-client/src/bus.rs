//! Client half of the event bus (spec.md §4.5). Two connection kinds:
//!
//! - `ControlBusClient` - one socket to control, pushed `reservation ending
//!   soon`/`reservation end`/`failure`/`devices_available` events.
//! - `WorkerBusClient` - one socket per worker this client currently holds a
//!   reservation on, carrying `evaluate`/`request` out and
//!   `initialized`/`results` back.
//!
//! Both mirror the teacher's `SignalWS` shape (`apps/sigchat/src/manager/
//! signal_ws.rs`): a `WebSocket<TcpStream>` behind an `Arc<Mutex<..>>` with
//! a dedicated reader thread. Event handlers are registered by event kind
//! (spec.md §9 "Global event-handler list with insertion-order dispatch")
//! and invoked in insertion order, synchronously on the reader thread.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;

use icefarm_common::event::Event;
use tungstenite::{Message, WebSocket};
use url::Url;

type Socket = Arc<Mutex<WebSocket<TcpStream>>>;

#[derive(serde::Serialize)]
struct Handshake<'a> {
    client_id: &'a str,
}

/// Ordered list of event callbacks, dispatched in registration order
/// (spec.md §9). Each handler receives the full envelope and decides for
/// itself whether it cares about this event's kind; the envelope's strongly
/// typed `EventKind` does the "declared required content fields" work the
/// source did dynamically, so no separate field-list bookkeeping is needed
/// here (contrast `icefarm_worker::device::registry::HandlerRegistry`,
/// which dispatches on loosely typed JSON content maps).
#[derive(Default)]
pub struct EventHandlers {
    handlers: Mutex<Vec<Box<dyn Fn(&Event) + Send + Sync>>>,
}

impl EventHandlers {
    pub fn new() -> Arc<Self> {
        Arc::new(EventHandlers::default())
    }

    pub fn register(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.handlers.lock().expect("event handlers poisoned").push(Box::new(handler));
    }

    fn dispatch(&self, event: &Event) {
        for handler in self.handlers.lock().expect("event handlers poisoned").iter() {
            handler(event);
        }
    }
}

fn connect(addr: &str, client_id: &str) -> std::io::Result<WebSocket<TcpStream>> {
    let stream = TcpStream::connect(addr)?;
    let url = Url::parse(&format!("ws://{addr}/")).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let (mut ws, _response) = tungstenite::client(url, stream).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let handshake = serde_json::to_string(&Handshake { client_id }).expect("handshake always serializes");
    ws.send(Message::Text(handshake)).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok(ws)
}

/// One connection to control's event bus (spec.md §4.5 "one socket per
/// client").
pub struct ControlBusClient {
    socket: Socket,
    handlers: Arc<EventHandlers>,
}

impl ControlBusClient {
    /// Connects, sends the `{client_id}` handshake, and spawns the reader
    /// thread. `handlers` should already carry every callback the caller
    /// wants invoked - registering more after `connect` is safe (the reader
    /// reads the same `Arc`) but races the first few deliveries.
    pub fn connect(addr: &str, client_id: &str, handlers: Arc<EventHandlers>) -> std::io::Result<Arc<Self>> {
        let ws = connect(addr, client_id)?;
        let client = Arc::new(ControlBusClient { socket: Arc::new(Mutex::new(ws)), handlers });
        let reader = client.clone();
        thread::spawn(move || reader.reader_loop());
        Ok(client)
    }

    fn reader_loop(self: Arc<Self>) {
        loop {
            let msg = {
                let mut guard = self.socket.lock().expect("control bus client socket poisoned");
                guard.read()
            };
            match msg {
                Ok(Message::Text(text)) => match Event::from_json(&text) {
                    Ok(event) => self.handlers.dispatch(&event),
                    Err(err) => log::warn!(target: "icefarm_client::bus", "malformed event from control: {err}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
                Err(err) => {
                    log::warn!(target: "icefarm_client::bus", "control bus read error: {err}");
                    break;
                }
            }
        }
        log::info!(target: "icefarm_client::bus", "control bus connection closed");
    }
}

/// One connection to a worker's event bus (spec.md §4.5 "one socket per
/// (client, worker) pair - established by the client only after a
/// reservation assigns it to that worker, and torn down when the client no
/// longer holds any reservation on that worker").
pub struct WorkerBusClient {
    worker: String,
    socket: Socket,
    handlers: Arc<EventHandlers>,
}

impl WorkerBusClient {
    pub fn connect(worker: impl Into<String>, addr: &str, client_id: &str, handlers: Arc<EventHandlers>) -> std::io::Result<Arc<Self>> {
        let ws = connect(addr, client_id)?;
        let client = Arc::new(WorkerBusClient { worker: worker.into(), socket: Arc::new(Mutex::new(ws)), handlers });
        let reader = client.clone();
        thread::spawn(move || reader.reader_loop());
        Ok(client)
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    fn reader_loop(self: Arc<Self>) {
        loop {
            let msg = {
                let mut guard = self.socket.lock().expect("worker bus client socket poisoned");
                guard.read()
            };
            match msg {
                Ok(Message::Text(text)) => match Event::from_json(&text) {
                    Ok(event) => self.handlers.dispatch(&event),
                    Err(err) => log::warn!(target: "icefarm_client::bus", "malformed event from worker {}: {err}", self.worker),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
                Err(err) => {
                    log::warn!(target: "icefarm_client::bus", "worker {} bus read error: {err}", self.worker);
                    break;
                }
            }
        }
        log::info!(target: "icefarm_client::bus", "worker {} bus connection closed", self.worker);
    }

    /// Sends one envelope to this worker (client -> worker half of spec.md
    /// §4.5: `request`/`evaluate`).
    pub fn send(&self, event: &Event) -> std::io::Result<()> {
        let json = event.to_json().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let mut guard = self.socket.lock().expect("worker bus client socket poisoned");
        guard.send(Message::Text(json)).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

/// Manages the set of live worker-bus connections for one client, opening
/// them lazily as reservations land on new workers and implementing
/// `requestBatchWorker` (spec.md §4.5): "groups serials by owning worker and
/// sends one message per worker carrying the full serial set for that
/// group."
pub struct WorkerConnections {
    client_id: String,
    handlers_factory: Arc<dyn Fn() -> Arc<EventHandlers> + Send + Sync>,
    /// bus address -> live connection. Keyed by address rather than worker
    /// name because `reserve`'s connection tuples are the only place this
    /// client learns a worker's identity, and they carry an address, not a
    /// name.
    conns: Mutex<std::collections::HashMap<String, Arc<WorkerBusClient>>>,
    /// serial -> owning worker's bus address.
    owners: Mutex<std::collections::HashMap<String, String>>,
}

impl WorkerConnections {
    pub fn new(client_id: impl Into<String>, handlers_factory: Arc<dyn Fn() -> Arc<EventHandlers> + Send + Sync>) -> Self {
        WorkerConnections {
            client_id: client_id.into(),
            handlers_factory,
            conns: Mutex::new(std::collections::HashMap::new()),
            owners: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Learns the bus address owning each serial from a reserve response,
    /// without opening a connection yet - the socket is only opened the
    /// first time this client actually needs to talk to that worker.
    pub fn record_connections(&self, connections: &[crate::base_client::Connection]) {
        let mut owners = self.owners.lock().expect("worker connections poisoned");
        for conn in connections {
            owners.insert(conn.serial.clone(), format!("{}:{}", conn.ip, conn.serverport));
        }
    }

    fn ensure_connected(&self, addr: &str) -> std::io::Result<Arc<WorkerBusClient>> {
        let mut conns = self.conns.lock().expect("worker connections poisoned");
        if let Some(existing) = conns.get(addr) {
            return Ok(existing.clone());
        }
        let handlers = (self.handlers_factory)();
        let client = WorkerBusClient::connect(addr.to_string(), addr, &self.client_id, handlers)?;
        conns.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// `requestBatchWorker(serials, event, contents)`: groups the given
    /// serials by their owning worker connection and sends one envelope per
    /// worker, each carrying the full serial set routed to it (spec.md §4.5).
    pub fn request_batch(&self, serials: &[String], event_kind: &icefarm_common::event::EventKind) -> std::io::Result<()> {
        for (addr, group) in self.group_by_worker(serials) {
            let conn = self.ensure_connected(&addr)?;
            conn.send(&icefarm_common::event::Event::for_batch(group, event_kind.clone()))?;
        }
        Ok(())
    }

    /// Groups `serials` by the owning address recorded in
    /// `record_connections`. One distinct address == one worker, since a
    /// worker advertises a single bus address and this client never learns
    /// a worker's name independently of the reserve response.
    fn group_by_worker(&self, serials: &[String]) -> Vec<(String, Vec<String>)> {
        let owners = self.owners.lock().expect("worker connections poisoned");
        let mut groups: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
        for serial in serials {
            if let Some(addr) = owners.get(serial) {
                groups.entry(addr.clone()).or_default().push(serial.clone());
            } else {
                log::warn!(target: "icefarm_client::bus", "no known worker connection for serial {serial}, dropping from batch dispatch");
            }
        }
        groups.into_iter().collect()
    }

    /// Tears down a worker connection once this client no longer holds any
    /// reservation there (spec.md §4.5 "torn down when the client no longer
    /// holds any reservation on that worker").
    pub fn release(&self, serial: &str) {
        let addr = self.owners.lock().expect("worker connections poisoned").remove(serial);
        let Some(addr) = addr else { return };
        let still_in_use = self.owners.lock().expect("worker connections poisoned").values().any(|a| a == &addr);
        if !still_in_use {
            self.conns.lock().expect("worker connections poisoned").remove(&addr);
        }
    }
}
