//! Base client (spec.md §4.5/§4.6): the reservation HTTP verbs and the
//! scoped `ReservationGuard` helper (DESIGN NOTES §9 "Context-manager
//! reservation", supplemented from `original_source/src/icefarm/client/lib/
//! utils.py`'s `reserved_devices` context manager). `ureq`-based, matching
//! the teacher's request helpers in `apps/mtxchat/src/web.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::ClientError;

/// One reserved device, as returned by `/reserve`/`/reservespecific`
/// (spec.md §6): the worker's event bus address this client must dial to
/// send `evaluate` batches and receive `results`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Connection {
    pub serial: String,
    pub ip: String,
    pub serverport: u16,
}

/// Woken by the control bus's `devices_available` push (spec.md §5
/// "Availability waiter blocks on `devices_available` events"). A plain
/// counter behind a condvar rather than carrying the `amount` payload,
/// since a waiter only needs to know "something changed, go look again".
#[derive(Clone)]
pub struct AvailabilityWaiter {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl AvailabilityWaiter {
    pub fn new() -> Self {
        AvailabilityWaiter { inner: Arc::new((Mutex::new(0), Condvar::new())) }
    }

    /// Called from the control bus's `devices_available` handler.
    pub fn notify(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().expect("availability waiter poisoned") += 1;
        cvar.notify_all();
    }

    /// Blocks up to `timeout` for a notification. Returns `false` on
    /// timeout so the caller can re-check its own deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().expect("availability waiter poisoned");
        let (_guard, result) = cvar.wait_timeout(guard, timeout).expect("availability waiter poisoned");
        !result.timed_out()
    }
}

impl Default for AvailabilityWaiter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BaseClient {
    control_url: Url,
    client_id: String,
}

impl BaseClient {
    pub fn new(control_url: &str, client_id: impl Into<String>) -> Result<Arc<Self>, url::ParseError> {
        Ok(Arc::new(BaseClient { control_url: Url::parse(control_url)?, client_id: client_id.into() }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.control_url.clone();
        url.set_path(path);
        url
    }

    /// `reserve(amount, kind, args)` (spec.md §4.4/§6). Never errors on a
    /// partial fill - control "atomically selects up to `amount`" and hands
    /// back whatever it found; the caller decides whether fewer devices than
    /// requested is acceptable (see `reserve_blocking`).
    pub fn reserve(&self, amount: usize, kind: &str, args: HashMap<String, Value>) -> Result<Vec<Connection>, ClientError> {
        let body = serde_json::json!({ "amount": amount, "name": self.client_id, "kind": kind, "args": args });
        let response = ureq::post(self.url("/reserve").as_str()).send_json(body)?;
        Ok(response.into_json()?)
    }

    pub fn reserve_specific(&self, serials: &[String], kind: &str, args: HashMap<String, Value>) -> Result<Vec<Connection>, ClientError> {
        let body = serde_json::json!({ "serials": serials, "name": self.client_id, "kind": kind, "args": args });
        let response = ureq::post(self.url("/reservespecific").as_str()).send_json(body)?;
        Ok(response.into_json()?)
    }

    /// `reserve` with the `available_timeout`/`wait_for_available` policy of
    /// spec.md §5: if fewer than `amount` devices come back and
    /// `wait_for_available` is set, blocks on `waiter` (driven by the control
    /// bus's `devices_available` events) and retries for the remainder until
    /// `amount` is satisfied or `available_timeout` elapses.
    pub fn reserve_blocking(
        &self,
        amount: usize,
        kind: &str,
        args: HashMap<String, Value>,
        wait_for_available: bool,
        available_timeout: Option<Duration>,
        waiter: Option<&AvailabilityWaiter>,
    ) -> Result<Vec<Connection>, ClientError> {
        let mut got = self.reserve(amount, kind, args.clone())?;
        if !wait_for_available || got.len() >= amount {
            if got.len() < amount {
                return Err(ClientError::Capacity { requested: amount, available: got.len() });
            }
            return Ok(got);
        }

        let deadline = available_timeout.map(|t| Instant::now() + t);
        let poll_interval = Duration::from_millis(500);
        while got.len() < amount {
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    return Err(ClientError::AvailabilityTimeout);
                }
            }
            let wait_for = deadline.map(|dl| dl.saturating_duration_since(Instant::now())).unwrap_or(poll_interval).min(poll_interval);
            match waiter {
                Some(w) => {
                    w.wait_timeout(wait_for);
                }
                None => std::thread::sleep(wait_for),
            }
            let remaining = amount - got.len();
            let mut more = self.reserve(remaining, kind, args.clone())?;
            got.append(&mut more);
        }
        Ok(got)
    }

    pub fn extend(&self, serials: &[String]) -> Result<Vec<String>, ClientError> {
        let body = serde_json::json!({ "name": self.client_id, "serials": serials });
        let response = ureq::post(self.url("/extend").as_str()).send_json(body)?;
        Ok(response.into_json()?)
    }

    pub fn extend_all(&self) -> Result<Vec<String>, ClientError> {
        let body = serde_json::json!({ "name": self.client_id });
        let response = ureq::post(self.url("/extendall").as_str()).send_json(body)?;
        Ok(response.into_json()?)
    }

    /// Idempotent (spec.md §7): ending an already-ended reservation is a
    /// no-op that returns an empty set, never an error.
    pub fn end(&self, serials: &[String]) -> Result<Vec<String>, ClientError> {
        let body = serde_json::json!({ "name": self.client_id, "serials": serials });
        let response = ureq::post(self.url("/end").as_str()).send_json(body)?;
        Ok(response.into_json()?)
    }

    pub fn end_all(&self) -> Result<Vec<String>, ClientError> {
        let body = serde_json::json!({ "name": self.client_id });
        let response = ureq::post(self.url("/endall").as_str()).send_json(body)?;
        Ok(response.into_json()?)
    }

    pub fn available(&self) -> Result<u32, ClientError> {
        #[derive(Deserialize)]
        struct AvailableResponse {
            amount: u32,
        }
        let response = ureq::post(self.url("/available").as_str()).call()?;
        let parsed: AvailableResponse = response.into_json()?;
        Ok(parsed.amount)
    }

    /// Scoped acquisition (DESIGN NOTES §9): reserves on entry, guarantees
    /// `end` on every exit path via `Drop`, mirroring
    /// `original_source/src/icefarm/client/lib/utils.py`'s `with reserve(...)
    /// as devices:` helper.
    pub fn with_reservation(
        self: &Arc<Self>,
        amount: usize,
        kind: &str,
        args: HashMap<String, Value>,
    ) -> Result<ReservationGuard, ClientError> {
        let connections = self.reserve(amount, kind, args)?;
        Ok(ReservationGuard { client: self.clone(), connections })
    }
}

/// Releases its reservation unconditionally on drop, including when the
/// owning scope unwinds via panic (spec.md §9 "Context-manager
/// reservation").
pub struct ReservationGuard {
    client: Arc<BaseClient>,
    connections: Vec<Connection>,
}

impl ReservationGuard {
    /// Wraps an already-reserved connection set (e.g. from
    /// `reserve_specific`, which has no scoped-acquisition helper of its
    /// own) so callers elsewhere in this crate get the same `Drop`-based
    /// release as `with_reservation`.
    pub(crate) fn from_parts(client: Arc<BaseClient>, connections: Vec<Connection>) -> Self {
        ReservationGuard { client, connections }
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn serials(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.serial.clone()).collect()
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.connections.is_empty() {
            return;
        }
        let serials = self.serials();
        if let Err(err) = self.client.end(&serials) {
            log::warn!(target: "icefarm_client::base_client", "failed to release reservation on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_waiter_wakes_on_notify() {
        let waiter = AvailabilityWaiter::new();
        let w2 = waiter.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            w2.notify();
        });
        let woke = waiter.wait_timeout(Duration::from_secs(2));
        assert!(woke);
        handle.join().unwrap();
    }

    #[test]
    fn availability_waiter_times_out_without_notify() {
        let waiter = AvailabilityWaiter::new();
        let woke = waiter.wait_timeout(Duration::from_millis(20));
        assert!(!woke);
    }
}
