//! `PulseCountClient` (spec.md §8 scenario 1): the user-facing driver for
//! the one shipped `Reservable` kind. Reserves devices, wires up their
//! worker-bus connections, and submits bitstreams as evaluations through
//! the batch scheduler, returning pulse counts.

use std::collections::HashMap;
use std::sync::Arc;

use icefarm_common::model::{Bundle, Evaluation};

use crate::base_client::{BaseClient, ReservationGuard};
use crate::bus::{EventHandlers, WorkerConnections};
use crate::error::ClientError;
use crate::scheduler::{BundleScheduler, ResultTriple, SchedulerPolicy};

pub const KIND: &str = "pulsecount";

/// Matches the worker's `PulseCountState` flush threshold (spec.md §4.2),
/// so a single-device bundle round-trips in one flush rather than waiting
/// on a timer that this crate has no equivalent of.
const DEFAULT_BATCH_SIZE: usize = 4;

/// Ties one reservation to its worker-bus connections and drives
/// pulse-count evaluations over it.
pub struct PulseCountClient {
    guard: ReservationGuard,
    connections: Arc<WorkerConnections>,
    handlers: Arc<EventHandlers>,
    batch_size: usize,
    policy: SchedulerPolicy,
}

impl PulseCountClient {
    /// Reserves `amount` devices of kind `pulsecount` and opens their
    /// worker-bus connections eagerly so `evaluate`/`evaluate_many` never
    /// pay connection setup latency.
    pub fn reserve(client: &Arc<BaseClient>, amount: usize) -> Result<Self, ClientError> {
        let connections = client.reserve(amount, KIND, HashMap::new())?;
        Self::from_connections(client, connections)
    }

    pub fn reserve_specific(client: &Arc<BaseClient>, serials: &[String]) -> Result<Self, ClientError> {
        let connections = client.reserve_specific(serials, KIND, HashMap::new())?;
        Self::from_connections(client, connections)
    }

    fn from_connections(client: &Arc<BaseClient>, reserved: Vec<crate::base_client::Connection>) -> Result<Self, ClientError> {
        let guard = ReservationGuard::from_parts(client.clone(), reserved);
        let handlers = EventHandlers::new();
        let handlers_for_factory = handlers.clone();
        let worker_connections =
            Arc::new(WorkerConnections::new(client.client_id().to_string(), Arc::new(move || handlers_for_factory.clone())));
        worker_connections.record_connections(guard.connections());
        Ok(PulseCountClient {
            guard,
            connections: worker_connections,
            handlers,
            batch_size: DEFAULT_BATCH_SIZE,
            policy: SchedulerPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: SchedulerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn serials(&self) -> Vec<String> {
        self.guard.serials()
    }

    /// Submits one bitstream addressed to every reserved device.
    pub fn evaluate(&self, payload: Vec<u8>) -> Result<Vec<ResultTriple>, ClientError> {
        self.evaluate_many(std::iter::once(payload))
    }

    /// Submits `payloads`, one evaluation per payload, each addressed to
    /// every reserved serial, and blocks until every resulting pulse count
    /// has arrived (spec.md §8 scenario 1: "three results tuples received
    /// in some order... stream terminates cleanly").
    pub fn evaluate_many(&self, payloads: impl IntoIterator<Item = Vec<u8>>) -> Result<Vec<ResultTriple>, ClientError> {
        let serials = self.serials();
        let mut bundle = Bundle::new(serials.clone());
        for (i, payload) in payloads.into_iter().enumerate() {
            bundle.push(Evaluation::new(format!("ev-{i}"), serials.clone(), payload));
        }
        let expected = bundle.evaluations.len() * serials.len().max(1);
        bundle.validate().map_err(ClientError::Malformed)?;

        let scheduler = BundleScheduler::spawn(bundle, self.batch_size, self.policy, self.connections.clone(), self.handlers.clone());

        let mut results = Vec::with_capacity(expected);
        while results.len() < expected {
            match scheduler.next_result() {
                Some(triple) => results.push(triple),
                None => break,
            }
        }
        Ok(results)
    }
}

impl Drop for PulseCountClient {
    fn drop(&mut self) {
        for serial in self.guard.serials() {
            self.connections.release(&serial);
        }
    }
}
