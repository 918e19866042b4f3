//! Batch scheduler (spec.md §4.6): wraps a `BundleState` behind a policy
//! that decides when the next batch may leave, drains `results`/`failure`
//! events off the worker bus, and exposes a lazy result stream that
//! terminates once the bundle is exhausted and `awaiting_results` is empty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use icefarm_common::event::{Event, EventKind};
use icefarm_common::model::{Batch, Bundle};

use crate::bundle::{BundleState, NextBatch};
use crate::bus::{EventHandlers, WorkerConnections};

/// Governs when the scheduler may emit the next batch, independent of
/// whether the bundle's sub-queues have room (spec.md §4.6).
#[derive(Debug, Clone, Copy)]
pub enum SchedulerPolicy {
    /// Fires every batch as fast as the bundle produces it.
    Quick,
    /// Waits until every dispatched evaluation has a result before emitting
    /// the next batch.
    Patient,
    /// Waits until the worst-case per-serial `ceil(pending/batch_size)`
    /// drops below `target_batches`. Default; keeps each device roughly two
    /// batches deep so upload overlaps execution.
    Balanced(usize),
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        SchedulerPolicy::Balanced(2)
    }
}

impl SchedulerPolicy {
    fn ready(&self, state: &BundleState) -> bool {
        match self {
            SchedulerPolicy::Quick => true,
            SchedulerPolicy::Patient => state.pending_empty(),
            SchedulerPolicy::Balanced(target) => state.max_ceil_batches() < *target,
        }
    }
}

/// One resolved pulse-count result, handed to the caller by the result
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultTriple {
    pub serial: String,
    pub evaluation_id: String,
    pub pulses: u32,
}

enum BusMsg {
    Results { serial: String, results: Vec<(String, u32)> },
    Failure { serials: Vec<String> },
}

/// Drives one `Bundle` to completion: dispatches batches through
/// `WorkerConnections` as the policy allows, and streams results back over a
/// channel as they arrive on the worker bus.
pub struct BundleScheduler {
    results: Receiver<ResultTriple>,
    done: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BundleScheduler {
    /// Spawns the driving thread and registers the bus handler that feeds
    /// it. `handlers` must be the same `EventHandlers` instance the
    /// relevant `WorkerBusClient`s dispatch into - in practice the one
    /// produced by `WorkerConnections`'s handler factory.
    pub fn spawn(
        bundle: Bundle,
        batch_size: usize,
        policy: SchedulerPolicy,
        connections: Arc<WorkerConnections>,
        handlers: Arc<EventHandlers>,
    ) -> Self {
        let (bus_tx, bus_rx) = mpsc::channel::<BusMsg>();
        let (out_tx, out_rx) = mpsc::channel::<ResultTriple>();

        handlers.register(move |event: &Event| match &event.contents {
            EventKind::Results { results, .. } => {
                let _ = bus_tx.send(BusMsg::Results { serial: event.serial.clone(), results: results.clone() });
            }
            EventKind::Failure => {
                let _ = bus_tx.send(BusMsg::Failure { serials: event.target_serials() });
            }
            _ => {}
        });

        let done = Arc::new(AtomicBool::new(false));
        let done_flag = done.clone();
        let handle = thread::spawn(move || {
            run(bundle, batch_size, policy, connections, bus_rx, out_tx);
            done_flag.store(true, Ordering::SeqCst);
        });

        BundleScheduler { results: out_rx, done, handle: Some(handle) }
    }

    /// Blocks for the next result, or returns `None` once the bundle is
    /// exhausted and every dispatched evaluation has resolved (spec.md §4.6
    /// "terminates when the bundle is exhausted and `awaiting_results` is
    /// empty").
    pub fn next_result(&self) -> Option<ResultTriple> {
        self.results.recv().ok()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl Iterator for BundleScheduler {
    type Item = ResultTriple;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result()
    }
}

impl Drop for BundleScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    bundle: Bundle,
    batch_size: usize,
    policy: SchedulerPolicy,
    connections: Arc<WorkerConnections>,
    bus_rx: Receiver<BusMsg>,
    out_tx: Sender<ResultTriple>,
) {
    let mut state = BundleState::new(&bundle, batch_size);
    let mut next_batch_id: u64 = 0;

    loop {
        if state.queues_empty() && state.pending_empty() {
            return;
        }

        if !state.queues_empty() && policy.ready(&state) {
            if let NextBatch::Ready(batch) = state.next_batch() {
                dispatch(&connections, &mut next_batch_id, &batch);
                continue;
            }
        }

        match bus_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(BusMsg::Results { serial, results }) => {
                for (evaluation_id, pulses) in results {
                    state.complete(&serial, &evaluation_id);
                    if out_tx.send(ResultTriple { serial: serial.clone(), evaluation_id, pulses }).is_err() {
                        return;
                    }
                }
            }
            Ok(BusMsg::Failure { serials }) => {
                for serial in serials {
                    state.fail_serial(&serial);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                if state.pending_empty() {
                    return;
                }
            }
        }
    }
}

/// Builds and sends one `evaluate(batch_id, files)` event for `batch`
/// (spec.md §4.5/§4.6), routed to the owning worker(s) via
/// `requestBatchWorker`.
fn dispatch(connections: &Arc<WorkerConnections>, next_batch_id: &mut u64, batch: &Batch) {
    let batch_id = format!("batch-{next_batch_id}");
    *next_batch_id += 1;

    let files: HashMap<String, Vec<u8>> = batch.evaluations.iter().map(|ev| (ev.id.clone(), ev.payload.clone())).collect();
    let serials: Vec<String> = batch.serials.iter().cloned().collect();
    let event_kind = EventKind::Evaluate { batch_id, files };
    if let Err(err) = connections.request_batch(&serials, &event_kind) {
        log::error!(target: "icefarm_client::scheduler", "failed to dispatch batch to {serials:?}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icefarm_common::model::Evaluation;

    fn state_with(batch_size: usize, evals: &[(&str, &[&str])]) -> BundleState {
        let mut serials = std::collections::BTreeSet::new();
        for (_, ser) in evals {
            for s in *ser {
                serials.insert(s.to_string());
            }
        }
        let mut bundle = Bundle::new(serials);
        for (id, ser) in evals {
            bundle.push(Evaluation::new(*id, ser.iter().map(|s| s.to_string()), vec![]));
        }
        BundleState::new(&bundle, batch_size)
    }

    #[test]
    fn quick_is_always_ready() {
        let state = state_with(2, &[("a0", &["A"])]);
        assert!(SchedulerPolicy::Quick.ready(&state));
    }

    #[test]
    fn patient_waits_for_pending_to_drain() {
        let mut state = state_with(4, &[("a0", &["A"]), ("a1", &["A"])]);
        assert!(SchedulerPolicy::Patient.ready(&state));
        let batch = match state.next_batch() {
            NextBatch::Ready(b) => b,
            other => panic!("{other:?}"),
        };
        assert!(!SchedulerPolicy::Patient.ready(&state));
        state.complete("A", &batch.evaluations[0].id);
        state.complete("A", &batch.evaluations[1].id);
        assert!(SchedulerPolicy::Patient.ready(&state));
    }

    #[test]
    fn balanced_tracks_ceil_pending_over_batch_size() {
        let mut state = state_with(2, &[("a0", &["A"]), ("a1", &["A"])]);
        // nothing pending yet: 0 batches deep, ready for target=1.
        assert!(SchedulerPolicy::Balanced(1).ready(&state));
        state.next_batch();
        // 2 pending / batch_size 2 = 1 batch deep, not below target=1.
        assert!(!SchedulerPolicy::Balanced(1).ready(&state));
        assert!(SchedulerPolicy::Balanced(2).ready(&state));
    }
}
