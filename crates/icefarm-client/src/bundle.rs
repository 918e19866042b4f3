//! Batch construction (spec.md §4.6 steps 1-4): turns a `Bundle`'s
//! evaluations into `Batch`es, keeping every device under its per-batch
//! in-flight cap.
//!
//! Resolves two of spec.md §9's Open Questions: the iterator's sort key is
//! "cardinality of the serial-set, ascending" (not a literal `len` function
//! passed where a key was expected), and `processResult`'s `-=` on a set
//! bug is implemented as "remove the evaluation id from the pending set for
//! that serial, and drop the serial's entry once its set is empty" - which
//! this module's `pending` map already does double duty for: it is both the
//! per-device in-flight cap (`slots` below) and the scheduler's
//! `awaiting_results` bookkeeping (spec.md §4.6), since both track the exact
//! same set of "evaluation ids not yet resolved for this serial".

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use icefarm_common::model::{Batch, Bundle, Evaluation};

/// Result of one call to `BundleState::next_batch`.
#[derive(Debug)]
pub enum NextBatch {
    /// A non-empty batch ready for dispatch.
    Ready(Batch),
    /// Evaluations remain queued, but every serial-set with room is empty
    /// and every non-empty one is at its cap; try again once a result frees
    /// up room.
    Blocked,
    /// No evaluations remain queued anywhere. Combine with
    /// `BundleState::pending_empty` to know whether the whole bundle is
    /// done (spec.md §4.6 "terminates when the bundle is exhausted *and*
    /// `awaiting_results` is empty").
    Exhausted,
}

/// Mutable scheduling state derived from one `Bundle`: per-serial-set FIFO
/// queues plus the shared pending/`awaiting_results` map.
pub struct BundleState {
    queues: Vec<(BTreeSet<String>, VecDeque<Evaluation>)>,
    pending: HashMap<String, HashSet<String>>,
    batch_size: usize,
}

impl BundleState {
    pub fn new(bundle: &Bundle, batch_size: usize) -> Self {
        let mut by_set: Vec<(BTreeSet<String>, VecDeque<Evaluation>)> = Vec::new();
        for evaluation in &bundle.evaluations {
            match by_set.iter_mut().find(|(set, _)| set == &evaluation.serials) {
                Some((_, queue)) => queue.push_back(evaluation.clone()),
                None => {
                    let mut queue = VecDeque::new();
                    queue.push_back(evaluation.clone());
                    by_set.push((evaluation.serials.clone(), queue));
                }
            }
        }
        BundleState { queues: by_set, pending: HashMap::new(), batch_size }
    }

    /// Step 1-4 of spec.md §4.6: examines the serial-set sub-queues smallest
    /// scope first, takes the first one with spare capacity, dequeues up to
    /// its slot budget, and updates `pending`.
    pub fn next_batch(&mut self) -> NextBatch {
        let mut order: Vec<usize> = (0..self.queues.len()).filter(|&i| !self.queues[i].1.is_empty()).collect();
        if order.is_empty() {
            return NextBatch::Exhausted;
        }
        order.sort_by_key(|&i| self.queues[i].0.len());

        for i in order {
            let serials = self.queues[i].0.clone();
            let max_pending = serials.iter().map(|s| self.pending.get(s).map_or(0, HashSet::len)).max().unwrap_or(0);
            let slots = self.batch_size.saturating_sub(max_pending);
            if slots == 0 {
                continue;
            }

            let mut taken = Vec::new();
            while taken.len() < slots {
                match self.queues[i].1.pop_front() {
                    Some(ev) => taken.push(ev),
                    None => break,
                }
            }
            if taken.is_empty() {
                continue;
            }

            for serial in &serials {
                let set = self.pending.entry(serial.clone()).or_default();
                for ev in &taken {
                    set.insert(ev.id.clone());
                }
            }
            return NextBatch::Ready(Batch { serials, evaluations: taken });
        }
        NextBatch::Blocked
    }

    /// Resolves the Open Question bug fix: removes `evaluation_id` from
    /// `serial`'s pending set, dropping the serial's entry entirely once
    /// empty so `pending_empty`/`max_ceil_batches` don't carry dead keys.
    pub fn complete(&mut self, serial: &str, evaluation_id: &str) {
        if let Some(set) = self.pending.get_mut(serial) {
            set.remove(evaluation_id);
            if set.is_empty() {
                self.pending.remove(serial);
            }
        }
    }

    /// Drops every pending evaluation for `serial` without a result
    /// (spec.md §8 "in which case `failure(serial)` is observed and the
    /// result is absent"): the device has failed, nothing more will ever
    /// arrive for it.
    pub fn fail_serial(&mut self, serial: &str) -> Vec<String> {
        self.pending.remove(serial).map(|set| set.into_iter().collect()).unwrap_or_default()
    }

    pub fn queues_empty(&self) -> bool {
        self.queues.iter().all(|(_, q)| q.is_empty())
    }

    pub fn pending_empty(&self) -> bool {
        self.pending.values().all(|s| s.is_empty())
    }

    pub fn pending_for(&self, serial: &str) -> usize {
        self.pending.get(serial).map_or(0, HashSet::len)
    }

    /// `max(ceil(pending[s] / batch_size))` over every serial with pending
    /// work (spec.md §4.6 Balanced policy).
    pub fn max_ceil_batches(&self) -> usize {
        self.pending
            .values()
            .map(|set| set.len().div_ceil(self.batch_size.max(1)))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(id: &str, serials: &[&str]) -> Evaluation {
        Evaluation::new(id, serials.iter().map(|s| s.to_string()), vec![])
    }

    #[test]
    fn smallest_scope_with_room_goes_first() {
        let mut bundle = Bundle::new(["A".to_string(), "B".to_string()]);
        for i in 0..3 {
            bundle.push(eval(&format!("a{i}"), &["A"]));
        }
        for i in 0..3 {
            bundle.push(eval(&format!("ab{i}"), &["A", "B"]));
        }
        let mut state = BundleState::new(&bundle, 2);

        let batch = match state.next_batch() {
            NextBatch::Ready(b) => b,
            other => panic!("expected a batch, got {other:?}"),
        };
        // {A} has cardinality 1 < {A,B}'s 2, so it is examined first and has
        // room (slots = 2 - 0); it takes the whole round.
        assert_eq!(batch.serials, BTreeSet::from(["A".to_string()]));
        assert_eq!(batch.evaluations.len(), 2);

        // A is now at its cap (pending=2, batch_size=2), so the {A,B} group
        // has no room this round either.
        match state.next_batch() {
            NextBatch::Blocked => {}
            other => panic!("expected Blocked once A is saturated, got {other:?}"),
        }
    }

    #[test]
    fn never_mixes_two_serial_sets_in_one_batch() {
        let mut bundle = Bundle::new(["A".to_string(), "B".to_string()]);
        bundle.push(eval("a0", &["A"]));
        bundle.push(eval("ab0", &["A", "B"]));
        let mut state = BundleState::new(&bundle, 4);

        let batch = match state.next_batch() {
            NextBatch::Ready(b) => b,
            other => panic!("expected a batch, got {other:?}"),
        };
        assert!(batch.serials == BTreeSet::from(["A".to_string()]) || batch.serials == BTreeSet::from(["A".to_string(), "B".to_string()]));
    }

    #[test]
    fn completion_frees_a_slot_for_the_next_round() {
        let mut bundle = Bundle::new(["A".to_string()]);
        for i in 0..4 {
            bundle.push(eval(&format!("a{i}"), &["A"]));
        }
        let mut state = BundleState::new(&bundle, 2);

        let first = match state.next_batch() {
            NextBatch::Ready(b) => b,
            other => panic!("{other:?}"),
        };
        assert_eq!(first.evaluations.len(), 2);
        assert!(matches!(state.next_batch(), NextBatch::Blocked));

        state.complete("A", &first.evaluations[0].id);
        let second = match state.next_batch() {
            NextBatch::Ready(b) => b,
            other => panic!("{other:?}"),
        };
        assert_eq!(second.evaluations.len(), 1);
    }

    #[test]
    fn exhausted_once_every_queue_is_drained() {
        let mut bundle = Bundle::new(["A".to_string()]);
        bundle.push(eval("a0", &["A"]));
        let mut state = BundleState::new(&bundle, 4);
        assert!(matches!(state.next_batch(), NextBatch::Ready(_)));
        assert!(matches!(state.next_batch(), NextBatch::Exhausted));
    }

    #[test]
    fn fail_serial_drains_its_pending_set() {
        let mut bundle = Bundle::new(["A".to_string()]);
        bundle.push(eval("a0", &["A"]));
        bundle.push(eval("a1", &["A"]));
        let mut state = BundleState::new(&bundle, 4);
        let batch = match state.next_batch() {
            NextBatch::Ready(b) => b,
            other => panic!("{other:?}"),
        };
        assert_eq!(batch.evaluations.len(), 2);
        let dropped = state.fail_serial("A");
        assert_eq!(dropped.len(), 2);
        assert!(state.pending_empty());
    }
}
