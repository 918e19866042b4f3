//! Emulates the two logical notification channels of spec.md §4.4/§6:
//! `reservation_updates(serial, client_id)` and `device_available(amount)`.
//!
//! A real Postgres-backed deployment would use `LISTEN`/`NOTIFY`; sqlite has
//! no equivalent, so each stored routine that commits a reservation mutation
//! publishes directly to an in-process broadcast registry right after the
//! commit. For a single-control-process deployment (the only topology this
//! workspace builds - see spec.md Non-goals on multi-site federation) this
//! is observationally identical to a database-level notification: every
//! subscriber still only learns of the change after it is durable.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

/// Payload carried over either logical channel. Kept as one enum/one
/// registry rather than two, since every current subscriber (the control
/// event bus fan-out) wants both.
///
/// Split into one variant per *reason* a reservation row changed, rather
/// than one generic "updated" variant carrying an optional client id: the
/// engine must react differently to a client-requested end (no event; the
/// caller already knows), a lease expiry (`reservation end` to the prior
/// owner), and a worker loss (`failure` to the prior owner) - and by the
/// time a subscriber observes the notification the row is already gone, so
/// the reason can't be recovered from another query. Each variant carries
/// the client id that *was* assigned to `serial` before the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A fresh reservation was created (`make_reservations`/`reserve_specific`).
    ReservationGranted { serial: String, client_id: String },
    /// The owning client explicitly ended the reservation (`end`/`end_all`).
    ReservationEnded { serial: String, client_id: String },
    /// The reservation's lease passed its deadline unextended.
    ReservationExpired { serial: String, client_id: String },
    /// The hosting worker's heartbeat went stale, or it exited; `serial` had
    /// an active reservation at the time.
    WorkerLost { serial: String, client_id: String },
    /// `amount` additional devices became `available`.
    DeviceAvailable { amount: u32 },
}

#[derive(Default)]
pub struct NotifyBus {
    subscribers: Mutex<Vec<Sender<Notification>>>,
}

impl NotifyBus {
    pub fn new() -> Self {
        NotifyBus::default()
    }

    /// Registers a new subscriber. Dropping the returned `Receiver` is the
    /// only way to unsubscribe; stale senders are pruned lazily on publish.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.subscribers.lock().expect("notify bus poisoned").push(tx);
        rx
    }

    pub fn publish(&self, notification: Notification) {
        let mut subs = self.subscribers.lock().expect("notify bus poisoned");
        subs.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_to_all_live_subscribers_and_prunes_dropped_ones() {
        let bus = NotifyBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        drop(rx2);

        bus.publish(Notification::DeviceAvailable { amount: 2 });
        assert_eq!(rx1.recv().unwrap(), Notification::DeviceAvailable { amount: 2 });

        // the dropped subscriber should have been pruned, not just silently
        // failed to receive.
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }
}
