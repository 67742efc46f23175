//! Observer bus: typed events fanned out to registered subscribers.
//!
//! Each subscriber owns a bounded channel; `publish` is a non-blocking
//! try-send on every channel from the notifying thread, so a stalled
//! observer can never wedge a worker stage. Ordering is preserved per
//! subscriber.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::api::BusEvent;

const SUBSCRIBER_DEPTH: usize = 256;

struct Subscriber {
    name: String,
    tx: Sender<BusEvent>,
}

pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> EventBus { EventBus { subscribers: Mutex::new(Vec::new()) } }

    /// Register an observer. The returned receiver must be drained by its
    /// owner; events overflowing the channel are dropped with a log line.
    pub fn subscribe(&self, name: &str) -> Receiver<BusEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_DEPTH);
        self.subscribers.lock().push(Subscriber { name: name.to_owned(), tx });
        rx
    }

    pub fn publish(&self, event: BusEvent) {
        let mut subscribers = self.subscribers.lock();
        // drop subscribers whose receiver side has gone away
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                log::warn!("observer '{}' lagging, dropped {:?}", sub.name, ev);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_preserves_order_per_subscriber() {
        let bus = EventBus::new();
        let a = bus.subscribe("a");
        let b = bus.subscribe("b");
        bus.publish(BusEvent::HardwareFifoReport(1.0));
        bus.publish(BusEvent::HardwareFifoReport(2.0));
        for rx in [&a, &b] {
            match rx.try_recv().unwrap() {
                BusEvent::HardwareFifoReport(v) => assert_eq!(v, 1.0),
                other => panic!("unexpected event {:?}", other),
            }
            match rx.try_recv().unwrap() {
                BusEvent::HardwareFifoReport(v) => assert_eq!(v, 2.0),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn dead_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("short-lived");
        drop(rx);
        bus.publish(BusEvent::StateChanged);
        assert_eq!(bus.subscribers.lock().len(), 0);
    }
}
