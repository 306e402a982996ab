//! Output fan-out from the shell readers to active invocations.
//!
//! The registry maps an invocation id to the sending half of a bounded
//! channel. Entries exist only while an invocation is in flight. Delivery
//! never blocks the reader: a full channel drops the line and logs it.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

/// An item delivered to an invocation's output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// One line of command output, newline included
    Line(String),
    /// A reader failure the invocation should surface in its output
    ReaderError(String),
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

impl Delivery {
    /// No invocation was listening.
    pub fn is_discarded(&self) -> bool {
        self.delivered == 0 && self.dropped == 0
    }
}

/// Concurrent map of invocation id -> output channel.
#[derive(Debug)]
pub struct OutputRegistry {
    channels: DashMap<String, mpsc::Sender<OutputEvent>>,
    capacity: usize,
}

impl OutputRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Create a channel for `id`, replacing any previous one.
    pub fn register(&self, id: &str) -> mpsc::Receiver<OutputEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.channels.insert(id.to_string(), tx).is_some() {
            warn!(invocation_id = %id, "replaced existing output channel");
        }
        rx
    }

    /// Remove the channel for `id`. Returns whether one was registered.
    pub fn unregister(&self, id: &str) -> bool {
        self.channels.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Send `event` to every registered channel without waiting.
    pub fn broadcast(&self, event: OutputEvent) -> Delivery {
        let mut delivery = Delivery::default();

        for entry in self.channels.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    delivery.dropped += 1;
                    warn!(invocation_id = %entry.key(), "output channel full, dropping line");
                }
                Err(TrySendError::Closed(_)) => {
                    delivery.dropped += 1;
                    debug!(invocation_id = %entry.key(), "output channel closed, dropping line");
                }
            }
        }

        if delivery.is_discarded() {
            trace!(?event, "no active invocation, discarding output");
        }
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod registration {
        use super::*;

        #[test]
        fn test_register_and_unregister() {
            let registry = OutputRegistry::new(8);
            let _rx = registry.register("inv-1");
            assert_eq!(registry.len(), 1);

            assert!(registry.unregister("inv-1"));
            assert!(registry.is_empty());
        }

        #[test]
        fn test_unregister_unknown_id() {
            let registry = OutputRegistry::new(8);
            assert!(!registry.unregister("missing"));
        }

        #[test]
        fn test_register_twice_replaces_channel() {
            let registry = OutputRegistry::new(8);
            let _first = registry.register("inv-1");
            let mut second = registry.register("inv-1");
            assert_eq!(registry.len(), 1);

            registry.broadcast(OutputEvent::Line("x\n".into()));
            assert_eq!(second.try_recv().unwrap(), OutputEvent::Line("x\n".into()));
        }

        #[test]
        fn test_zero_capacity_is_raised_to_one() {
            let registry = OutputRegistry::new(0);
            let mut rx = registry.register("inv-1");
            let delivery = registry.broadcast(OutputEvent::Line("a\n".into()));
            assert_eq!(delivery.delivered, 1);
            assert!(rx.try_recv().is_ok());
        }
    }

    mod broadcasting {
        use super::*;

        #[test]
        fn test_no_listeners_discards() {
            let registry = OutputRegistry::new(8);
            let delivery = registry.broadcast(OutputEvent::Line("lost\n".into()));
            assert!(delivery.is_discarded());
        }

        #[test]
        fn test_delivers_to_every_channel() {
            let registry = OutputRegistry::new(8);
            let mut a = registry.register("a");
            let mut b = registry.register("b");

            let delivery = registry.broadcast(OutputEvent::Line("both\n".into()));
            assert_eq!(delivery.delivered, 2);
            assert_eq!(a.try_recv().unwrap(), OutputEvent::Line("both\n".into()));
            assert_eq!(b.try_recv().unwrap(), OutputEvent::Line("both\n".into()));
        }

        #[test]
        fn test_full_channel_drops_without_blocking() {
            let registry = OutputRegistry::new(1);
            let mut rx = registry.register("slow");

            assert_eq!(registry.broadcast(OutputEvent::Line("1\n".into())).delivered, 1);
            let second = registry.broadcast(OutputEvent::Line("2\n".into()));
            assert_eq!(second.dropped, 1);
            assert!(!second.is_discarded());

            assert_eq!(rx.try_recv().unwrap(), OutputEvent::Line("1\n".into()));
            assert!(rx.try_recv().is_err());
        }

        #[test]
        fn test_closed_receiver_counts_as_dropped() {
            let registry = OutputRegistry::new(4);
            drop(registry.register("gone"));
            let delivery = registry.broadcast(OutputEvent::ReaderError("boom".into()));
            assert_eq!(delivery.dropped, 1);
        }
    }
}
