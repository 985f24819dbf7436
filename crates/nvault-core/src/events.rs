//! Storage notifications
//!
//! The control platform reacts to storage lifecycle moments — a level
//! clear must shut dependents down first, an integrity failure must lock
//! the machine up rather than corrupt play state. The core stays decoupled
//! from the platform event bus by emitting through this narrow hub;
//! collaborators subscribe plain callbacks.

use parking_lot::RwLock;

use crate::block::PersistenceLevel;

/// A storage lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// A level-wide clear is about to start
    Clearing(PersistenceLevel),
    /// A level-wide clear finished
    Cleared(PersistenceLevel),
    /// A transaction completed; `committed` is false on rollback or failure
    TransactionCompleted { committed: bool },
    /// Integrity verification found corruption
    IntegrityCheckFailed { detail: String },
}

type Sink = Box<dyn Fn(&StorageEvent) + Send + Sync>;

/// Synchronous fan-out of storage events to registered subscribers.
#[derive(Default)]
pub struct EventHub {
    sinks: RwLock<Vec<Sink>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber. Callbacks run on the emitting thread, so they
    /// must not call back into the storage layer's write paths.
    pub fn subscribe<F>(&self, sink: F)
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        self.sinks.write().push(Box::new(sink));
    }

    pub fn emit(&self, event: &StorageEvent) {
        for sink in self.sinks.read().iter() {
            sink(event);
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.sinks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            hub.subscribe(move |event| seen.lock().push(event.clone()));
        }

        hub.emit(&StorageEvent::Clearing(PersistenceLevel::Critical));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| *e == StorageEvent::Clearing(PersistenceLevel::Critical)));
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let hub = EventHub::new();
        hub.emit(&StorageEvent::TransactionCompleted { committed: true });
    }
}
