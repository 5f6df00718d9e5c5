use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::core::error::BrokerError;
use crate::core::lockfree::ConcurrentQueue;
use crate::core::message::QueueId;

/// [`QueueRegistry`] maps queue names to their lock-free queues.
///
/// DashMap only guards the name directory. Pushes and pops run on a cloned
/// `Arc` after the map guard is dropped, so queues never serialize on it.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: DashMap<QueueId, Arc<ConcurrentQueue<Bytes>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Register a new empty queue under `name`.
    pub fn create(&self, name: &str) -> Result<QueueId, BrokerError> {
        let id = QueueId::new(name);
        match self.queues.entry(id.clone()) {
            Entry::Occupied(_) => Err(BrokerError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                info!("creating queue {:?}", name);
                slot.insert(Arc::new(ConcurrentQueue::new()));
                Ok(id)
            }
        }
    }

    /// Resolve `name` to its id if the queue exists.
    pub fn get(&self, name: &str) -> Result<QueueId, BrokerError> {
        if self.queues.contains_key(name) {
            Ok(QueueId::new(name))
        } else {
            Err(BrokerError::NotFound(QueueId::new(name)))
        }
    }

    /// Remove the queue. Items still queued are dropped with it.
    pub fn delete(&self, id: &QueueId) -> Result<(), BrokerError> {
        match self.queues.remove(id) {
            Some(_) => {
                info!("deleting queue {:?}", id.as_str());
                Ok(())
            }
            None => Err(BrokerError::NotFound(id.clone())),
        }
    }

    pub fn enqueue(&self, id: &QueueId, payload: Bytes) -> Result<(), BrokerError> {
        let queue = self.queue(id)?;
        debug!(queue = %id, bytes = payload.len(), "enqueue");
        queue.push(payload);
        Ok(())
    }

    /// Pop the oldest payload. `Ok(None)` means the queue exists but is empty.
    pub fn dequeue_physical(&self, id: &QueueId) -> Result<Option<Bytes>, BrokerError> {
        let queue = self.queue(id)?;
        let payload = queue.pop();
        if let Some(p) = &payload {
            debug!(queue = %id, bytes = p.len(), "dequeue");
        }
        Ok(payload)
    }

    /// Approximate depth of one queue.
    pub fn depth(&self, id: &QueueId) -> Result<usize, BrokerError> {
        Ok(self.queue(id)?.len())
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn names(&self) -> Vec<QueueId> {
        let mut names: Vec<QueueId> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn queue(&self, id: &QueueId) -> Result<Arc<ConcurrentQueue<Bytes>>, BrokerError> {
        self.queues
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::NotFound(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn create_twice_fails_then_recreate_after_delete() {
        let registry = QueueRegistry::new();
        let id = registry.create("x").unwrap();
        assert_eq!(id.as_str(), "x");

        assert!(matches!(
            registry.create("x"),
            Err(BrokerError::AlreadyExists(ref q)) if q.as_str() == "x"
        ));

        registry.delete(&id).unwrap();
        assert!(registry.create("x").is_ok());
    }

    #[test]
    fn get_and_delete_unknown_queue() {
        let registry = QueueRegistry::new();
        assert!(matches!(registry.get("nope"), Err(BrokerError::NotFound(_))));
        assert!(matches!(
            registry.delete(&QueueId::new("nope")),
            Err(BrokerError::NotFound(_))
        ));

        registry.create("yes").unwrap();
        assert_eq!(registry.get("yes").unwrap(), QueueId::new("yes"));
    }

    #[test]
    fn enqueue_dequeue_delegate_to_queue() {
        let registry = QueueRegistry::new();
        let id = registry.create("q").unwrap();

        registry.enqueue(&id, Bytes::from_static(b"a")).unwrap();
        registry.enqueue(&id, Bytes::from_static(b"b")).unwrap();
        assert_eq!(registry.depth(&id).unwrap(), 2);

        assert_eq!(registry.dequeue_physical(&id).unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(registry.dequeue_physical(&id).unwrap(), Some(Bytes::from_static(b"b")));
        assert_eq!(registry.dequeue_physical(&id).unwrap(), None);

        let missing = QueueId::new("missing");
        assert!(registry.enqueue(&missing, Bytes::new()).is_err());
        assert!(registry.dequeue_physical(&missing).is_err());
    }

    #[test]
    fn concurrent_create_has_single_winner() {
        let registry = Arc::new(QueueRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.create("contended").is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.names(), vec![QueueId::new("contended")]);
    }
}
