//! The request surface a broker exposes for named queues.
//!
//! [`QueueEndpoint`] is what the delivery coordinator talks to. The in-process
//! [`QueueRegistry`] implements it directly; `broker::BrokerClient` implements
//! it over TCP, reporting the same error kinds.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::error::BrokerError;
use crate::core::message::QueueId;
use crate::core::registry::QueueRegistry;

#[async_trait]
pub trait QueueEndpoint: Send + Sync + 'static {
    async fn create(&self, name: &str) -> Result<QueueId, BrokerError>;

    async fn get(&self, name: &str) -> Result<QueueId, BrokerError>;

    async fn delete(&self, id: &QueueId) -> Result<(), BrokerError>;

    async fn enqueue(&self, id: &QueueId, payload: Bytes) -> Result<(), BrokerError>;

    /// Irrevocably remove the oldest payload; `EmptyQueue` when there is none.
    async fn dequeue(&self, id: &QueueId) -> Result<Bytes, BrokerError>;
}

#[async_trait]
impl QueueEndpoint for QueueRegistry {
    async fn create(&self, name: &str) -> Result<QueueId, BrokerError> {
        QueueRegistry::create(self, name)
    }

    async fn get(&self, name: &str) -> Result<QueueId, BrokerError> {
        QueueRegistry::get(self, name)
    }

    async fn delete(&self, id: &QueueId) -> Result<(), BrokerError> {
        QueueRegistry::delete(self, id)
    }

    async fn enqueue(&self, id: &QueueId, payload: Bytes) -> Result<(), BrokerError> {
        QueueRegistry::enqueue(self, id, payload)
    }

    async fn dequeue(&self, id: &QueueId) -> Result<Bytes, BrokerError> {
        self.dequeue_physical(id)?
            .ok_or_else(|| BrokerError::EmptyQueue(id.clone()))
    }
}

#[async_trait]
impl<T> QueueEndpoint for Arc<T>
where
    T: QueueEndpoint + ?Sized,
{
    async fn create(&self, name: &str) -> Result<QueueId, BrokerError> {
        (**self).create(name).await
    }

    async fn get(&self, name: &str) -> Result<QueueId, BrokerError> {
        (**self).get(name).await
    }

    async fn delete(&self, id: &QueueId) -> Result<(), BrokerError> {
        (**self).delete(id).await
    }

    async fn enqueue(&self, id: &QueueId, payload: Bytes) -> Result<(), BrokerError> {
        (**self).enqueue(id, payload).await
    }

    async fn dequeue(&self, id: &QueueId) -> Result<Bytes, BrokerError> {
        (**self).dequeue(id).await
    }
}
