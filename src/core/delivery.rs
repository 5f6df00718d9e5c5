//! Visibility-timeout delivery on top of a [`QueueEndpoint`].
//!
//! A `read` physically dequeues an item and opens a lease on it. The lease is
//! finalized exactly once, by whichever of these wins a CAS on its state:
//! - `ack` (Armed → Acked): timer disarmed, lease removed
//! - timer expiry (Armed → Fired): payload re-enqueued at the tail
//! - `release_all` (Armed → Fired): same as expiry, but immediate
//!
//! A fired lease stays in the table for `expired_retention` so a late `ack`
//! reports `LeaseExpired` rather than `NoSuchLease`.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::core::endpoint::QueueEndpoint;
use crate::core::error::BrokerError;
use crate::core::message::{Delivery, EntityId, LeaseKey, QueueId};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// How long a fired lease is remembered so late acks see `LeaseExpired`.
    pub expired_retention: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            expired_retention: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum LeaseState {
    Armed = 0,
    Fired = 1,
    Acked = 2,
}

impl LeaseState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LeaseState::Armed,
            1 => LeaseState::Fired,
            _ => LeaseState::Acked,
        }
    }
}

#[derive(Debug)]
struct Lease {
    key: LeaseKey,
    payload: Bytes,
    state: AtomicU8,
    timer: Mutex<Option<AbortHandle>>,
}

impl Lease {
    fn new(key: LeaseKey, payload: Bytes) -> Self {
        Self {
            key,
            payload,
            state: AtomicU8::new(LeaseState::Armed as u8),
            timer: Mutex::new(None),
        }
    }

    /// Move Armed → `to`. On failure returns the state some other party set.
    fn claim(&self, to: LeaseState) -> Result<(), LeaseState> {
        self.state
            .compare_exchange(
                LeaseState::Armed as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(LeaseState::from_u8)
    }

    fn state(&self) -> LeaseState {
        LeaseState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attach the timer task. An ack that slipped in first cancels it on the
    /// spot; a fired timer is left to finish its retention sleep.
    fn arm(&self, handle: AbortHandle) {
        let mut timer = self.timer.lock();
        match self.state() {
            LeaseState::Acked => handle.abort(),
            LeaseState::Armed => *timer = Some(handle),
            LeaseState::Fired => {}
        }
    }

    fn disarm(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

struct Shared<E> {
    endpoint: E,
    leases: DashMap<LeaseKey, Arc<Lease>>,
    next_entity_id: AtomicU64,
    config: DeliveryConfig,
}

/// Client-side at-least-once delivery with per-item visibility timeouts.
///
/// Cloning is cheap and every clone shares the same lease table.
pub struct DeliveryCoordinator<E: QueueEndpoint> {
    shared: Arc<Shared<E>>,
}

impl<E: QueueEndpoint> Clone for DeliveryCoordinator<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: QueueEndpoint> DeliveryCoordinator<E> {
    pub fn new(endpoint: E) -> Self {
        Self::with_config(endpoint, DeliveryConfig::default())
    }

    pub fn with_config(endpoint: E, config: DeliveryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                leases: DashMap::new(),
                next_entity_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.shared.endpoint
    }

    pub async fn create_queue(&self, name: &str) -> Result<QueueId, BrokerError> {
        self.shared.endpoint.create(name).await
    }

    pub async fn get_queue(&self, name: &str) -> Result<QueueId, BrokerError> {
        self.shared.endpoint.get(name).await
    }

    /// Leases still open against `id` are left alone; their re-enqueue is
    /// dropped with a warning if they expire after the queue is gone.
    pub async fn delete_queue(&self, id: &QueueId) -> Result<(), BrokerError> {
        self.shared.endpoint.delete(id).await
    }

    pub async fn enqueue(
        &self,
        id: &QueueId,
        payload: impl Into<Bytes>,
    ) -> Result<(), BrokerError> {
        self.shared.endpoint.enqueue(id, payload.into()).await
    }

    /// Dequeue one item and hold it under a lease for `timeout`.
    ///
    /// If the lease is not acked in time, the payload is pushed back onto the
    /// tail of `id` and a later `read` sees it again under a new entity id.
    #[tracing::instrument(skip(self, id), fields(queue = %id))]
    pub async fn read(&self, id: &QueueId, timeout: Duration) -> Result<Delivery, BrokerError> {
        if timeout.is_zero() {
            return Err(BrokerError::InvalidTimeout(timeout));
        }

        let payload = self.shared.endpoint.dequeue(id).await?;

        let entity_id = EntityId::from_raw(self.shared.next_entity_id.fetch_add(1, Ordering::Relaxed));
        let key = LeaseKey::new(id.clone(), entity_id);
        let lease = Arc::new(Lease::new(key.clone(), payload.clone()));

        let inserted = match self.shared.leases.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&lease));
                true
            }
        };

        if !inserted {
            error!(%entity_id, "entity id already leased; returning payload to queue");
            self.shared.endpoint.enqueue(id, payload).await?;
            return Err(BrokerError::DuplicateLease {
                queue: id.clone(),
                entity_id,
            });
        }

        let handle = tokio::spawn(expire(
            Arc::clone(&self.shared),
            Arc::clone(&lease),
            timeout,
        ));
        lease.arm(handle.abort_handle());

        debug!(%entity_id, ?timeout, "lease opened");
        Ok(Delivery {
            queue: id.clone(),
            entity_id,
            payload,
        })
    }

    /// Acknowledge a read, permanently removing the item.
    ///
    /// Fails with `NoSuchLease` if the pair was never read or is already
    /// finalized, and with `LeaseExpired` if the timeout won the race.
    pub fn ack(&self, id: &QueueId, entity_id: EntityId) -> Result<(), BrokerError> {
        let key = LeaseKey::new(id.clone(), entity_id);
        let lease = self
            .shared
            .leases
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::NoSuchLease {
                queue: id.clone(),
                entity_id,
            })?;

        match lease.claim(LeaseState::Acked) {
            Ok(()) => {
                lease.disarm();
                self.shared
                    .leases
                    .remove_if(&key, |_, held| Arc::ptr_eq(held, &lease));
                debug!(lease = %key, "lease acked");
                Ok(())
            }
            Err(LeaseState::Fired) => Err(BrokerError::LeaseExpired {
                queue: id.clone(),
                entity_id,
            }),
            Err(_) => Err(BrokerError::NoSuchLease {
                queue: id.clone(),
                entity_id,
            }),
        }
    }

    /// Leases that are still armed.
    pub fn outstanding_leases(&self) -> usize {
        self.shared
            .leases
            .iter()
            .filter(|entry| entry.value().state() == LeaseState::Armed)
            .count()
    }

    /// Give every armed lease back to its queue now. Returns how many were released.
    pub async fn release_all(&self) -> usize {
        let armed: Vec<Arc<Lease>> = self
            .shared
            .leases
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut released = 0;
        for lease in armed {
            if lease.claim(LeaseState::Fired).is_err() {
                continue;
            }
            lease.disarm();
            requeue(&self.shared, &lease).await;
            self.shared
                .leases
                .remove_if(&lease.key, |_, held| Arc::ptr_eq(held, &lease));
            released += 1;
        }

        if released > 0 {
            info!(released, "released outstanding leases");
        }
        released
    }
}

/// Timer body for one lease.
async fn expire<E: QueueEndpoint>(shared: Arc<Shared<E>>, lease: Arc<Lease>, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    if lease.claim(LeaseState::Fired).is_err() {
        return;
    }

    info!(lease = %lease.key, "visibility timeout expired; re-enqueueing");
    requeue(&shared, &lease).await;

    let retention = shared.config.expired_retention;
    if !retention.is_zero() {
        tokio::time::sleep(retention).await;
    }
    shared
        .leases
        .remove_if(&lease.key, |_, held| Arc::ptr_eq(held, &lease));
}

async fn requeue<E: QueueEndpoint>(shared: &Shared<E>, lease: &Lease) {
    match shared
        .endpoint
        .enqueue(&lease.key.queue, lease.payload.clone())
        .await
    {
        Ok(()) => {}
        Err(BrokerError::NotFound(queue)) => {
            warn!(lease = %lease.key, %queue, "queue deleted while leased; dropping payload");
        }
        Err(e) => {
            error!(lease = %lease.key, "re-enqueue failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::QueueRegistry;

    fn coordinator() -> (Arc<QueueRegistry>, DeliveryCoordinator<Arc<QueueRegistry>>) {
        let registry = Arc::new(QueueRegistry::new());
        let coordinator = DeliveryCoordinator::new(Arc::clone(&registry));
        (registry, coordinator)
    }

    #[test]
    fn lease_claim_has_single_winner() {
        let key = LeaseKey::new(QueueId::new("q"), EntityId::from_raw(1));
        let lease = Lease::new(key, Bytes::new());
        assert_eq!(lease.state(), LeaseState::Armed);

        assert!(lease.claim(LeaseState::Acked).is_ok());
        assert_eq!(lease.claim(LeaseState::Fired), Err(LeaseState::Acked));
        assert_eq!(lease.state(), LeaseState::Acked);
    }

    #[tokio::test]
    async fn read_then_ack_empties_queue() {
        let (_registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "hello").await.unwrap();

        let delivery = coord.read(&q, Duration::from_secs(2)).await.unwrap();
        assert_eq!(delivery.entity_id, EntityId::from_raw(1));
        assert_eq!(delivery.payload, Bytes::from_static(b"hello"));
        assert_eq!(coord.outstanding_leases(), 1);

        coord.ack(&q, delivery.entity_id).unwrap();
        assert_eq!(coord.outstanding_leases(), 0);

        assert!(matches!(
            coord.read(&q, Duration::from_secs(2)).await,
            Err(BrokerError::EmptyQueue(_))
        ));
    }

    #[tokio::test]
    async fn second_ack_is_no_such_lease() {
        let (_registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "x").await.unwrap();

        let delivery = coord.read(&q, Duration::from_secs(5)).await.unwrap();
        coord.ack(&q, delivery.entity_id).unwrap();
        assert!(matches!(
            coord.ack(&q, delivery.entity_id),
            Err(BrokerError::NoSuchLease { .. })
        ));
    }

    #[tokio::test]
    async fn ack_without_read_is_no_such_lease() {
        let (_registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "x").await.unwrap();

        assert!(matches!(
            coord.ack(&q, EntityId::from_raw(0)),
            Err(BrokerError::NoSuchLease { .. })
        ));
    }

    #[tokio::test]
    async fn entity_ids_are_never_reused() {
        let (_registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        for i in 0..10 {
            coord.enqueue(&q, format!("item-{i}")).await.unwrap();
        }

        let mut last = 0;
        for _ in 0..10 {
            let d = coord.read(&q, Duration::from_secs(5)).await.unwrap();
            assert!(d.entity_id.value() > last);
            last = d.entity_id.value();
            coord.ack(&q, d.entity_id).unwrap();
        }
    }

    #[tokio::test]
    async fn zero_timeout_rejected_without_dequeue() {
        let (registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "keep").await.unwrap();

        assert!(matches!(
            coord.read(&q, Duration::ZERO).await,
            Err(BrokerError::InvalidTimeout(_))
        ));
        assert_eq!(registry.depth(&q).unwrap(), 1);
    }

    #[tokio::test]
    async fn read_unknown_queue_is_not_found() {
        let (_registry, coord) = coordinator();
        assert!(matches!(
            coord.read(&QueueId::new("ghost"), Duration::from_secs(1)).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_redelivers_and_late_ack_sees_expired() {
        let (_registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "P").await.unwrap();

        let first = coord.read(&q, Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let second = coord.read(&q, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"P"));
        assert_ne!(second.entity_id, first.entity_id);

        assert!(matches!(
            coord.ack(&q, first.entity_id),
            Err(BrokerError::LeaseExpired { .. })
        ));
        coord.ack(&q, second.entity_id).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_marker_is_purged_after_retention() {
        let registry = Arc::new(QueueRegistry::new());
        let coord = DeliveryCoordinator::with_config(
            Arc::clone(&registry),
            DeliveryConfig {
                expired_retention: Duration::from_secs(10),
            },
        );
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "P").await.unwrap();

        let first = coord.read(&q, Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert!(matches!(
            coord.ack(&q, first.entity_id),
            Err(BrokerError::NoSuchLease { .. })
        ));
        assert_eq!(registry.depth(&q).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acked_lease_never_fires() {
        let (registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "once").await.unwrap();

        let d = coord.read(&q, Duration::from_millis(500)).await.unwrap();
        coord.ack(&q, d.entity_id).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.depth(&q).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_after_delete_drops_payload() {
        let (registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "orphan").await.unwrap();

        let _d = coord.read(&q, Duration::from_secs(1)).await.unwrap();
        coord.delete_queue(&q).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(registry.is_empty());
        assert_eq!(coord.outstanding_leases(), 0);
    }

    #[tokio::test]
    async fn release_all_returns_items() {
        let (registry, coord) = coordinator();
        let q = coord.create_queue("q").await.unwrap();
        coord.enqueue(&q, "a").await.unwrap();
        coord.enqueue(&q, "b").await.unwrap();

        let a = coord.read(&q, Duration::from_secs(60)).await.unwrap();
        let _b = coord.read(&q, Duration::from_secs(60)).await.unwrap();
        assert_eq!(registry.depth(&q).unwrap(), 0);

        assert_eq!(coord.release_all().await, 2);
        assert_eq!(registry.depth(&q).unwrap(), 2);
        assert_eq!(coord.outstanding_leases(), 0);
        assert!(coord.ack(&q, a.entity_id).is_err());
    }
}
