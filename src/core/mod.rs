pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod lockfree;
pub mod message;
pub mod registry;

pub use delivery::{DeliveryConfig, DeliveryCoordinator};
pub use endpoint::QueueEndpoint;
pub use error::{BrokerError, ErrorCode};
pub use lockfree::ConcurrentQueue;
pub use message::{Delivery, EntityId, LeaseKey, QueueId};
pub use registry::QueueRegistry;
