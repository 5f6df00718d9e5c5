use std::time::Duration;

use thiserror::Error;

use crate::core::message::{EntityId, QueueId};
use crate::net::NetError;

/// Status codes carried in `Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    BadRequest = 400,
    NotFound = 404,
    AlreadyExists = 409,
    EmptyQueue = 410,
    Internal = 500,
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            400 => Some(ErrorCode::BadRequest),
            404 => Some(ErrorCode::NotFound),
            409 => Some(ErrorCode::AlreadyExists),
            410 => Some(ErrorCode::EmptyQueue),
            500 => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code as u16
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue {0:?} already exists")]
    AlreadyExists(QueueId),

    #[error("queue {0:?} does not exist")]
    NotFound(QueueId),

    #[error("queue {0:?} is empty")]
    EmptyQueue(QueueId),

    #[error("no lease {entity_id} on queue {queue:?}")]
    NoSuchLease { queue: QueueId, entity_id: EntityId },

    #[error("lease {entity_id} on queue {queue:?} already expired")]
    LeaseExpired { queue: QueueId, entity_id: EntityId },

    #[error("lease {entity_id} on queue {queue:?} is already held")]
    DuplicateLease { queue: QueueId, entity_id: EntityId },

    #[error("visibility timeout must be positive, got {0:?}")]
    InvalidTimeout(Duration),

    #[error("mismatched queue ids: requested {requested:?}, got {received:?}")]
    QueueIdMismatch { requested: QueueId, received: QueueId },

    #[error("broker replied {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("connection closed by broker")]
    ConnectionClosed,

    #[error(transparent)]
    Net(#[from] NetError),
}

impl BrokerError {
    /// Wire code used when this error is reported to a remote client.
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            BrokerError::NotFound(_) => ErrorCode::NotFound,
            BrokerError::EmptyQueue(_) => ErrorCode::EmptyQueue,
            BrokerError::InvalidTimeout(_) => ErrorCode::BadRequest,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuild the typed error a broker reported for a request on `queue`.
    pub fn from_remote(queue: &QueueId, code: u16, message: String) -> Self {
        match ErrorCode::from_u16(code) {
            Some(ErrorCode::NotFound) => BrokerError::NotFound(queue.clone()),
            Some(ErrorCode::AlreadyExists) => BrokerError::AlreadyExists(queue.clone()),
            Some(ErrorCode::EmptyQueue) => BrokerError::EmptyQueue(queue.clone()),
            _ => BrokerError::Remote { code, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_map_back_to_typed_errors() {
        let q = QueueId::new("jobs");
        for err in [
            BrokerError::NotFound(q.clone()),
            BrokerError::AlreadyExists(q.clone()),
            BrokerError::EmptyQueue(q.clone()),
        ] {
            let rebuilt = BrokerError::from_remote(&q, err.code().into(), err.to_string());
            assert_eq!(rebuilt.code(), err.code());
        }

        let other = BrokerError::from_remote(&q, 400, "bad frame".into());
        assert!(matches!(other, BrokerError::Remote { code: 400, .. }));
    }
}
