use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::core::error::{BrokerError, ErrorCode};
use crate::core::message::QueueId;
use crate::core::registry::QueueRegistry;
use crate::net::{
    ErrorPayload, Frame, FrameType, ItemPayload, MessageHandler, NamePayload, NetError,
};

/// Serves registry operations to remote clients.
#[derive(Debug, Clone)]
pub struct BrokerHandler {
    registry: Arc<QueueRegistry>,
}

impl BrokerHandler {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    fn make_error(&self, correlation_id: u64, code: ErrorCode, message: &str) -> Result<Frame, NetError> {
        let payload = ErrorPayload {
            code: code.into(),
            message: message.to_string(),
        }
        .encode()?;
        Ok(Frame::new(FrameType::Error, correlation_id, payload))
    }

    fn reply(
        &self,
        correlation_id: u64,
        result: Result<Bytes, BrokerError>,
    ) -> Result<Frame, NetError> {
        match result {
            Ok(payload) => Ok(Frame::new(FrameType::Ok, correlation_id, payload)),
            Err(err) => {
                debug!(correlation_id, "request failed: {}", err);
                self.make_error(correlation_id, err.code(), &err.to_string())
            }
        }
    }

    fn bad_request(&self, correlation_id: u64, what: &str) -> Result<Frame, NetError> {
        self.make_error(correlation_id, ErrorCode::BadRequest, what)
    }
}

#[async_trait]
impl MessageHandler for BrokerHandler {
    async fn handle_frame(&self, _conn_id: u64, frame: Frame) -> Result<Frame, NetError> {
        match frame.msg_type {
            FrameType::Create => self.handle_create(frame),
            FrameType::Get => self.handle_get(frame),
            FrameType::Delete => self.handle_delete(frame),
            FrameType::Enqueue => self.handle_enqueue(frame),
            FrameType::Dequeue => self.handle_dequeue(frame),
            FrameType::Ping => Ok(Frame::empty(FrameType::Pong, frame.correlation_id)),
            FrameType::Ok | FrameType::Error | FrameType::Pong => {
                self.bad_request(frame.correlation_id, "unexpected frame type")
            }
        }
    }
}

impl BrokerHandler {
    fn handle_create(&self, frame: Frame) -> Result<Frame, NetError> {
        let request = match NamePayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.bad_request(frame.correlation_id, "invalid CREATE payload"),
        };
        if request.name.is_empty() {
            return self.bad_request(frame.correlation_id, "empty queue name");
        }

        let result = self.registry.create(&request.name).and_then(|id| {
            NamePayload {
                name: id.as_str().to_string(),
            }
            .encode()
            .map_err(|e| BrokerError::Net(e.into()))
        });
        self.reply(frame.correlation_id, result)
    }

    fn handle_get(&self, frame: Frame) -> Result<Frame, NetError> {
        let request = match NamePayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.bad_request(frame.correlation_id, "invalid GET payload"),
        };

        let result = self.registry.get(&request.name).and_then(|id| {
            NamePayload {
                name: id.as_str().to_string(),
            }
            .encode()
            .map_err(|e| BrokerError::Net(e.into()))
        });
        self.reply(frame.correlation_id, result)
    }

    fn handle_delete(&self, frame: Frame) -> Result<Frame, NetError> {
        let request = match NamePayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.bad_request(frame.correlation_id, "invalid DELETE payload"),
        };

        let result = self
            .registry
            .delete(&QueueId::new(request.name))
            .map(|()| Bytes::new());
        self.reply(frame.correlation_id, result)
    }

    fn handle_enqueue(&self, frame: Frame) -> Result<Frame, NetError> {
        let request = match ItemPayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.bad_request(frame.correlation_id, "invalid ENQUEUE payload"),
        };

        let result = self
            .registry
            .enqueue(&QueueId::new(request.queue), request.item)
            .map(|()| Bytes::new());
        self.reply(frame.correlation_id, result)
    }

    fn handle_dequeue(&self, frame: Frame) -> Result<Frame, NetError> {
        let request = match NamePayload::decode(&frame.payload) {
            Ok(p) => p,
            Err(_) => return self.bad_request(frame.correlation_id, "invalid DEQUEUE payload"),
        };

        let id = QueueId::new(request.name);
        let result = match self.registry.dequeue_physical(&id) {
            Ok(Some(item)) => ItemPayload {
                queue: id.as_str().to_string(),
                item,
            }
            .encode()
            .map_err(|e| BrokerError::Net(e.into())),
            Ok(None) => Err(BrokerError::EmptyQueue(id)),
            Err(e) => Err(e),
        };
        self.reply(frame.correlation_id, result)
    }
}
