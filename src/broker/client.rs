use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::core::endpoint::QueueEndpoint;
use crate::core::error::BrokerError;
use crate::core::message::QueueId;
use crate::net::{
    encode_frame, try_decode_frame, ErrorPayload, Frame, FrameType, ItemPayload, NamePayload,
    NetError,
};

const INITIAL_BUFFER_SIZE: usize = 8 * 1024;

struct ClientConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl ClientConnection {
    async fn flush(&mut self) -> Result<(), NetError> {
        while !self.write_buf.is_empty() {
            let n = self.stream.write(&self.write_buf).await?;
            if n == 0 {
                return Err(NetError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write frame",
                )));
            }
            self.write_buf.advance(n);
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self, correlation_id: u64) -> Result<Frame, BrokerError> {
        loop {
            while let Some(frame) = try_decode_frame(&mut self.read_buf).map_err(NetError::from)? {
                if frame.correlation_id == correlation_id {
                    return Ok(frame);
                }
                // Left over from a request whose caller gave up waiting.
                warn!(
                    expected = correlation_id,
                    got = frame.correlation_id,
                    "discarding stale response"
                );
            }

            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(NetError::from)?;
            if n == 0 {
                return Err(BrokerError::ConnectionClosed);
            }
        }
    }
}

struct ClientInner {
    conn: Mutex<ClientConnection>,
    next_correlation_id: AtomicU64,
}

impl ClientInner {
    async fn request(&self, msg_type: FrameType, payload: Bytes) -> Result<Frame, BrokerError> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(msg_type, correlation_id, payload);

        let mut conn = self.conn.lock().await;
        encode_frame(&frame, &mut conn.write_buf).map_err(NetError::from)?;
        conn.flush().await?;
        conn.read_response(correlation_id).await
    }

    /// Send a request about `queue` and return the payload of its `Ok` reply.
    async fn call(
        &self,
        queue: &QueueId,
        msg_type: FrameType,
        payload: Bytes,
    ) -> Result<Bytes, BrokerError> {
        let response = self.request(msg_type, payload).await?;
        match response.msg_type {
            FrameType::Ok => Ok(response.payload),
            FrameType::Error => {
                let err = ErrorPayload::decode(&response.payload).map_err(NetError::from)?;
                Err(BrokerError::from_remote(queue, err.code, err.message))
            }
            other => Err(BrokerError::Remote {
                code: 500,
                message: format!("unexpected reply type {:?}", other),
            }),
        }
    }

    async fn call_with_name(
        &self,
        queue: &QueueId,
        msg_type: FrameType,
    ) -> Result<Bytes, BrokerError> {
        let payload = NamePayload {
            name: queue.as_str().to_string(),
        }
        .encode()
        .map_err(NetError::from)?;
        self.call(queue, msg_type, payload).await
    }

    async fn enqueue(&self, id: &QueueId, payload: Bytes) -> Result<(), BrokerError> {
        let request = ItemPayload {
            queue: id.as_str().to_string(),
            item: payload,
        }
        .encode()
        .map_err(NetError::from)?;
        self.call(id, FrameType::Enqueue, request).await?;
        Ok(())
    }

    async fn dequeue(&self, id: &QueueId) -> Result<Bytes, BrokerError> {
        let reply = self.call_with_name(id, FrameType::Dequeue).await?;
        let item = ItemPayload::decode(&reply).map_err(NetError::from)?;
        if item.queue != id.as_str() {
            return Err(BrokerError::QueueIdMismatch {
                requested: id.clone(),
                received: QueueId::new(item.queue),
            });
        }
        Ok(item.item)
    }

    /// Push back a payload the broker handed out but nobody is waiting for.
    async fn return_abandoned(&self, queue: &QueueId, item: Bytes) {
        warn!(%queue, "dequeue abandoned by its caller; returning payload to queue");
        if let Err(e) = self.enqueue(queue, item).await {
            error!(%queue, "failed to return abandoned payload: {}", e);
        }
    }
}

/// Caller side of a dequeue that runs in its own task.
///
/// Dropped before the reply is taken, it hands the payload back to the queue.
/// Closing the channel first means exactly one of this guard or the task sees
/// the payload.
struct PendingDequeue {
    queue: QueueId,
    inner: Arc<ClientInner>,
    rx: oneshot::Receiver<Result<Bytes, BrokerError>>,
    taken: bool,
}

impl Drop for PendingDequeue {
    fn drop(&mut self) {
        if self.taken {
            return;
        }
        self.rx.close();
        if let Ok(Ok(item)) = self.rx.try_recv() {
            let inner = Arc::clone(&self.inner);
            let queue = self.queue.clone();
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { inner.return_abandoned(&queue, item).await });
                }
                Err(_) => {
                    error!(%queue, "no runtime to return abandoned payload; dropping it");
                }
            }
        }
    }
}

/// Remote [`QueueEndpoint`] speaking the broker's framed protocol.
///
/// One request is in flight at a time; concurrent callers queue on the
/// connection lock. Dequeues run to completion even if the caller goes away,
/// so an item the broker already removed is never silently lost.
pub struct BrokerClient {
    peer: SocketAddr,
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect(addr).await.map_err(NetError::from)?;
        stream.set_nodelay(true).map_err(NetError::from)?;
        let peer = stream.peer_addr().map_err(NetError::from)?;
        debug!("connected to broker at {}", peer);

        Ok(Self {
            peer,
            inner: Arc::new(ClientInner {
                conn: Mutex::new(ClientConnection {
                    stream,
                    read_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
                    write_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
                }),
                next_correlation_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Round-trip a `Ping` frame.
    pub async fn ping(&self) -> Result<(), BrokerError> {
        let response = self.inner.request(FrameType::Ping, Bytes::new()).await?;
        match response.msg_type {
            FrameType::Pong => Ok(()),
            other => Err(BrokerError::Remote {
                code: 500,
                message: format!("unexpected reply to ping: {:?}", other),
            }),
        }
    }
}

#[async_trait]
impl QueueEndpoint for BrokerClient {
    async fn create(&self, name: &str) -> Result<QueueId, BrokerError> {
        let id = QueueId::new(name);
        let reply = self.inner.call_with_name(&id, FrameType::Create).await?;
        let created = NamePayload::decode(&reply).map_err(NetError::from)?;
        Ok(QueueId::new(created.name))
    }

    async fn get(&self, name: &str) -> Result<QueueId, BrokerError> {
        let id = QueueId::new(name);
        let reply = self.inner.call_with_name(&id, FrameType::Get).await?;
        let found = NamePayload::decode(&reply).map_err(NetError::from)?;
        Ok(QueueId::new(found.name))
    }

    async fn delete(&self, id: &QueueId) -> Result<(), BrokerError> {
        self.inner.call_with_name(id, FrameType::Delete).await?;
        Ok(())
    }

    async fn enqueue(&self, id: &QueueId, payload: Bytes) -> Result<(), BrokerError> {
        self.inner.enqueue(id, payload).await
    }

    async fn dequeue(&self, id: &QueueId) -> Result<Bytes, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let queue = id.clone();
        tokio::spawn(async move {
            let result = inner.dequeue(&queue).await;
            if let Err(Ok(item)) = tx.send(result) {
                inner.return_abandoned(&queue, item).await;
            }
        });

        let mut pending = PendingDequeue {
            queue: id.clone(),
            inner: Arc::clone(&self.inner),
            rx,
            taken: false,
        };
        let outcome = (&mut pending.rx).await;
        pending.taken = true;
        outcome.unwrap_or(Err(BrokerError::ConnectionClosed))
    }
}
