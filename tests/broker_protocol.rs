mod common;

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use leasemq::core::{BrokerError, ErrorCode, QueueEndpoint, QueueId};
use leasemq::net::{encode_frame, try_decode_frame, ErrorPayload, Frame, FrameType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use common::TestBroker;

struct RawClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl RawClient {
    async fn connect(broker: &TestBroker) -> Self {
        let stream = TcpStream::connect(broker.addr)
            .await
            .expect("failed to connect to server");
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send_frame(&mut self, frame: &Frame) {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf).expect("encode_frame failed");
        self.stream
            .write_all(&buf)
            .await
            .expect("failed to write frame");
    }

    async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = try_decode_frame(&mut self.buf).expect("decode failed") {
                return Some(frame);
            }
            let n = time::timeout(Duration::from_secs(2), self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for frame")
                .ok()?;
            if n == 0 {
                return None;
            }
        }
    }
}

#[tokio::test]
async fn registry_errors_cross_the_wire() {
    let broker = TestBroker::start().await;
    let client = broker.client().await;

    client.ping().await.unwrap();

    let id = client.create("x").await.unwrap();
    assert_eq!(id, QueueId::new("x"));
    assert!(matches!(
        client.create("x").await,
        Err(BrokerError::AlreadyExists(_))
    ));

    assert!(matches!(client.get("y").await, Err(BrokerError::NotFound(_))));
    assert!(matches!(
        client.enqueue(&QueueId::new("y"), Bytes::from_static(b"z")).await,
        Err(BrokerError::NotFound(_))
    ));
    assert!(matches!(
        client.dequeue(&id).await,
        Err(BrokerError::EmptyQueue(_))
    ));

    client.delete(&id).await.unwrap();
    assert!(matches!(client.delete(&id).await, Err(BrokerError::NotFound(_))));
    assert_eq!(client.create("x").await.unwrap(), id);

    broker.stop().await;
}

#[tokio::test]
async fn binary_payloads_keep_fifo_order() {
    let broker = TestBroker::start().await;
    let client = broker.client().await;
    let id = client.create("bin").await.unwrap();

    let items: Vec<Bytes> = (0u8..10)
        .map(|i| Bytes::from(vec![i, 0, 255, b'\n', i]))
        .collect();
    for item in &items {
        client.enqueue(&id, item.clone()).await.unwrap();
    }
    for item in &items {
        assert_eq!(&client.dequeue(&id).await.unwrap(), item);
    }

    broker.stop().await;
}

#[tokio::test]
async fn malformed_payload_gets_bad_request_and_connection_survives() {
    let broker = TestBroker::start().await;
    let mut raw = RawClient::connect(&broker).await;

    raw.send_frame(&Frame::new(FrameType::Create, 7, Bytes::from_static(b"\x00\x09ab")))
        .await;
    let resp = raw.recv_frame().await.expect("connection closed");
    assert_eq!(resp.msg_type, FrameType::Error);
    assert_eq!(resp.correlation_id, 7);
    let err = ErrorPayload::decode(&resp.payload).unwrap();
    assert_eq!(err.code, u16::from(ErrorCode::BadRequest));

    raw.send_frame(&Frame::empty(FrameType::Ping, 8)).await;
    let resp = raw.recv_frame().await.expect("connection closed");
    assert_eq!(resp, Frame::empty(FrameType::Pong, 8));

    broker.stop().await;
}

#[tokio::test]
async fn invalid_header_closes_connection() {
    let broker = TestBroker::start().await;
    let mut raw = RawClient::connect(&broker).await;

    // Declared length shorter than the type byte plus correlation id.
    let mut bogus = BytesMut::new();
    bogus.put_u32(3);
    bogus.put_slice(b"abc");
    raw.stream.write_all(&bogus).await.unwrap();

    assert!(raw.recv_frame().await.is_none());

    // Other connections are unaffected.
    let client = broker.client().await;
    client.ping().await.unwrap();

    broker.stop().await;
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let broker = TestBroker::start().await;
    let mut raw = RawClient::connect(&broker).await;

    for id in 1..=5u64 {
        raw.send_frame(&Frame::empty(FrameType::Ping, id)).await;
    }
    for id in 1..=5u64 {
        let resp = raw.recv_frame().await.expect("connection closed");
        assert_eq!(resp.correlation_id, id);
        assert_eq!(resp.msg_type, FrameType::Pong);
    }

    broker.stop().await;
}
