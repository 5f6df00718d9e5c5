#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Once};
use std::time::Duration;

use leasemq::broker::{serve, BrokerClient};
use leasemq::core::QueueRegistry;
use leasemq::net::NetError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = leasemq::logging::init_logging();
    });
}

/// A broker serving on an ephemeral loopback port.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub registry: Arc<QueueRegistry>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), NetError>>,
}

impl TestBroker {
    pub async fn start() -> Self {
        init_logging();

        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .expect("bind ephemeral failed");
        let addr = listener.local_addr().expect("local addr");

        let registry = Arc::new(QueueRegistry::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(
            listener,
            Arc::clone(&registry),
            Duration::from_millis(500),
            shutdown_rx,
        ));

        Self {
            addr,
            registry,
            shutdown,
            task,
        }
    }

    pub async fn client(&self) -> BrokerClient {
        BrokerClient::connect(self.addr)
            .await
            .expect("failed to connect to broker")
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("broker did not stop in time")
            .expect("broker task panicked")
            .expect("broker returned an error");
    }
}
