use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::net::connection::Connection;
use crate::net::error::NetError;
use crate::net::frame::Frame;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub bind_addr: SocketAddr,
    /// How long open connections get to finish after shutdown is signalled.
    pub shutdown_grace: Duration,
}

/// Turns one request frame into its response frame.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_frame(&self, conn_id: u64, frame: Frame) -> Result<Frame, NetError>;
}

pub struct Server<H>
where
    H: MessageHandler + Clone,
{
    config: NetworkConfig,
    handler: H,
    shutdown: watch::Receiver<bool>,
}

impl<H> Server<H>
where
    H: MessageHandler + Clone,
{
    pub fn new(config: NetworkConfig, handler: H, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            handler,
            shutdown,
        }
    }

    /// Bind `config.bind_addr` and run the accept loop until shutdown.
    pub async fn start(&self) -> Result<(), NetError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run(listener).await
    }

    /// Run the accept loop on an already bound listener until a shutdown
    /// signal is received, then wait for open connections to drain.
    pub async fn run(&self, listener: TcpListener) -> Result<(), NetError> {
        let local_addr = listener.local_addr()?;
        let span = tracing::info_span!("net_server", bind_addr = %local_addr);
        self.accept_loop(listener).instrument(span).await
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), NetError> {
        info!("leasemq listening on {}", listener.local_addr()?);

        let mut next_conn_id: u64 = 1;
        let mut shutdown_rx = self.shutdown.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let conn_id = next_conn_id;
                            next_conn_id = next_conn_id.wrapping_add(1);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("set_nodelay failed for {}: {}", addr, e);
                            }
                            debug!("accepted connection {} from {}", conn_id, addr);

                            let connection = Connection::new(
                                conn_id,
                                stream,
                                self.handler.clone(),
                                shutdown_rx.clone(),
                            );
                            connections.spawn(connection.run());
                        }
                        Err(err) => {
                            error!("accept error: {}", err);
                        }
                    }
                }
                // Reap finished connections so the set does not grow unbounded.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                result = shutdown_rx.changed() => {
                    match result {
                        Ok(_) => info!("shutdown signal received; stopping accept loop"),
                        Err(_) => info!("shutdown sender dropped; stopping accept loop"),
                    }
                    break;
                }
            }
        }

        drop(listener);
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!(
                remaining = connections.len(),
                "connections still open after grace period; aborting"
            );
            connections.abort_all();
        }

        Ok(())
    }
}
