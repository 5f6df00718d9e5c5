use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::broker::handler::BrokerHandler;
use crate::config::Config;
use crate::core::registry::QueueRegistry;
use crate::net::{NetError, NetworkConfig, Server};

/// Bind the address from `config` and serve a fresh registry until
/// `shutdown` flips to `true`.
pub async fn start_broker(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let network = config.network_config()?;
    tracing::info!("broker starting on {}", network.bind_addr);

    let registry = Arc::new(QueueRegistry::new());
    let server = Server::new(network, BrokerHandler::new(registry), shutdown);
    server.start().await?;

    tracing::info!("broker stopped");
    Ok(())
}

/// Serve `registry` on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<QueueRegistry>,
    shutdown_grace: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<(), NetError> {
    let network = NetworkConfig {
        bind_addr: listener.local_addr()?,
        shutdown_grace,
    };
    let server = Server::new(network, BrokerHandler::new(registry), shutdown);
    server.run(listener).await
}
