//! CLI client for a LeaseMQ broker.
//!
//! One-shot queue administration, enqueue and read commands, plus a small
//! load generator that pushes random payloads through read/ack cycles.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{info, warn};

use leasemq::broker::BrokerClient;
use leasemq::core::{BrokerError, DeliveryCoordinator, QueueId};
use leasemq::Config;

/// Command-line interface for LeaseMQ.
#[derive(Debug, Parser)]
#[command(
    name = "leasemq-cli",
    version,
    about = "LeaseMQ CLI: queue admin, enqueue/read and load generation"
)]
pub struct Cli {
    /// Address of the LeaseMQ broker (defaults to the configured bind address)
    #[arg(short, long)]
    pub addr: Option<SocketAddr>,

    /// Path to config TOML (env LEASEMQ_CONFIG is used when omitted)
    #[arg(long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Supported CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a queue
    Create { queue: String },

    /// Check that a queue exists
    Get { queue: String },

    /// Delete a queue
    Delete { queue: String },

    /// Enqueue a message
    Enqueue {
        queue: String,
        /// Message payload (enclose in quotes for spaces)
        message: String,
    },

    /// Read one message and acknowledge it
    Read {
        queue: String,
        /// Visibility timeout in milliseconds (defaults to the configured one)
        #[arg(short, long)]
        timeout_ms: Option<u64>,
        /// Hand the message back to the queue instead of acknowledging it
        #[arg(long)]
        release: bool,
    },

    /// Randomly interleave enqueues and read+ack pairs against a queue
    Load {
        queue: String,
        /// Total operations across all workers
        #[arg(short, long, default_value_t = 10_000)]
        count: usize,
        /// Payload size in bytes
        #[arg(short, long, default_value_t = 64)]
        size: usize,
        /// Concurrent worker connections
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leasemq::logging::init_logging()?;

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    let addr = match cli.addr {
        Some(addr) => addr,
        None => cfg.socket_addr()?,
    };
    let client = BrokerClient::connect(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", addr, e))?;
    let coordinator = DeliveryCoordinator::with_config(client, cfg.delivery_config());

    match cli.command {
        Command::Create { queue } => {
            let id = coordinator.create_queue(&queue).await?;
            println!("created {id}");
        }
        Command::Get { queue } => {
            let id = coordinator.get_queue(&queue).await?;
            println!("found {id}");
        }
        Command::Delete { queue } => {
            coordinator.delete_queue(&QueueId::new(queue.as_str())).await?;
            println!("deleted {queue}");
        }
        Command::Enqueue { queue, message } => {
            coordinator.enqueue(&QueueId::new(queue), message).await?;
            println!("ok");
        }
        Command::Read {
            queue,
            timeout_ms,
            release,
        } => {
            let id = QueueId::new(queue);
            let delivery = coordinator
                .read(&id, cfg.read_timeout(timeout_ms))
                .await?;
            println!(
                "{}#{} {}",
                delivery.queue,
                delivery.entity_id,
                String::from_utf8_lossy(&delivery.payload)
            );
            if release {
                coordinator.release_all().await;
            } else {
                coordinator.ack(&id, delivery.entity_id)?;
            }
        }
        Command::Load {
            queue,
            count,
            size,
            workers,
        } => {
            let load = LoadPlan {
                addr,
                queue: QueueId::new(queue),
                count,
                size,
                workers,
            };
            run_load(&cfg, &coordinator, load).await?;
        }
    }

    Ok(())
}

#[derive(Debug, Default)]
struct LoadStats {
    enqueued: AtomicUsize,
    acked: AtomicUsize,
    empty: AtomicUsize,
    failed: AtomicUsize,
}

struct LoadPlan {
    addr: SocketAddr,
    queue: QueueId,
    count: usize,
    size: usize,
    workers: usize,
}

async fn run_load(
    cfg: &Config,
    admin: &DeliveryCoordinator<BrokerClient>,
    plan: LoadPlan,
) -> anyhow::Result<()> {
    let LoadPlan {
        addr,
        queue,
        count,
        size,
        workers,
    } = plan;
    match admin.create_queue(queue.as_str()).await {
        Ok(_) | Err(BrokerError::AlreadyExists(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let workers = workers.max(1);
    let stats = Arc::new(LoadStats::default());
    let read_timeout = cfg.visibility_timeout();
    let delivery_config = cfg.delivery_config();
    let started = Instant::now();

    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        let ops = count / workers + usize::from(worker < count % workers);
        let queue = queue.clone();
        let stats = Arc::clone(&stats);
        let delivery_config = delivery_config.clone();
        tasks.spawn(async move {
            let client = BrokerClient::connect(addr).await?;
            let coord = DeliveryCoordinator::with_config(client, delivery_config);
            let mut payload = vec![0u8; size];

            for _ in 0..ops {
                let enqueue = {
                    let mut rng = rand::thread_rng();
                    rng.fill(&mut payload[..]);
                    rng.gen_bool(0.5)
                };

                if enqueue {
                    match coord.enqueue(&queue, payload.clone()).await {
                        Ok(()) => {
                            stats.enqueued.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(worker, "enqueue failed: {}", e);
                        }
                    }
                    continue;
                }

                let result = match coord.read(&queue, read_timeout).await {
                    Ok(delivery) => coord.ack(&queue, delivery.entity_id),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        stats.acked.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(BrokerError::EmptyQueue(_)) => {
                        stats.empty.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(worker, "read/ack failed: {}", e);
                    }
                }
            }

            coord.release_all().await;
            Ok::<_, BrokerError>(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined? {
            warn!("worker failed: {}", e);
        }
    }

    let elapsed = started.elapsed();
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    info!(?elapsed, "load finished");
    println!(
        "{count} ops x {size}B with {workers} worker(s) in {:.3}s ({:.0} ops/s): \
         enqueued {}, acked {}, empty {}, failed {}",
        secs,
        count as f64 / secs,
        stats.enqueued.load(Ordering::Relaxed),
        stats.acked.load(Ordering::Relaxed),
        stats.empty.load(Ordering::Relaxed),
        stats.failed.load(Ordering::Relaxed),
    );
    Ok(())
}
