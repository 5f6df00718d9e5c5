//! leasemq – one binary that can start the broker *or* act as an
//! interactive client shell.
//
//  $ leasemq start --config leasemq.toml
//  $ leasemq connect 127.0.0.1:4242
//  > create jobs
//  > enq jobs hello
//  > read jobs 5000
//  jobs#1 hello
//  > ack jobs 1
use leasemq::broker::BrokerClient;
use leasemq::core::{DeliveryCoordinator, EntityId, QueueId};
use leasemq::{start_broker, Config};

use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};

use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(name = "leasemq", version, about = "LeaseMQ broker & shell")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon.
    Start {
        /// Path to config TOML (env LEASEMQ_CONFIG is used when omitted)
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Connect to a running broker in interactive mode.
    Connect {
        /// Broker address (host:port)
        addr: SocketAddr,
        /// Path to config TOML for read timeout and lease retention
        #[arg(short, long)]
        config: Option<String>,
        /// Visibility timeout for `read` when none is given, in milliseconds
        /// (defaults to the configured `visibility_timeout_ms`)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leasemq::logging::init_logging()?;
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let cfg = Config::load(config.as_deref())?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let broker = tokio::spawn(start_broker(cfg, shutdown_rx));

            signal::ctrl_c().await?;
            tracing::info!("ctrl-c received; shutting down");
            let _ = shutdown_tx.send(true);

            broker.await??;
        }
        Command::Connect {
            addr,
            config,
            timeout_ms,
        } => {
            let cfg = Config::load(config.as_deref())?;
            repl(addr, &cfg, cfg.read_timeout(timeout_ms)).await?
        }
    }
    Ok(())
}

const HELP: &str = "\
create <queue>                 create a queue
get <queue>                    check that a queue exists
delete <queue>                 delete a queue
enq <queue> <msg...>           enqueue a message
read <queue> [timeout_ms]      lease the next message
ack <queue> <entity_id>        acknowledge a leased message
leases                         number of outstanding leases
exit                           release leases and quit";

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────
async fn repl(addr: SocketAddr, cfg: &Config, default_timeout: Duration) -> anyhow::Result<()> {
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;

    let client = BrokerClient::connect(addr).await?;
    client.ping().await?;
    let coordinator = DeliveryCoordinator::with_config(client, cfg.delivery_config());

    println!("Connected to {addr}. Type `help` for commands.");

    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [] => {}
            ["help"] => println!("{HELP}"),
            ["exit" | "quit"] => break,

            ["create", name] => match coordinator.create_queue(name).await {
                Ok(id) => println!("created {id}"),
                Err(e) => println!("error: {e}"),
            },

            ["get", name] => match coordinator.get_queue(name).await {
                Ok(id) => println!("found {id}"),
                Err(e) => println!("error: {e}"),
            },

            ["delete", name] => match coordinator.delete_queue(&QueueId::from(*name)).await {
                Ok(()) => println!("deleted {name}"),
                Err(e) => println!("error: {e}"),
            },

            ["enq", name, rest @ ..] if !rest.is_empty() => {
                let id = QueueId::from(*name);
                match coordinator.enqueue(&id, rest.join(" ")).await {
                    Ok(()) => println!("ok"),
                    Err(e) => println!("error: {e}"),
                }
            }

            ["read", name, timeout @ ..] if timeout.len() <= 1 => {
                let timeout = match timeout.first().map(|t| t.parse::<u64>()) {
                    None => default_timeout,
                    Some(Ok(ms)) => Duration::from_millis(ms),
                    Some(Err(e)) => {
                        println!("bad timeout: {e}");
                        continue;
                    }
                };
                match coordinator.read(&QueueId::from(*name), timeout).await {
                    Ok(d) => println!(
                        "{}#{} {}",
                        d.queue,
                        d.entity_id,
                        String::from_utf8_lossy(&d.payload)
                    ),
                    Err(e) => println!("error: {e}"),
                }
            }

            ["ack", name, entity] => match entity.parse::<u64>() {
                Ok(raw) => {
                    let id = QueueId::from(*name);
                    match coordinator.ack(&id, EntityId::from_raw(raw)) {
                        Ok(()) => println!("acked"),
                        Err(e) => println!("error: {e}"),
                    }
                }
                Err(e) => println!("bad entity id: {e}"),
            },

            ["leases"] => println!("{}", coordinator.outstanding_leases()),

            _ => println!("Unknown cmd. Type `help`."),
        }
    }

    let released = coordinator.release_all().await;
    if released > 0 {
        println!("released {released} unacked message(s)");
    }
    Ok(())
}
