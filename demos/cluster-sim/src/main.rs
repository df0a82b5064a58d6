use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use statesync::{
    ConflictStrategy, ConsistencyModel, DistributedStateManager, LocalBus, LocalTransport,
    ManagerConfig, SyncMode,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const NAMESPACE: &str = "sim";

type Manager = DistributedStateManager<LocalTransport>;

#[derive(Parser, Debug)]
#[command(name = "cluster-sim")]
#[command(about = "Simulate a statesync cluster in one process", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run N nodes, write on each of them and wait until they agree
    Run {
        /// Number of nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// eventual, causal or strong
        #[arg(short, long, default_value = "eventual")]
        model: String,

        /// Sync interval in milliseconds
        #[arg(short, long, default_value_t = 200)]
        interval_ms: u64,

        /// Keys written per node
        #[arg(short, long, default_value_t = 5)]
        writes: usize,

        /// Use the pub/sub path instead of direct requests
        #[arg(long)]
        pubsub: bool,

        /// Cut this node off for the first half of the run
        #[arg(long)]
        isolate: Option<usize>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Write the same key on two causal nodes and show how it resolves
    Conflict {
        /// Conflict strategy (last-write-wins, remote-wins, local-wins, merge)
        #[arg(short, long, default_value = "merge")]
        strategy: String,
    },
}

fn node_name(index: usize) -> String {
    format!("node-{index}")
}

fn spawn_cluster(bus: &LocalBus, configs: Vec<ManagerConfig>, mode: SyncMode) -> Vec<Arc<Manager>> {
    let managers: Vec<Arc<Manager>> = configs
        .into_iter()
        .map(|config| {
            let id = config.node_id.clone();
            let manager = Arc::new(DistributedStateManager::new(config, bus.transport(id.clone())));
            bus.register_handler(id, &manager);
            manager
        })
        .collect();
    for manager in &managers {
        for peer in &managers {
            manager.add_node(peer.node_id().clone(), mode);
        }
    }
    managers
}

fn converged(managers: &[Arc<Manager>]) -> bool {
    let mut snapshots = managers
        .iter()
        .map(|manager| manager.get_store(NAMESPACE).snapshot());
    match snapshots.next() {
        Some(first) => snapshots.all(|snapshot| snapshot == first),
        None => true,
    }
}

async fn run(
    nodes: usize,
    model: ConsistencyModel,
    interval: Duration,
    writes: usize,
    mode: SyncMode,
    isolate: Option<usize>,
    deadline: Duration,
) -> Result<()> {
    if nodes == 0 {
        bail!("need at least one node");
    }
    let bus = LocalBus::new();
    let configs = (0..nodes)
        .map(|i| {
            ManagerConfig::new(node_name(i))
                .with_model(model)
                .with_sync_interval(interval)
        })
        .collect();
    let managers = spawn_cluster(&bus, configs, mode);

    if let Some(index) = isolate {
        info!("Isolating {}", node_name(index));
        bus.set_reachable(&node_name(index), false);
    }
    for manager in &managers {
        manager.start()?;
    }

    for (i, manager) in managers.iter().enumerate() {
        let store = manager.get_store(NAMESPACE);
        for n in 0..writes {
            store.set(&format!("{}/{n}", node_name(i)), json!({ "n": n, "by": i }), None);
        }
    }

    let started = Instant::now();
    let mut healed = isolate.is_none();
    loop {
        if !healed && started.elapsed() >= deadline / 2 {
            if let Some(index) = isolate {
                info!("Reconnecting {}", node_name(index));
                bus.set_reachable(&node_name(index), true);
                for manager in &managers {
                    for peer in &managers {
                        manager.add_node(peer.node_id().clone(), mode);
                    }
                }
            }
            healed = true;
        }
        if healed && converged(&managers) {
            info!("Converged after {:?}", started.elapsed());
            break;
        }
        if started.elapsed() >= deadline {
            warn!("Did not converge within {deadline:?}");
            break;
        }
        sleep(interval / 2).await;
    }

    for manager in &managers {
        let status = serde_json::to_string_pretty(&manager.status())?;
        println!("{status}");
    }
    for manager in &managers {
        manager.destroy().await;
    }
    Ok(())
}

async fn conflict(strategy: ConflictStrategy) -> Result<()> {
    let bus = LocalBus::new();
    let configs = ["left", "right"]
        .into_iter()
        .map(|id| {
            ManagerConfig::new(id)
                .with_model(ConsistencyModel::Causal)
                .with_strategy(strategy)
        })
        .collect();
    let managers = spawn_cluster(&bus, configs, SyncMode::Direct);
    let (left, right) = (&managers[0], &managers[1]);

    left.get_store(NAMESPACE).set(
        "doc",
        json!({ "title": "left", "tags": ["a"], "timestamp": 1 }),
        None,
    );
    let right_store = right.get_store(NAMESPACE);
    right_store.set("doc", json!({ "title": "right", "tags": ["b"], "timestamp": 2 }), None);
    right_store.set("note", json!("only on the right"), None);

    let report = left.sync_with_nodes(None).await;
    if !report.is_success() {
        bail!("sync failed: {:?}", report.failed());
    }
    right.sync_with_nodes(None).await;

    for manager in &managers {
        let snapshot = manager.get_store(NAMESPACE).snapshot();
        println!(
            "{}: {}",
            manager.node_id(),
            serde_json::to_string(&snapshot).context("Failed to encode snapshot")?
        );
    }
    for manager in &managers {
        manager.destroy().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            nodes,
            model,
            interval_ms,
            writes,
            pubsub,
            isolate,
            timeout_secs,
        } => {
            let model: ConsistencyModel = model.parse()?;
            let mode = if pubsub {
                SyncMode::PubSub
            } else {
                SyncMode::Direct
            };
            run(
                nodes,
                model,
                Duration::from_millis(interval_ms),
                writes,
                mode,
                isolate,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Commands::Conflict { strategy } => conflict(strategy.parse()?).await,
    }
}
