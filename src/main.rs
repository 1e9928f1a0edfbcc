use clap::Parser;
use crawl_grid::compute::{FnTask, RunOptions, TaskExecutionResult};
use crawl_grid::config::GridConfig;
use crawl_grid::grid::{GridConnector, LocalCluster};
use serde_json::json;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crawl-grid")]
#[command(about = "Starts an in-process grid and runs a sample task on every node")]
struct Args {
    /// Number of nodes to start
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Grid name (defaults to GRID_NAME or "crawl-grid")
    #[arg(long, env = "GRID_NAME")]
    grid_name: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, env = "GRID_HEARTBEAT_INTERVAL_MS")]
    heartbeat_ms: Option<u64>,

    /// Node timeout in milliseconds
    #[arg(long, env = "GRID_NODE_TIMEOUT_MS")]
    node_timeout_ms: Option<u64>,

    /// Task timeout in milliseconds
    #[arg(long, env = "GRID_TASK_TIMEOUT_MS")]
    task_timeout_ms: Option<u64>,

    /// Documents each node pretends to crawl
    #[arg(long, default_value_t = 5)]
    docs_per_node: u64,
}

impl Args {
    fn config(&self) -> GridConfig {
        let mut config = GridConfig::from_env();
        if let Some(name) = &self.grid_name {
            config.grid_name = name.clone();
        }
        if let Some(ms) = self.heartbeat_ms {
            config = config.with_heartbeat_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.node_timeout_ms {
            config = config.with_node_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.task_timeout_ms {
            config = config.with_task_timeout(Some(Duration::from_millis(ms)));
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.nodes == 0 {
        anyhow::bail!("--nodes must be at least 1");
    }
    let config = args.config();
    tracing::info!("Starting grid '{}' with {} node(s)", config.grid_name, args.nodes);

    // 1. Grid and task kinds:
    let cluster = LocalCluster::new(config);
    let docs_per_node = args.docs_per_node;
    cluster.registry().register("crawl", move |task_id| {
        FnTask::new(task_id, move |ctx| async move {
            let processed = ctx.storage().map::<u64>("processed")?;
            for _ in 0..docs_per_node {
                if ctx.is_stop_requested() {
                    break;
                }
                processed.update(ctx.node_address().as_str(), |n| n.unwrap_or(0) + 1)?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let count = processed.get(ctx.node_address().as_str())?.unwrap_or(0);
            tracing::info!("Node {} processed {} document(s)", ctx.node_address(), count);
            Ok(Some(json!(count)))
        })
        .with_aggregator(|results| {
            let total: u64 = results
                .iter()
                .filter_map(|r| r.result.as_ref().and_then(|v| v.as_u64()))
                .sum();
            Some(TaskExecutionResult::completed(Some(json!({ "documents": total }))))
        })
        .into_task()
    });
    tracing::info!("Task kinds: {:?}", cluster.registry().list_kinds());

    // 2. Nodes:
    let mut nodes = Vec::new();
    for i in 1..=args.nodes {
        nodes.push(cluster.connect(&format!("node-{}", i)).await?);
    }

    // 3. Every node asks for the same task, as every crawler instance would:
    let mut runs = tokio::task::JoinSet::new();
    for node in &nodes {
        let compute = node.compute().clone();
        let address = node.node_address().clone();
        runs.spawn(async move {
            let result = compute.run_task("crawl", "crawl-demo", RunOptions::default()).await;
            (address, result)
        });
    }

    while let Some(joined) = runs.join_next().await {
        let (address, result) = joined?;
        let result = result?;
        tracing::info!("Node {} got result: {:?}", address, result);
        println!("{}: {}", address, serde_json::to_string(&result)?);
    }

    // 4. Shutdown:
    for node in &nodes {
        node.disconnect();
    }
    Ok(())
}
