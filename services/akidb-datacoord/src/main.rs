use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use akidb_core::{DataCoordConfig, IdAllocator, NodeId};
use akidb_datacoord::{
    CatalogClient, CommandQueueClient, DataCoordinator, NodeCommand, StaticCatalog,
};
use akidb_metadata::{KvBackend, KvIdAllocator, KvMetadataStore, SqliteKvBackend};

#[derive(Debug, Parser)]
#[command(name = "akidb-datacoord", about = "AkiDB data coordinator")]
struct Args {
    /// Configuration file; defaults and environment still apply
    #[arg(long, env = "AKIDB_DATACOORD_CONFIG")]
    config: Option<PathBuf>,

    /// JSON catalog snapshot with collections and the DDL channel
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// DDL channel used when no catalog file is given
    #[arg(long, default_value = "akidb-dd")]
    dd_channel: String,

    /// Data node addresses to register at startup
    #[arg(long = "node")]
    nodes: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DataCoordConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DataCoordConfig::load().context("loading config")?,
    };
    init_tracing(&config);

    let kv: Arc<dyn KvBackend> = Arc::new(SqliteKvBackend::connect(&config.meta.sqlite_url).await?);
    let meta = Arc::new(KvMetadataStore::open(kv.clone(), config.meta.root_path.clone()).await?);
    let ids = Arc::new(
        KvIdAllocator::open(kv, &config.meta.root_path, config.meta.id_block_size).await?,
    );

    let catalog: Arc<dyn CatalogClient> = match &args.catalog {
        Some(path) => Arc::new(StaticCatalog::from_file(path)?),
        None => Arc::new(StaticCatalog::new(args.dd_channel.clone())),
    };

    let (client, commands) = CommandQueueClient::new(config.channels.buffer);
    tokio::spawn(log_node_commands(commands));

    let coordinator = Arc::new(DataCoordinator::new(
        config,
        meta,
        ids.clone(),
        catalog,
        Arc::new(client),
    ));

    for address in &args.nodes {
        let node_id = NodeId::new(ids.alloc_id().await?);
        let response = coordinator.register_node(address, node_id).await?;
        tracing::info!(node_id = %response.node_id, address = %address, "Registered static data node");
    }

    let started = tokio::select! {
        result = coordinator.start() => Some(result),
        _ = shutdown_signal() => None,
    };
    match started {
        Some(Ok(())) => {
            tracing::info!(
                time_tick_channel = %coordinator.time_tick_channel(),
                statistics_channel = %coordinator.statistics_channel(),
                "Data coordinator serving"
            );
            shutdown_signal().await;
        }
        Some(Err(err)) => {
            coordinator.stop().await;
            return Err(err).context("starting data coordinator");
        }
        None => {}
    }

    coordinator.stop().await;
    Ok(())
}

fn init_tracing(config: &DataCoordConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Node commands have no transport in this binary; they are logged.
async fn log_node_commands(mut commands: mpsc::Receiver<NodeCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            NodeCommand::WatchChannels { node, groups } => {
                let names: Vec<_> = groups.iter().map(|group| group.name.as_str()).collect();
                tracing::info!(node_id = %node.node_id, address = %node.address, groups = ?names, "Watch channels");
            }
            NodeCommand::FlushSegments {
                node,
                collection_id,
                segment_ids,
            } => {
                tracing::info!(
                    node_id = %node.node_id,
                    collection_id = %collection_id,
                    segments = ?segment_ids,
                    "Flush segments"
                );
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received CTRL+C signal, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, initiating graceful shutdown");
        }
    }
}
