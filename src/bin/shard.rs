//! Shard node binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tierstore::common::Config;
use tierstore::ShardServer;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tierstore-shard")]
#[command(about = "tierstore shard storage node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the shard node
    Serve {
        /// Node ID
        #[arg(long)]
        id: String,

        /// Bind address for the shard HTTP API
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,

        /// Externally reachable address of this node
        #[arg(long, default_value = "http://localhost:8080")]
        advertise: String,

        /// Data directory for shard blobs
        #[arg(long, default_value = "./shard-data")]
        data: PathBuf,

        /// Tier label served by this node (hot or cold)
        #[arg(long, default_value = "hot")]
        tier: String,

        /// Metadata service base URL
        #[arg(long, default_value = "http://localhost:7000")]
        meta: String,

        /// Config file (CLI flags take priority)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            advertise,
            data,
            tier,
            meta,
            config,
        } => {
            if tier != "hot" && tier != "cold" {
                anyhow::bail!("unknown tier label: {}", tier);
            }

            let file_config = match config {
                Some(path) => Some(Config::from_file(&path)?),
                None => None,
            };

            let mut shard_config = file_config
                .and_then(|c| c.shard)
                .unwrap_or_default();
            shard_config.bind_addr = bind.parse()?;
            shard_config.advertise_addr = advertise;
            shard_config.data_dir = data;
            shard_config.tier = tier;
            shard_config.meta_addr = meta;

            let (signal, shutdown) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                let _ = signal.send(true);
            });

            ShardServer::new(shard_config, id).serve(shutdown).await?;
        }
    }

    Ok(())
}
