//! Metadata node binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tierstore::common::{Config, ErasureConfig, MetaConfig};
use tierstore::MetaServer;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tierstore-meta")]
#[command(about = "tierstore metadata node with raft consensus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the metadata node
    Serve {
        /// Node ID
        #[arg(long)]
        id: String,

        /// Bind address for the HTTP API (public REST + raft RPC)
        #[arg(long, default_value = "0.0.0.0:7000")]
        bind: String,

        /// Externally reachable HTTP address of this node
        #[arg(long, default_value = "http://localhost:7000")]
        advertise: String,

        /// Data directory (raft log, state, snapshots)
        #[arg(long, default_value = "./meta-data")]
        data: PathBuf,

        /// Existing cluster member to join; omit to bootstrap a new cluster
        #[arg(long)]
        join: Option<String>,

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
            join,
            config,
        } => {
            let file_config = match config {
                Some(path) => Some(Config::from_file(&path)?),
                None => None,
            };

            let mut meta_config = file_config
                .as_ref()
                .and_then(|c| c.meta.clone())
                .unwrap_or_default();
            meta_config.bind_addr = bind.parse()?;
            meta_config.advertise_addr = advertise;
            meta_config.data_dir = data;
            if join.is_some() {
                meta_config.join_addr = join;
            }

            let erasure = file_config
                .map(|c| c.erasure)
                .unwrap_or_else(ErasureConfig::default);

            validate(&meta_config)?;

            let (signal, shutdown) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                let _ = signal.send(true);
            });

            MetaServer::new(meta_config, erasure, id)
                .serve(shutdown)
                .await?;
        }
    }

    Ok(())
}

fn validate(config: &MetaConfig) -> anyhow::Result<()> {
    if config.advertise_addr.is_empty() {
        anyhow::bail!("advertise address is required");
    }
    Ok(())
}
