//! Tier controller daemon.
//!
//! Consumes tiering recommendation events and drives bounded-concurrency
//! migrations through the metadata service. The upstream log broker is an
//! external system; this daemon bridges it with a small HTTP ingest endpoint
//! (`POST /events`, one JSON event per request) feeding the in-process
//! event channel, so any broker-side relay can push the partition stream in
//! order.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tierstore::client::{MetaClient, Pipeline, ShardClient};
use tierstore::common::crypto::DerivedKeyProvider;
use tierstore::common::erasure::ErasureCodec;
use tierstore::common::metrics::TierMetrics;
use tierstore::common::{RuntimeConfig, TierConfig};
use tierstore::tier::{ChannelSource, PipelineMigrator, TierController};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tierstore-tierd")]
#[command(about = "tierstore tier migration controller")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller
    Run {
        /// Metadata service base URL
        #[arg(long, default_value = "http://localhost:7000")]
        meta: String,

        /// Bind address for the event ingest + metrics endpoint
        #[arg(long, default_value = "0.0.0.0:9100")]
        bind: String,

        /// Worker pool size
        #[arg(long, default_value = "5")]
        concurrency: usize,

        /// Minimum model confidence to act on a recommendation
        #[arg(long, default_value = "0.8")]
        confidence_threshold: f64,

        /// Migration deadline in seconds
        #[arg(long, default_value = "1800")]
        migration_timeout: u64,

        /// Erasure schema: data shards
        #[arg(long, default_value = "6")]
        data_shards: usize,

        /// Erasure schema: parity shards
        #[arg(long, default_value = "3")]
        parity_shards: usize,
    },
}

#[derive(Clone)]
struct IngestState {
    tx: mpsc::Sender<Vec<u8>>,
    metrics: Arc<TierMetrics>,
}

async fn ingest_event(State(state): State<IngestState>, body: axum::body::Bytes) -> impl IntoResponse {
    match state.tx.send(body.to_vec()).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn serve_metrics(State(state): State<IngestState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.to_prometheus())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
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
        Commands::Run {
            meta,
            bind,
            concurrency,
            confidence_threshold,
            migration_timeout,
            data_shards,
            parity_shards,
        } => {
            let master_key = std::env::var("TIERSTORE_MASTER_KEY")
                .map_err(|_| anyhow::anyhow!("TIERSTORE_MASTER_KEY must be set"))?;

            let config = TierConfig {
                meta_addr: meta.clone(),
                concurrency,
                confidence_threshold,
                migration_timeout_secs: migration_timeout,
                poll_interval_secs: 10,
            };

            let runtime = RuntimeConfig::default();
            let pipeline = Arc::new(Pipeline::new(
                MetaClient::with_runtime(&meta, &runtime),
                ShardClient::new(&runtime),
                Arc::new(ErasureCodec::new(data_shards, parity_shards)?),
                Arc::new(DerivedKeyProvider::new(&master_key)?),
            ));

            let metrics = Arc::new(TierMetrics::new());
            let migrator = Arc::new(PipelineMigrator::new(pipeline));
            let controller = TierController::new(config.clone(), migrator, Arc::clone(&metrics));

            let (signal, shutdown) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                let _ = signal.send(true);
            });

            // Broker bridge: events arrive over HTTP, flow through the
            // bounded channel into the controller
            let (tx, rx) = mpsc::channel(config.queue_capacity().max(16));
            let source = ChannelSource::new(rx);

            let ingest_state = IngestState {
                tx,
                metrics: Arc::clone(&metrics),
            };
            let app = Router::new()
                .route("/events", post(ingest_event))
                .route("/metrics", get(serve_metrics))
                .route("/health", get(health))
                .with_state(ingest_state);

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            tracing::info!("event ingest listening on {}", bind);

            let mut http_shutdown = shutdown.clone();
            let ingest = tokio::spawn(async move {
                let _ = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = http_shutdown.changed().await;
                    })
                    .await;
            });

            controller.run(source, shutdown).await?;
            let _ = ingest.await;
        }
    }

    Ok(())
}
