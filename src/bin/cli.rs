//! CLI client for tierstore.
//!
//! Exit codes: 0 success, 1 local error, 2 server error, 3 authentication
//! failure.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tierstore::client::{MetaClient, Pipeline, ShardClient};
use tierstore::common::crypto::DerivedKeyProvider;
use tierstore::common::erasure::ErasureCodec;
use tierstore::common::{format_bytes, Error, Result, RuntimeConfig};
use tierstore::meta::types::Tier;
use tierstore::tier::{Migrator, PipelineMigrator, TieringRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tierstore")]
#[command(about = "tierstore distributed object store CLI")]
#[command(version)]
struct Cli {
    /// Metadata service / API base URL
    #[arg(long, default_value = "http://localhost:7000")]
    api_url: String,

    /// Token issuance endpoint base URL; defaults to the API URL (which
    /// serves a development issuer) when no identity provider fronts it
    #[arg(long)]
    auth_url: Option<String>,

    /// Client config file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Login and store the auth token
    Login {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        password: String,
    },

    /// Bucket operations
    Bucket {
        #[command(subcommand)]
        command: BucketCommands,
    },

    /// Object operations
    Object {
        #[command(subcommand)]
        command: ObjectCommands,
    },
}

#[derive(Subcommand)]
enum BucketCommands {
    /// Create a new bucket
    Create { name: String },

    /// Delete a bucket and everything in it
    Delete { name: String },

    /// List buckets
    List,
}

#[derive(Subcommand)]
enum ObjectCommands {
    /// Upload a file as an object
    Upload {
        bucket: String,
        key: String,
        file: PathBuf,

        /// Target storage tier
        #[arg(long, default_value = "hot")]
        tier: String,

        /// Content type recorded in metadata
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
    },

    /// Download an object to a file
    Download {
        bucket: String,
        key: String,
        output: PathBuf,
    },

    /// Delete an object
    Delete { bucket: String, key: String },

    /// List objects in a bucket
    List { bucket: String },

    /// Migrate an object to a different tier
    MigrateTier {
        bucket: String,
        key: String,
        tier: String,
    },
}

/// Client-side settings persisted by `login` / overridden by flags
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientConfig {
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    auth_url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    master_key: Option<String>,
    /// Deployment erasure schema; must match the fleet
    #[serde(default)]
    data_shards: Option<usize>,
    #[serde(default)]
    parity_shards: Option<usize>,
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".tierstore.json")
    })
}

fn load_config(path: &PathBuf) -> ClientConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

fn save_config(path: &PathBuf, config: &ClientConfig) -> Result<()> {
    std::fs::write(
        path,
        serde_json::to_string_pretty(config).expect("config encodes"),
    )?;
    Ok(())
}

fn build_pipeline(api_url: &str, config: &ClientConfig) -> Result<Pipeline> {
    let master_key = std::env::var("TIERSTORE_MASTER_KEY")
        .ok()
        .or_else(|| config.master_key.clone())
        .ok_or_else(|| {
            Error::InvalidConfig(
                "no master key: set TIERSTORE_MASTER_KEY or masterKey in the config file".into(),
            )
        })?;

    let runtime = RuntimeConfig::default();
    let meta = MetaClient::with_runtime(api_url, &runtime).with_token(config.token.clone());

    Ok(Pipeline::new(
        meta,
        ShardClient::new(&runtime),
        Arc::new(ErasureCodec::new(
            config.data_shards.unwrap_or(6),
            config.parity_shards.unwrap_or(3),
        )?),
        Arc::new(DerivedKeyProvider::new(&master_key)?),
    ))
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = config_path(&cli);
    let mut config = load_config(&config_file);
    let api_url = config
        .api_url
        .clone()
        .filter(|_| cli.api_url == "http://localhost:7000")
        .unwrap_or_else(|| cli.api_url.clone());

    let meta = MetaClient::new(&api_url).with_token(config.token.clone());

    let auth_url = cli
        .auth_url
        .clone()
        .or_else(|| config.auth_url.clone())
        .unwrap_or_else(|| api_url.clone());

    match cli.command {
        Commands::Login { username, password } => {
            let http = reqwest::Client::new();
            let response = http
                .post(format!("{}/auth/login", auth_url.trim_end_matches('/')))
                .json(&serde_json::json!({ "username": username, "password": password }))
                .send()
                .await
                .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;

            if !response.status().is_success() {
                return Err(Error::Http(format!(
                    "login failed: {}",
                    response.status()
                )));
            }

            let body: serde_json::Value = response.json().await.map_err(Error::from)?;
            let token = body
                .get("token")
                .and_then(|t| t.as_str())
                .ok_or_else(|| Error::Http("login response missing token".into()))?;

            config.token = Some(token.to_string());
            config.username = Some(username);
            if cli.auth_url.is_some() {
                config.auth_url = cli.auth_url;
            }
            config.api_url = Some(api_url);
            save_config(&config_file, &config)?;
            println!("Login successful");
        }

        Commands::Bucket { command } => match command {
            BucketCommands::Create { name } => {
                let owner = config.username.clone().unwrap_or_else(whoami);
                meta.create_bucket(&name, &owner).await?;
                println!("Created bucket {}", name);
            }
            BucketCommands::Delete { name } => {
                meta.delete_bucket(&name).await?;
                println!("Deleted bucket {}", name);
            }
            BucketCommands::List => {
                let buckets = meta.list_buckets().await?;
                println!("{:<24} {:>8} {:>12}", "NAME", "OBJECTS", "SIZE");
                println!("{}", "-".repeat(48));
                for bucket in buckets {
                    println!(
                        "{:<24} {:>8} {:>12}",
                        bucket.name,
                        bucket.object_count,
                        format_bytes(bucket.total_size)
                    );
                }
            }
        },

        Commands::Object { command } => match command {
            ObjectCommands::Upload {
                bucket,
                key,
                file,
                tier,
                content_type,
            } => {
                let tier = Tier::parse(&tier)?;
                let data = std::fs::read(&file)?;
                let pipeline = build_pipeline(&api_url, &config)?;

                let object = pipeline
                    .upload(&bucket, &key, &data, tier, &content_type)
                    .await?;
                println!(
                    "Uploaded {} to {}/{} ({} in {} shards)",
                    file.display(),
                    bucket,
                    key,
                    format_bytes(object.size),
                    object.shards.len()
                );
            }

            ObjectCommands::Download {
                bucket,
                key,
                output,
            } => {
                let pipeline = build_pipeline(&api_url, &config)?;
                let data = pipeline.download(&bucket, &key).await?;
                std::fs::write(&output, &data)?;
                println!(
                    "Downloaded {}/{} to {} ({})",
                    bucket,
                    key,
                    output.display(),
                    format_bytes(data.len() as u64)
                );
            }

            ObjectCommands::Delete { bucket, key } => {
                let pipeline = build_pipeline(&api_url, &config)?;
                pipeline.delete(&bucket, &key).await?;
                println!("Deleted {}/{}", bucket, key);
            }

            ObjectCommands::List { bucket } => {
                let objects = meta.list_objects(&bucket).await?;
                println!(
                    "{:<32} {:>10} {:>6} {:>16}",
                    "KEY", "SIZE", "TIER", "LAST ACCESSED"
                );
                println!("{}", "-".repeat(68));
                for object in objects {
                    println!(
                        "{:<32} {:>10} {:>6} {:>16}",
                        object.object_key,
                        format_bytes(object.size),
                        object.tier.as_str(),
                        object.last_accessed
                    );
                }
            }

            ObjectCommands::MigrateTier { bucket, key, tier } => {
                let target = Tier::parse(&tier)?;
                let pipeline = Arc::new(build_pipeline(&api_url, &config)?);

                let object = pipeline.meta().get_object(&bucket, &key).await?;
                if object.tier == target {
                    println!("{}/{} is already {}", bucket, key, target);
                    return Ok(());
                }

                let migrator = PipelineMigrator::new(Arc::clone(&pipeline));
                let request = TieringRequest {
                    timestamp: tierstore::common::timestamp_now() as f64,
                    bucket_name: bucket.clone(),
                    object_key: key.clone(),
                    current_tier: object.tier,
                    recommended_tier: target,
                    confidence: 1.0,
                    probability_hot: 0.0,
                    model_version: "manual".into(),
                };

                let handle = migrator.start(&request).await?;
                loop {
                    match handle.status().state {
                        tierstore::tier::MigrationState::Running => {
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        }
                        tierstore::tier::MigrationState::Succeeded => {
                            println!("Migrated {}/{} to {}", bucket, key, target);
                            break;
                        }
                        tierstore::tier::MigrationState::Failed => {
                            let status = handle.status();
                            return Err(Error::Internal(format!(
                                "migration failed: {}",
                                status.error.unwrap_or_else(|| "unknown".into())
                            )));
                        }
                    }
                }
            }
        },
    }

    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
