//! Runtime configuration: command-line flags (with env fallbacks via
//! `clap`'s `env` feature), a `.env` file loaded through `dotenvy`, and the
//! `PipelineConfig` TOML file the core's handlers read (§6).

use std::path::PathBuf;

use clap::Parser;
use rca_core::config::PipelineConfig;

/// Daemon-level settings that live outside the core's own `PipelineConfig`:
/// where to find Redis and SQLite, and which sockets to bind.
#[derive(Debug, Clone, Parser)]
#[command(name = "rca-runtime", version, about = "RCA experiment controller daemon")]
pub struct RuntimeArgs {
    /// Path to the `PipelineConfig` TOML file (§6).
    #[arg(long, env = "RCA_CONFIG_PATH", default_value = "rca.toml")]
    pub config_path: PathBuf,

    /// Redis connection string backing the broker (C2).
    #[arg(long, env = "RCA_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Path to the SQLite database file backing the persistence store (C1).
    #[arg(long, env = "RCA_SQLITE_PATH", default_value = "rca.sqlite3")]
    pub sqlite_path: PathBuf,

    /// Base URL of the cluster-API sidecar the `ClusterGateway` talks to.
    #[arg(long, env = "RCA_CLUSTER_API_URL", default_value = "http://127.0.0.1:8090")]
    pub cluster_api_url: String,

    /// Base URL of the container-builder daemon the `BuilderClient` talks to,
    /// falling back to `buildkit.address` from the pipeline config if unset.
    #[arg(long, env = "RCA_BUILDER_URL")]
    pub builder_url: Option<String>,

    /// Bind address for the axum ingress HTTP server (informer webhooks).
    #[arg(long, env = "RCA_HTTP_LISTEN", default_value = "0.0.0.0:8080")]
    pub http_listen: String,

    /// Bind address for the tonic gRPC submission server.
    #[arg(long, env = "RCA_GRPC_LISTEN", default_value = "0.0.0.0:50051")]
    pub grpc_listen: String,

    /// Scheduler tick interval, in milliseconds (§4.5).
    #[arg(long, env = "RCA_TICK_INTERVAL_MS", default_value_t = 1000)]
    pub tick_interval_ms: u64,

    /// Emit structured JSON logs instead of the human-readable format.
    #[arg(long, env = "RCA_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl RuntimeArgs {
    /// Parses CLI args, first loading a `.env` file if present (a missing
    /// file is not an error — only a malformed one is).
    pub fn load() -> Self {
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(err) => tracing::warn!(%err, "failed to parse .env file"),
        }
        Self::parse()
    }
}

/// Loads `PipelineConfig` from `path`. A missing file yields the default
/// config rather than an error, so a fresh checkout can run against
/// sensible defaults before an operator drops in a real `rca.toml`.
pub async fn load_pipeline_config(path: &std::path::Path) -> anyhow::Result<PipelineConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(toml::from_str(&raw)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "no pipeline config found, using defaults");
            Ok(PipelineConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}
