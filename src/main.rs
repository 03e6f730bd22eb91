//! Chat log ingestion service
//!
//! Streams live chat events and walks chat history into durable storage:
//! - Live long-poll feed with offset tracking
//! - Per-chat backfill that resumes from its checkpoint
//! - Batched, deduplicated commits with checkpoint advances in one transaction
//! - Read-only HTTP reporting of health, counters and backfill progress

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};
use validator::Validate;

use api::{router, AppState};
use pipeline::{IngestionCoordinator, PipelineConfig};
use source::{EventSource, HttpSource, HttpSourceConfig};
use store::{EventStore, MemoryStore, PostgresConfig, PostgresStore};
use telemetry::init_tracing_from_env;

const ENV_PREFIX: &str = "CHATLOG";

/// Where committed events live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StorageBackend {
    Postgres,
    /// Process-local; everything is lost on exit
    Memory,
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    #[validate(range(min = 1024, max = 65535))]
    port: u16,

    /// Serve the reporting endpoints
    #[serde(default = "default_true")]
    health_check_enabled: bool,

    #[serde(default = "default_storage_backend")]
    storage_backend: StorageBackend,

    #[serde(default)]
    #[validate(nested)]
    postgres: PostgresConfig,

    #[serde(default)]
    #[validate(nested)]
    source: HttpSourceConfig,

    #[serde(default)]
    #[validate(nested)]
    pipeline: PipelineConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Postgres
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            health_check_enabled: true,
            storage_backend: default_storage_backend(),
            postgres: PostgresConfig::default(),
            source: HttpSourceConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting chatlog-ingest v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;

    info!(
        storage = ?config.storage_backend,
        source = %config.source.base_url,
        batch_size = config.pipeline.batch.max_size,
        backfill = config.pipeline.backfill.enabled,
        "Loaded configuration"
    );

    let store = connect_store(&config).await?;
    let source: Arc<dyn EventSource> = Arc::new(
        HttpSource::new(config.source.clone()).context("Failed to create event source")?,
    );

    let coordinator = Arc::new(IngestionCoordinator::new(
        config.pipeline.clone(),
        source,
        store.clone(),
    ));
    coordinator
        .start()
        .await
        .context("Failed to start ingestion")?;

    if config.health_check_enabled {
        let app = router(AppState::new(coordinator.clone(), store));

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .context("Invalid server address")?;

        info!("Listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("Failed to bind to address")?;

        // Run server with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;
    } else {
        info!("Reporting endpoints disabled");
        shutdown_signal().await;
    }

    info!("Shutting down...");

    match coordinator.shutdown().await {
        Ok(flushed) => info!(flushed, "Pending events flushed"),
        Err(e) => error!(error = %e, "Failed to flush pending events"),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn connect_store(config: &Config) -> Result<Arc<dyn EventStore>> {
    match config.storage_backend {
        StorageBackend::Postgres => {
            let store = PostgresStore::connect(config.postgres.clone())
                .await
                .context("Failed to connect to PostgreSQL")?;
            info!(
                host = %config.postgres.host,
                database = %config.postgres.database,
                "PostgreSQL storage ready"
            );
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; committed events do not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables, e.g. CHATLOG__PIPELINE__BATCH__MAX_SIZE
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    config
        .validate()
        .context("Invalid configuration")?;

    Ok(config)
}

/// Flat variables the layered environment source cannot express.
///
/// Lists are comma separated; blank entries are skipped.
fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let var = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name));
    let filter = &mut config.pipeline.filter;

    if let Some(list) = var("ALLOWED_CHATS") {
        filter.allowed_chats = parse_id_list("ALLOWED_CHATS", &list)?;
    }
    if let Some(list) = var("IGNORED_CHATS") {
        filter.ignored_chats = parse_id_list("IGNORED_CHATS", &list)?;
    }
    if let Some(list) = var("ALLOWED_CHANNELS") {
        filter.allowed_channels = split_list(&list).map(str::to_string).collect();
    }
    if let Some(list) = var("IGNORED_CHANNELS") {
        filter.ignored_channels = split_list(&list).map(str::to_string).collect();
    }
    if let Some(list) = var("BACKFILL_PARTITIONS") {
        config.pipeline.backfill.partitions = parse_id_list("BACKFILL_PARTITIONS", &list)?;
    }
    if let Some(days) = var("RETENTION_DAYS") {
        let days = days.trim();
        config.pipeline.retention.keep_days = match days {
            "" | "0" => None,
            days => Some(days.parse().with_context(|| {
                format!("{}_RETENTION_DAYS is not a day count: {}", ENV_PREFIX, days)
            })?),
        };
    }

    // Nested PostgreSQL fields
    if let Some(host) = var("POSTGRES_HOST") {
        config.postgres.host = host;
    }
    if let Some(port) = var("POSTGRES_PORT") {
        config.postgres.port = port
            .trim()
            .parse()
            .with_context(|| format!("{}_POSTGRES_PORT is not a port: {}", ENV_PREFIX, port))?;
    }
    if let Some(user) = var("POSTGRES_USER") {
        config.postgres.user = user;
    }
    if let Some(password) = var("POSTGRES_PASSWORD") {
        config.postgres.password = password;
    }
    if let Some(database) = var("POSTGRES_DATABASE") {
        config.postgres.database = database;
    }

    if let Some(token) = var("SOURCE_TOKEN") {
        config.source.token = Some(token).filter(|t| !t.trim().is_empty());
    }

    // Platform-assigned port wins
    if let Some(port) = lookup("PORT") {
        config.port = port
            .trim()
            .parse()
            .with_context(|| format!("PORT is not a port: {}", port))?;
    }

    Ok(())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_id_list(name: &str, value: &str) -> Result<Vec<i64>> {
    split_list(value)
        .map(|item| {
            item.parse::<i64>().with_context(|| {
                format!("{}_{} contains a non-numeric chat id: {}", ENV_PREFIX, name, item)
            })
        })
        .collect()
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
