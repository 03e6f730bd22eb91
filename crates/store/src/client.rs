//! PostgreSQL connection pool.

use crate::config::PostgresConfig;
use crate::errors::{map_pg_error, map_pool_error};
use crate::schema::all_tables;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use ingest_core::{Error, Result, StorageErrorCode};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

/// Pooled PostgreSQL client.
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
    config: PostgresConfig,
}

impl PostgresClient {
    /// Build the pool and wait until the server answers.
    ///
    /// Retries `connect_retries` times with a doubling delay starting at 200ms.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Connecting to PostgreSQL"
        );

        let mgr = Manager::from_config(
            config.to_pg_config(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(mgr)
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(Duration::from_secs(10)))
            .build()
            .map_err(|e| Error::config(format!("failed to build PostgreSQL pool: {}", e)))?;

        let client = Self { pool, config };

        let max_attempts = client.config.connect_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match client.ping().await {
                Ok(()) => {
                    info!("Connected to PostgreSQL");
                    return Ok(client);
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(Error::storage(
                        StorageErrorCode::Unavailable,
                        format!(
                            "failed to connect to PostgreSQL after {} attempts: {}",
                            attempt, e
                        ),
                    ));
                }
                Err(e) => {
                    let delay = Duration::from_millis(100 * 2_u64.pow(attempt));
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "PostgreSQL not reachable, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub(crate) async fn conn(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| map_pool_error("acquire connection", e))
    }

    /// Verify a connection is alive.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[])
            .await
            .map_err(|e| map_pg_error("health check", e))?;
        Ok(())
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        let conn = self.conn().await?;
        for ddl in all_tables() {
            conn.batch_execute(ddl)
                .await
                .map_err(|e| map_pg_error("apply schema", e))?;
        }
        debug!("PostgreSQL schema initialized");
        Ok(())
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }
}
