//! Testcontainer setup for PostgreSQL.
//!
//! Set `CHATLOG_TEST_POSTGRES_HOST` (and optionally `_PORT`, `_USER`,
//! `_PASSWORD`, `_DATABASE`) to run against an existing server instead.

use store::PostgresConfig;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

const DATABASE: &str = "chatlog_test";
const PASSWORD: &str = "chatlog";

/// Container handle for PostgreSQL.
pub struct TestContainers {
    #[allow(dead_code)]
    postgres: Option<ContainerAsync<GenericImage>>,
    pub postgres_config: PostgresConfig,
}

impl TestContainers {
    /// Start PostgreSQL, or point at the server named by the environment.
    pub async fn start() -> Self {
        if let Some(host) = std::env::var("CHATLOG_TEST_POSTGRES_HOST")
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            let env = |name: &str, default: &str| {
                std::env::var(format!("CHATLOG_TEST_POSTGRES_{}", name))
                    .unwrap_or_else(|_| default.to_string())
            };
            return Self {
                postgres: None,
                postgres_config: PostgresConfig {
                    host,
                    port: env("PORT", "5432").parse().unwrap_or(5432),
                    user: env("USER", "postgres"),
                    password: env("PASSWORD", ""),
                    database: env("DATABASE", DATABASE),
                    pool_size: 4,
                    connect_retries: 5,
                },
            };
        }

        let (postgres, port) = start_postgres().await;

        Self {
            postgres: Some(postgres),
            postgres_config: PostgresConfig {
                host: "127.0.0.1".to_string(),
                port,
                user: "postgres".to_string(),
                password: PASSWORD.to_string(),
                database: DATABASE.to_string(),
                pool_size: 4,
                // The server restarts once after initdb; ride it out.
                connect_retries: 10,
            },
        }
    }
}

/// Start a PostgreSQL container, return container and mapped port.
pub async fn start_postgres() -> (ContainerAsync<GenericImage>, u16) {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_exposed_port(5432.tcp())
        .with_env_var("POSTGRES_PASSWORD", PASSWORD)
        .with_env_var("POSTGRES_DB", DATABASE);

    let container = image.start().await.expect("Failed to start PostgreSQL");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("PostgreSQL port not mapped");

    (container, port)
}
