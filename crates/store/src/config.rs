//! PostgreSQL configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    #[validate(length(min = 1))]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    #[validate(length(min = 1))]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    #[validate(length(min = 1, max = 63))]
    pub database: String,
    /// Connection pool size
    #[serde(default = "default_pool_size")]
    #[validate(range(min = 1, max = 128))]
    pub pool_size: usize,
    /// Attempts made to reach the server at startup
    #[serde(default = "default_connect_retries")]
    #[validate(range(min = 1, max = 20))]
    pub connect_retries: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_database() -> String {
    "chatlog".to_string()
}

fn default_pool_size() -> usize {
    8
}

fn default_connect_retries() -> u32 {
    3
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            pool_size: default_pool_size(),
            connect_retries: default_connect_retries(),
        }
    }
}

impl PostgresConfig {
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .password(&self.password)
            .dbname(&self.database)
            .application_name("chatlog-ingest");
        pg_config
    }
}
