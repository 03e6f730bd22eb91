//! HTTP source configuration.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Settings for [`crate::HttpSource`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HttpSourceConfig {
    /// Base URL of the source API
    #[serde(default = "default_base_url")]
    #[validate(custom(function = "validate_http_url"))]
    pub base_url: String,
    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// Per-request timeout, excluding the long-poll wait
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
    /// How long the source may hold a live poll open
    #[serde(default = "default_long_poll_secs")]
    #[validate(range(max = 120))]
    pub long_poll_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_long_poll_secs() -> u64 {
    25
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
            long_poll_secs: default_long_poll_secs(),
        }
    }
}

fn validate_http_url(value: &str) -> Result<(), ValidationError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => {
            let mut err = ValidationError::new("unsupported_scheme");
            err.message = Some(format!("scheme '{}' is not http(s)", parsed.scheme()).into());
            Err(err)
        }
        Err(e) => {
            let mut err = ValidationError::new("invalid_url");
            err.message = Some(format!("{}", e).into());
            Err(err)
        }
    }
}
