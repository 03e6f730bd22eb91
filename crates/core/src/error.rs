//! Unified error types for the ingestion pipeline.
//!
//! Error codes:
//! - SRC_001-004: Event source errors
//! - DB_001-005: Storage errors
//!
//! Every error classifies itself as transient or permanent so retry
//! decisions live in one place instead of at each call site.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether a failure is expected to resolve on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeout, throttling, temporary unavailability.
    Transient,
    /// Malformed data, non-concurrency constraint violation.
    Permanent,
}

impl FailureClass {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Event source error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorCode {
    /// SRC_001: Request timed out
    Timeout,
    /// SRC_002: Source throttled the request
    RateLimited,
    /// SRC_003: Source unreachable or returned 5xx
    Unavailable,
    /// SRC_004: Source rejected the request
    Rejected,
}

impl SourceErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "SRC_001",
            Self::RateLimited => "SRC_002",
            Self::Unavailable => "SRC_003",
            Self::Rejected => "SRC_004",
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout | Self::RateLimited | Self::Unavailable => FailureClass::Transient,
            Self::Rejected => FailureClass::Permanent,
        }
    }
}

/// Storage error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    /// DB_001: Storage unavailable (pool exhausted, connection refused)
    Unavailable,
    /// DB_002: Statement timed out
    Timeout,
    /// DB_003: Serialization failure or deadlock, safe to replay
    Conflict,
    /// DB_004: Constraint violation unrelated to the upsert key
    ConstraintViolation,
    /// DB_005: Any other query failure
    Query,
}

impl StorageErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable => "DB_001",
            Self::Timeout => "DB_002",
            Self::Conflict => "DB_003",
            Self::ConstraintViolation => "DB_004",
            Self::Query => "DB_005",
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Unavailable | Self::Timeout | Self::Conflict => FailureClass::Transient,
            Self::ConstraintViolation | Self::Query => FailureClass::Permanent,
        }
    }
}

/// Unified error type for the ingestion pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Event source error with code.
    #[error("[{code}] {message}")]
    Source {
        code: &'static str,
        message: String,
        class: FailureClass,
    },

    /// Storage error with code.
    #[error("[{code}] {message}")]
    Storage {
        code: &'static str,
        message: String,
        class: FailureClass,
    },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an event source error.
    pub fn source(code: SourceErrorCode, msg: impl Into<String>) -> Self {
        Self::Source {
            code: code.code(),
            message: msg.into(),
            class: code.class(),
        }
    }

    /// Create a storage error.
    pub fn storage(code: StorageErrorCode, msg: impl Into<String>) -> Self {
        Self::Storage {
            code: code.code(),
            message: msg.into(),
            class: code.class(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient failures are retried; everything else fails fast.
    ///
    /// An exhausted retry is itself permanent: the budget is spent.
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Source { class, .. } | Self::Storage { class, .. } => *class,
            _ => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.classify().is_transient()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Storage refused specific rows; the same rows will keep failing but
    /// others in their batch may not.
    ///
    /// Any other permanent storage failure (DB_005) says nothing about the
    /// rows and is not a rejection.
    pub fn is_row_rejection(&self) -> bool {
        match self {
            Self::Storage { code, .. } => *code == StorageErrorCode::ConstraintViolation.code(),
            Self::Malformed(_) => true,
            _ => false,
        }
    }

    /// Get the error code if this is a coded error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Source { code, .. } | Self::Storage { code, .. } => Some(code),
            Self::RetriesExhausted { source, .. } => source.error_code(),
            _ => None,
        }
    }
}
