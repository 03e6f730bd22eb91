//! Mapping driver failures onto storage error codes.

use deadpool_postgres::PoolError;
use ingest_core::{Error, StorageErrorCode};
use tokio_postgres::error::SqlState;

/// Classify a driver error by SQLSTATE.
pub fn map_pg_error(context: &str, err: tokio_postgres::Error) -> Error {
    let code = match err.code() {
        Some(state) => classify_sqlstate(state),
        // No SQLSTATE: the connection broke before the server answered.
        None => StorageErrorCode::Unavailable,
    };
    Error::storage(code, format!("{}: {}", context, err))
}

pub fn map_pool_error(context: &str, err: PoolError) -> Error {
    match err {
        PoolError::Backend(e) => map_pg_error(context, e),
        timeout @ PoolError::Timeout(_) => Error::storage(
            StorageErrorCode::Timeout,
            format!("{}: {}", context, timeout),
        ),
        other => Error::storage(
            StorageErrorCode::Unavailable,
            format!("{}: {}", context, other),
        ),
    }
}

fn classify_sqlstate(state: &SqlState) -> StorageErrorCode {
    if *state == SqlState::T_R_SERIALIZATION_FAILURE || *state == SqlState::T_R_DEADLOCK_DETECTED {
        return StorageErrorCode::Conflict;
    }
    if *state == SqlState::QUERY_CANCELED || *state == SqlState::LOCK_NOT_AVAILABLE {
        return StorageErrorCode::Timeout;
    }

    match &state.code()[..2] {
        // integrity_constraint_violation, data_exception
        "23" | "22" => StorageErrorCode::ConstraintViolation,
        // connection_exception, insufficient_resources, operator_intervention
        "08" | "53" | "57" => StorageErrorCode::Unavailable,
        _ => StorageErrorCode::Query,
    }
}
