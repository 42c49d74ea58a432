use std::time::Duration;

use thiserror::Error;

use crate::db::{ExecutionStatus, QueryType};

/// Failures raised by the connection pool while handing out connections.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("timed out waiting for connection after {0:?}")]
    Timeout(Duration),
    #[error("failed to open connection: {0}")]
    Connect(String),
}

/// Everything that can end a query execution early.
///
/// These never escape [`QueryExecutor::execute`](crate::db::QueryExecutor::execute);
/// they are folded into a [`QueryResult`](crate::db::QueryResult) with the
/// matching [`ExecutionStatus`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("write operation not allowed in read-only mode")]
    PolicyViolation,
    #[error("{0}")]
    PoolExhausted(#[from] PoolError),
    #[error("query timed out")]
    Timeout,
    #[error("query was cancelled")]
    Cancelled,
    #[error("query id already running: {0}")]
    DuplicateQuery(String),
    #[error("{0}")]
    Driver(String),
}

impl ExecutionError {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionError::PolicyViolation => ExecutionStatus::Error,
            ExecutionError::PoolExhausted(_) => ExecutionStatus::Timeout,
            ExecutionError::Timeout => ExecutionStatus::Timeout,
            ExecutionError::Cancelled => ExecutionStatus::Cancelled,
            ExecutionError::DuplicateQuery(_) => ExecutionStatus::Error,
            ExecutionError::Driver(_) => ExecutionStatus::Error,
        }
    }
}

impl From<rusqlite::Error> for ExecutionError {
    fn from(err: rusqlite::Error) -> Self {
        ExecutionError::Driver(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransactionError {
    #[error("transaction not found: {0}")]
    NotFound(String),
    #[error("transaction already exists: {0}")]
    AlreadyExists(String),
    /// SQLite ended the transaction on its own, e.g. after an interrupted
    /// write or an `ON CONFLICT ROLLBACK` failure. Only `rollback` is accepted.
    #[error("transaction aborted and must be rolled back: {0}")]
    Aborted(String),
    #[error("{0} is not allowed inside a transaction; use commit or rollback")]
    ControlStatement(QueryType),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("{0}")]
    Driver(String),
}

impl From<rusqlite::Error> for TransactionError {
    fn from(err: rusqlite::Error) -> Self {
        TransactionError::Driver(err.to_string())
    }
}

/// Rejected request construction.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    #[error("fetch_size must be at least 1")]
    ZeroFetchSize,
    #[error("timeout must be a finite, non-negative number of seconds")]
    InvalidTimeout,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_connections must be greater than 0")]
    ZeroMaxConnections,
    #[error("min_connections ({min}) exceeds max_connections ({max})")]
    MinExceedsMax { min: usize, max: usize },
    #[error("plan_cache_capacity must be greater than 0")]
    ZeroCacheCapacity,
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to write config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A transactional execute that failed before producing a result.
#[derive(Debug, Error)]
pub enum TransactionRequestError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Failures bringing the engine up.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}
