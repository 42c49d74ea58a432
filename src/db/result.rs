use std::collections::HashMap;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::db::{QueryRequest, QueryType, SqlValue};
use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// Outcome of one executed request. Every execution path produces one.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query_id: String,
    pub status: ExecutionStatus,
    pub rows: Vec<Vec<SqlValue>>,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub affected_rows: usize,
    pub last_insert_id: Option<i64>,
    #[serde(serialize_with = "serialize_secs")]
    pub execution_time: Duration,
    pub query_type: QueryType,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QueryResult {
    /// An empty successful result for `request`, to be filled in by the executor.
    pub fn success(request: &QueryRequest, query_type: QueryType, warnings: Vec<String>) -> Self {
        Self {
            query_id: request.query_id().to_string(),
            status: ExecutionStatus::Success,
            rows: vec![],
            columns: vec![],
            row_count: 0,
            affected_rows: 0,
            last_insert_id: None,
            execution_time: Duration::ZERO,
            query_type,
            error: None,
            warnings,
            metadata: request.metadata().clone(),
        }
    }

    pub fn failure(
        request: &QueryRequest,
        query_type: QueryType,
        warnings: Vec<String>,
        err: &ExecutionError,
    ) -> Self {
        Self {
            status: err.status(),
            error: Some(err.to_string()),
            ..Self::success(request, query_type, warnings)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn execution_secs(&self) -> f64 {
        self.execution_time.as_secs_f64()
    }
}

fn serialize_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}
