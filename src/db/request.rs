use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::SqlValue;
use crate::error::RequestError;

pub const DEFAULT_FETCH_SIZE: usize = 1000;

/// Transaction mode opened around a single statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IsolationLevel {
    /// Run in SQLite's autocommit mode.
    None,
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl IsolationLevel {
    /// The `BEGIN` statement for this level, if any.
    pub fn begin_statement(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::None => None,
            IsolationLevel::Deferred => Some("BEGIN DEFERRED"),
            IsolationLevel::Immediate => Some("BEGIN IMMEDIATE"),
            IsolationLevel::Exclusive => Some("BEGIN EXCLUSIVE"),
        }
    }
}

/// An immutable description of one statement to run.
///
/// Built through [`QueryRequest::builder`]; fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    sql: String,
    params: Vec<SqlValue>,
    query_id: String,
    timeout: Option<Duration>,
    isolation_level: IsolationLevel,
    read_only: bool,
    row_limit: Option<usize>,
    fetch_size: usize,
    metadata: HashMap<String, serde_json::Value>,
}

impl QueryRequest {
    /// A request with all defaults. Infallible since defaults are valid.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            query_id: new_query_id(),
            timeout: None,
            isolation_level: IsolationLevel::default(),
            read_only: false,
            row_limit: None,
            fetch_size: DEFAULT_FETCH_SIZE,
            metadata: HashMap::new(),
        }
    }

    pub fn builder(sql: impl Into<String>) -> QueryRequestBuilder {
        QueryRequestBuilder {
            inner: Self::new(sql),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.row_limit
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }
}

pub struct QueryRequestBuilder {
    inner: QueryRequest,
}

impl QueryRequestBuilder {
    pub fn params(mut self, params: impl IntoIterator<Item = SqlValue>) -> Self {
        self.inner.params = params.into_iter().collect();
        self
    }

    pub fn query_id(mut self, id: impl Into<String>) -> Self {
        self.inner.query_id = id.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.inner.timeout = Some(timeout);
        self
    }

    /// Set the timeout from float seconds, as received over the wire.
    pub fn timeout_secs(mut self, secs: f64) -> Result<Self, RequestError> {
        let timeout = Duration::try_from_secs_f64(secs).map_err(|_| RequestError::InvalidTimeout)?;
        self.inner.timeout = Some(timeout);
        Ok(self)
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.inner.isolation_level = level;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.inner.read_only = read_only;
        self
    }

    /// Stop a SELECT after `limit` rows. `0` is a real limit and returns no
    /// rows; leave it unset for no limit.
    pub fn row_limit(mut self, limit: usize) -> Self {
        self.inner.row_limit = Some(limit);
        self
    }

    pub fn fetch_size(mut self, fetch_size: usize) -> Self {
        self.inner.fetch_size = fetch_size;
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.inner.metadata = metadata;
        self
    }

    pub fn build(self) -> Result<QueryRequest, RequestError> {
        if self.inner.fetch_size == 0 {
            return Err(RequestError::ZeroFetchSize);
        }
        Ok(self.inner)
    }
}

fn new_query_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let req = QueryRequest::new("SELECT 1");
        assert_eq!(req.sql(), "SELECT 1");
        assert!(req.params().is_empty());
        assert_eq!(req.query_id().len(), 32);
        assert_eq!(req.isolation_level(), IsolationLevel::Deferred);
        assert_eq!(req.fetch_size(), DEFAULT_FETCH_SIZE);
        assert!(!req.read_only());
        assert!(req.row_limit().is_none());
        assert!(req.timeout().is_none());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = QueryRequest::new("SELECT 1");
        let b = QueryRequest::new("SELECT 1");
        assert_ne!(a.query_id(), b.query_id());
    }

    #[test]
    fn test_builder() {
        let req = QueryRequest::builder("SELECT ?")
            .params([SqlValue::Integer(1)])
            .query_id("q1")
            .timeout(Duration::from_secs(2))
            .isolation_level(IsolationLevel::None)
            .read_only(true)
            .row_limit(5)
            .fetch_size(10)
            .build()
            .unwrap();
        assert_eq!(req.query_id(), "q1");
        assert_eq!(req.params(), &[SqlValue::Integer(1)]);
        assert_eq!(req.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(req.isolation_level(), IsolationLevel::None);
        assert!(req.read_only());
        assert_eq!(req.row_limit(), Some(5));
        assert_eq!(req.fetch_size(), 10);
    }

    #[test]
    fn test_zero_fetch_size_rejected() {
        let err = QueryRequest::builder("SELECT 1")
            .fetch_size(0)
            .build()
            .unwrap_err();
        assert_eq!(err, RequestError::ZeroFetchSize);
    }

    #[test]
    fn test_timeout_secs() {
        let req = QueryRequest::builder("SELECT 1")
            .timeout_secs(1.5)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.timeout(), Some(Duration::from_millis(1500)));
        assert!(QueryRequest::builder("SELECT 1").timeout_secs(-1.0).is_err());
        assert!(QueryRequest::builder("SELECT 1")
            .timeout_secs(f64::NAN)
            .is_err());
    }

    #[test]
    fn test_begin_statement() {
        assert_eq!(IsolationLevel::None.begin_statement(), None);
        assert_eq!(
            IsolationLevel::Immediate.begin_statement(),
            Some("BEGIN IMMEDIATE")
        );
    }
}
