//! Service object behind the HTTP layer.
//!
//! Each public method corresponds to one endpoint; bodies and responses are
//! serde types so the transport only has to (de)serialize them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineConfig;
use crate::db::{
    get_tables, CacheStats, ConnectionPool, IsolationLevel, PoolStats, QueryExecutor, QueryRequest,
    QueryResult, QueryType, SqlValue, TableInfo, TableType, TransactionManager, TypeStats,
    DEFAULT_FETCH_SIZE,
};
use crate::error::{
    EngineError, ExecutionError, RequestError, TransactionError, TransactionRequestError,
};

/// Body of `POST /execute` and `POST /transaction/{id}/execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteBody {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_size: Option<usize>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecuteBody {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Self::default()
        }
    }

    pub fn into_request(self) -> Result<QueryRequest, RequestError> {
        let mut builder = QueryRequest::builder(self.sql)
            .params(self.params.iter().map(SqlValue::from_json))
            .read_only(self.read_only)
            .fetch_size(self.fetch_size.unwrap_or(DEFAULT_FETCH_SIZE))
            .metadata(self.metadata);
        if let Some(id) = self.query_id {
            builder = builder.query_id(id);
        }
        if let Some(secs) = self.timeout {
            builder = builder.timeout_secs(secs)?;
        }
        if let Some(level) = self.isolation_level {
            builder = builder.isolation_level(level);
        }
        if let Some(limit) = self.row_limit {
            builder = builder.row_limit(limit);
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchBody {
    #[serde(default)]
    pub queries: Vec<ExecuteBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BeginResponse {
    pub transaction_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitResponse {
    pub committed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackResponse {
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    /// Seconds since the engine started.
    pub uptime: f64,
    pub pool: PoolStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub request_count: u64,
    pub query_metrics: BTreeMap<QueryType, TypeStats>,
    pub pool_stats: PoolStats,
    pub plan_cache: CacheStats,
    pub active_queries: Vec<String>,
    pub active_transactions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaReport {
    /// Table name to its CREATE statement.
    pub schema: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TablesReport {
    pub tables: Vec<String>,
}

pub struct SqlEngine {
    executor: Arc<QueryExecutor>,
    transactions: TransactionManager,
    started_at: Instant,
    request_count: AtomicU64,
}

impl SqlEngine {
    /// Build the pool, open its minimum connections and start maintenance.
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let pool = ConnectionPool::new(config.database.clone(), config.pool.clone())?;
        pool.initialize().await?;
        let executor = Arc::new(QueryExecutor::new(
            pool,
            config.plan_cache_capacity,
            config.allow_dangerous,
        )?);
        let transactions = TransactionManager::new(executor.clone(), config.transaction_isolation);
        info!(database = %config.database, "sql engine started");
        Ok(Self {
            executor,
            transactions,
            started_at: Instant::now(),
            request_count: AtomicU64::new(0),
        })
    }

    /// Roll back open transactions and close the pool.
    pub async fn shutdown(&self) {
        let rolled_back = self.transactions.rollback_all().await;
        self.executor.pool().close().await;
        info!(rolled_back, "sql engine stopped");
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    fn count_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn execute(&self, body: ExecuteBody) -> Result<QueryResult, RequestError> {
        self.count_request();
        let request = body.into_request()?;
        Ok(self.executor.execute(&request).await)
    }

    /// Run each query in order. A failing query does not stop the batch.
    pub async fn execute_batch(&self, body: BatchBody) -> Result<BatchResponse, RequestError> {
        self.count_request();
        let requests = body
            .queries
            .into_iter()
            .map(ExecuteBody::into_request)
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = Vec::with_capacity(requests.len());
        for request in &requests {
            results.push(self.executor.execute(request).await);
        }
        Ok(BatchResponse { results })
    }

    pub fn cancel(&self, query_id: &str) -> CancelResponse {
        CancelResponse {
            cancelled: self.executor.cancel(query_id),
        }
    }

    pub async fn begin_transaction(
        &self,
        transaction_id: Option<String>,
    ) -> Result<BeginResponse, TransactionError> {
        let transaction_id = self.transactions.begin(transaction_id).await?;
        Ok(BeginResponse { transaction_id })
    }

    pub async fn execute_in_transaction(
        &self,
        transaction_id: &str,
        body: ExecuteBody,
    ) -> Result<QueryResult, TransactionRequestError> {
        self.count_request();
        let request = body.into_request()?;
        Ok(self
            .transactions
            .execute_in_transaction(transaction_id, &request)
            .await?)
    }

    pub async fn commit(&self, transaction_id: &str) -> Result<CommitResponse, TransactionError> {
        self.transactions.commit(transaction_id).await?;
        Ok(CommitResponse { committed: true })
    }

    pub async fn rollback(&self, transaction_id: &str) -> Result<RollbackResponse, TransactionError> {
        self.transactions.rollback(transaction_id).await?;
        Ok(RollbackResponse { rolled_back: true })
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            uptime: self.started_at.elapsed().as_secs_f64(),
            pool: self.executor.pool().stats(),
        }
    }

    pub fn metrics(&self) -> MetricsReport {
        MetricsReport {
            request_count: self.request_count.load(Ordering::Relaxed),
            query_metrics: self.executor.metrics(),
            pool_stats: self.executor.pool().stats(),
            plan_cache: self.executor.plan_cache_stats(),
            active_queries: self.executor.active_queries(),
            active_transactions: self.transactions.active(),
        }
    }

    pub async fn schema(&self) -> Result<SchemaReport, ExecutionError> {
        let schema = self
            .catalog()
            .await?
            .into_iter()
            .map(|table| (table.name, table.sql))
            .collect();
        Ok(SchemaReport { schema })
    }

    pub async fn tables(&self) -> Result<TablesReport, ExecutionError> {
        let tables = self.catalog().await?.into_iter().map(|t| t.name).collect();
        Ok(TablesReport { tables })
    }

    async fn catalog(&self) -> Result<Vec<TableInfo>, ExecutionError> {
        let conn = self.executor.pool().acquire(None).await?;
        let tables = conn
            .with_connection(|c| get_tables(c))
            .await
            .map_err(|e| ExecutionError::Driver(format!("catalog task failed: {e}")))??;
        Ok(tables
            .into_iter()
            .filter(|t| t.table_type == TableType::Table)
            .collect())
    }
}
