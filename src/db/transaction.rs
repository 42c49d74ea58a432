//! Multi-statement transactions.
//!
//! Each transaction pins one pooled connection from `begin` until `commit` or
//! `rollback`, so every statement submitted under its id runs inside the same
//! SQLite transaction. Statements of one transaction run one at a time; other
//! transactions and plain executions proceed on their own connections.
//!
//! SQLite may end a transaction by itself, for instance when a write inside it
//! is interrupted by a timeout. The transaction is then marked aborted: further
//! statements and `commit` fail with [`TransactionError::Aborted`] and only
//! `rollback` closes it. `BEGIN`, `COMMIT` and `ROLLBACK` cannot be submitted
//! as statements.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::db::{
    IsolationLevel, PooledConnection, QueryExecutor, QueryRequest, QueryResult, QueryType,
};
use crate::error::TransactionError;

struct TransactionScope {
    conn: PooledConnection,
    statements: Vec<QueryRequest>,
    started_at: DateTime<Utc>,
    finished: bool,
    /// SQLite rolled the transaction back under us.
    aborted: bool,
}

type SharedScope = Arc<tokio::sync::Mutex<TransactionScope>>;

/// Summary of an open transaction.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub statement_count: usize,
    pub started_at: DateTime<Utc>,
}

pub struct TransactionManager {
    executor: Arc<QueryExecutor>,
    isolation: IsolationLevel,
    scopes: Mutex<HashMap<String, SharedScope>>,
}

impl TransactionManager {
    pub fn new(executor: Arc<QueryExecutor>, isolation: IsolationLevel) -> Self {
        Self {
            executor,
            isolation,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedScope>> {
        self.scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scope(&self, transaction_id: &str) -> Result<SharedScope, TransactionError> {
        self.lock()
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| TransactionError::NotFound(transaction_id.to_string()))
    }

    /// Open a transaction on a freshly acquired connection.
    pub async fn begin(&self, transaction_id: Option<String>) -> Result<String, TransactionError> {
        let id = transaction_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        if self.lock().contains_key(&id) {
            return Err(TransactionError::AlreadyExists(id));
        }

        let conn = self.executor.pool().acquire(None).await?;
        // NONE still needs an explicit transaction to group statements
        let begin = self.isolation.begin_statement().unwrap_or("BEGIN");
        conn.with_connection(move |c| c.execute_batch(begin))
            .await
            .map_err(|e| TransactionError::Driver(format!("begin task failed: {e}")))??;

        let mut scopes = self.lock();
        if scopes.contains_key(&id) {
            // lost a race with a concurrent begin; the connection rolls back on release
            return Err(TransactionError::AlreadyExists(id));
        }
        info!(transaction_id = %id, connection_id = conn.id(), mode = begin, "transaction started");
        scopes.insert(
            id.clone(),
            Arc::new(tokio::sync::Mutex::new(TransactionScope {
                conn,
                statements: Vec::new(),
                started_at: Utc::now(),
                finished: false,
                aborted: false,
            })),
        );
        Ok(id)
    }

    /// Log `request` under the transaction and run it on the pinned connection.
    pub async fn execute_in_transaction(
        &self,
        transaction_id: &str,
        request: &QueryRequest,
    ) -> Result<QueryResult, TransactionError> {
        let scope = self.scope(transaction_id)?;
        let mut scope = scope.lock().await;
        if scope.finished {
            return Err(TransactionError::NotFound(transaction_id.to_string()));
        }
        if scope.aborted {
            return Err(TransactionError::Aborted(transaction_id.to_string()));
        }
        let query_type = self.executor.classify(request.sql());
        if matches!(
            query_type,
            QueryType::Begin | QueryType::Commit | QueryType::Rollback
        ) {
            return Err(TransactionError::ControlStatement(query_type));
        }

        scope.statements.push(request.clone());
        let result = self.executor.execute_on(&scope.conn, request).await;

        let ended = scope
            .conn
            .with_connection(|c| c.is_autocommit())
            .await
            .map_err(|e| TransactionError::Driver(format!("state check failed: {e}")))?;
        if ended {
            warn!(
                transaction_id,
                query_id = %result.query_id,
                status = result.status.as_str(),
                "transaction rolled back by the database"
            );
            scope.aborted = true;
        }
        Ok(result)
    }

    pub async fn commit(&self, transaction_id: &str) -> Result<(), TransactionError> {
        self.finish(transaction_id, "COMMIT").await
    }

    pub async fn rollback(&self, transaction_id: &str) -> Result<(), TransactionError> {
        self.finish(transaction_id, "ROLLBACK").await
    }

    /// Roll back every open transaction. Used at shutdown.
    pub async fn rollback_all(&self) -> usize {
        let mut rolled_back = 0;
        for id in self.active() {
            match self.rollback(&id).await {
                Ok(()) => rolled_back += 1,
                Err(e) => warn!(transaction_id = %id, error = %e, "rollback at shutdown failed"),
            }
        }
        rolled_back
    }

    async fn finish(&self, transaction_id: &str, statement: &'static str) -> Result<(), TransactionError> {
        let scope = self
            .lock()
            .remove(transaction_id)
            .ok_or_else(|| TransactionError::NotFound(transaction_id.to_string()))?;
        let mut scope = scope.lock().await;
        scope.finished = true;
        let committing = statement == "COMMIT";
        if committing && scope.aborted {
            return Err(TransactionError::Aborted(transaction_id.to_string()));
        }

        let outcome = scope
            .conn
            .with_connection(move |c| {
                if c.is_autocommit() {
                    return Ok(false);
                }
                c.execute_batch(statement).map(|_| true)
            })
            .await
            .map_err(|e| TransactionError::Driver(format!("{statement} task failed: {e}")))?;

        let count = scope.statements.len();
        match outcome {
            // nothing left to commit: the database already rolled back
            Ok(false) if committing => {
                warn!(transaction_id, statements = count, "commit of aborted transaction");
                Err(TransactionError::Aborted(transaction_id.to_string()))
            }
            Ok(_) => {
                info!(
                    transaction_id,
                    statements = count,
                    action = statement,
                    "transaction finished"
                );
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id, action = statement, error = %e, "transaction end failed");
                Err(e.into())
            }
        }
    }

    /// Requests submitted so far, in order.
    pub async fn statements(&self, transaction_id: &str) -> Result<Vec<QueryRequest>, TransactionError> {
        let scope = self.scope(transaction_id)?;
        let scope = scope.lock().await;
        Ok(scope.statements.clone())
    }

    pub async fn info(&self, transaction_id: &str) -> Result<TransactionInfo, TransactionError> {
        let scope = self.scope(transaction_id)?;
        let scope = scope.lock().await;
        Ok(TransactionInfo {
            transaction_id: transaction_id.to_string(),
            statement_count: scope.statements.len(),
            started_at: scope.started_at,
        })
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, ExecutionStatus, PoolConfig, SqlValue};
    use std::time::Duration;

    async fn setup() -> (tempfile::TempDir, Arc<QueryExecutor>, TransactionManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.db").to_str().unwrap().to_string();
        let config = PoolConfig {
            min_connections: 1,
            max_connections: 3,
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(path, config).unwrap();
        let executor = Arc::new(QueryExecutor::new(pool, 16, false).unwrap());
        let create = executor
            .execute(&QueryRequest::new("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)"))
            .await;
        assert!(create.is_success());
        let manager = TransactionManager::new(executor.clone(), IsolationLevel::Deferred);
        (dir, executor, manager)
    }

    async fn count(executor: &QueryExecutor) -> i64 {
        let result = executor
            .execute(&QueryRequest::new("SELECT COUNT(*) FROM t"))
            .await;
        match result.rows[0][0] {
            SqlValue::Integer(n) => n,
            ref other => panic!("unexpected count {other:?}"),
        }
    }

    fn insert(v: &str) -> QueryRequest {
        QueryRequest::builder("INSERT INTO t (v) VALUES (?)")
            .params([SqlValue::from(v)])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let (_dir, executor, manager) = setup().await;
        let tx = manager.begin(None).await.unwrap();

        let first = manager.execute_in_transaction(&tx, &insert("a")).await.unwrap();
        assert!(first.is_success(), "{:?}", first.error);
        manager.execute_in_transaction(&tx, &insert("b")).await.unwrap();

        // other connections do not see uncommitted rows
        assert_eq!(count(&executor).await, 0);

        // but the transaction itself does
        let inside = manager
            .execute_in_transaction(&tx, &QueryRequest::new("SELECT COUNT(*) FROM t"))
            .await
            .unwrap();
        assert_eq!(inside.rows[0][0], SqlValue::Integer(2));

        manager.commit(&tx).await.unwrap();
        assert_eq!(count(&executor).await, 2);
        assert!(manager.active().is_empty());
        assert_eq!(executor.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (_dir, executor, manager) = setup().await;
        let tx = manager.begin(Some("tx-rollback".into())).await.unwrap();
        assert_eq!(tx, "tx-rollback");

        manager.execute_in_transaction(&tx, &insert("a")).await.unwrap();
        manager.rollback(&tx).await.unwrap();

        assert_eq!(count(&executor).await, 0);
        assert_eq!(executor.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let (_dir, _executor, manager) = setup().await;
        let err = manager
            .execute_in_transaction("nope", &insert("a"))
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::NotFound("nope".into()));
        assert_eq!(err.to_string(), "transaction not found: nope");
        assert!(matches!(
            manager.commit("nope").await,
            Err(TransactionError::NotFound(_))
        ));
        assert!(matches!(
            manager.rollback("nope").await,
            Err(TransactionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_twice_fails() {
        let (_dir, _executor, manager) = setup().await;
        let tx = manager.begin(None).await.unwrap();
        manager.commit(&tx).await.unwrap();
        assert!(matches!(
            manager.commit(&tx).await,
            Err(TransactionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (_dir, executor, manager) = setup().await;
        manager.begin(Some("dup".into())).await.unwrap();
        let err = manager.begin(Some("dup".into())).await.unwrap_err();
        assert_eq!(err, TransactionError::AlreadyExists("dup".into()));
        assert_eq!(executor.pool().stats().in_use, 1);
        manager.rollback("dup").await.unwrap();
    }

    #[tokio::test]
    async fn test_statement_log() {
        let (_dir, _executor, manager) = setup().await;
        let tx = manager.begin(None).await.unwrap();
        manager.execute_in_transaction(&tx, &insert("a")).await.unwrap();
        manager
            .execute_in_transaction(&tx, &QueryRequest::new("SELECT * FROM t"))
            .await
            .unwrap();

        let log = manager.statements(&tx).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].sql(), "SELECT * FROM t");
        assert_eq!(manager.info(&tx).await.unwrap().statement_count, 2);
        manager.rollback(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_policy_applies_inside_transaction() {
        let (_dir, _executor, manager) = setup().await;
        let tx = manager.begin(None).await.unwrap();
        let req = QueryRequest::builder("DELETE FROM t")
            .read_only(true)
            .build()
            .unwrap();
        let result = manager.execute_in_transaction(&tx, &req).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);
        manager.rollback(&tx).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupted_write_aborts_transaction() {
        let (_dir, executor, manager) = setup().await;
        let tx = manager.begin(None).await.unwrap();
        manager.execute_in_transaction(&tx, &insert("a")).await.unwrap();

        let slow = QueryRequest::builder(
            "INSERT INTO t (v) SELECT x FROM (WITH RECURSIVE c(x) AS \
             (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100000000) SELECT x FROM c)",
        )
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
        let timed_out = manager.execute_in_transaction(&tx, &slow).await.unwrap();
        assert_eq!(timed_out.status, ExecutionStatus::Timeout);

        let err = manager
            .execute_in_transaction(&tx, &insert("b"))
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::Aborted(tx.clone()));
        assert_eq!(manager.statements(&tx).await.unwrap().len(), 2);

        manager.rollback(&tx).await.unwrap();
        assert_eq!(count(&executor).await, 0);
        assert_eq!(executor.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_commit_after_conflict_rollback_fails() {
        let (_dir, executor, manager) = setup().await;
        let tx = manager.begin(None).await.unwrap();
        let first = QueryRequest::new("INSERT INTO t (id, v) VALUES (1, 'a')");
        manager.execute_in_transaction(&tx, &first).await.unwrap();

        let conflict = QueryRequest::new("INSERT OR ROLLBACK INTO t (id, v) VALUES (1, 'dup')");
        let result = manager.execute_in_transaction(&tx, &conflict).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);

        assert_eq!(
            manager.commit(&tx).await,
            Err(TransactionError::Aborted(tx.clone()))
        );
        assert!(manager.active().is_empty());
        assert_eq!(count(&executor).await, 0);
    }

    #[tokio::test]
    async fn test_control_statements_rejected() {
        let (_dir, executor, manager) = setup().await;
        let tx = manager.begin(None).await.unwrap();
        manager.execute_in_transaction(&tx, &insert("a")).await.unwrap();

        for sql in ["COMMIT", "rollback", "BEGIN IMMEDIATE"] {
            let err = manager
                .execute_in_transaction(&tx, &QueryRequest::new(sql))
                .await
                .unwrap_err();
            assert!(matches!(err, TransactionError::ControlStatement(_)), "{sql}: {err}");
        }
        assert_eq!(manager.statements(&tx).await.unwrap().len(), 1);

        // still open and still isolated
        assert_eq!(count(&executor).await, 0);
        manager.rollback(&tx).await.unwrap();
        assert_eq!(count(&executor).await, 0);
    }

    #[tokio::test]
    async fn test_rollback_all() {
        let (_dir, executor, manager) = setup().await;
        let a = manager.begin(None).await.unwrap();
        let b = manager.begin(None).await.unwrap();
        manager.execute_in_transaction(&a, &insert("a")).await.unwrap();
        assert_eq!(manager.active().len(), 2);
        assert!(manager.active().contains(&b));

        assert_eq!(manager.rollback_all().await, 2);
        assert!(manager.active().is_empty());
        assert_eq!(executor.pool().stats().in_use, 0);
        assert_eq!(count(&executor).await, 0);
    }
}
