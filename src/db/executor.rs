//! Query execution: classification, policy checks, pooled execution with
//! streaming, cancellation, timeouts and per-type metrics.
//!
//! [`QueryExecutor::execute`] never fails. Every outcome, including policy
//! violations and driver errors, comes back as a [`QueryResult`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params_from_iter, Connection};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db::{
    lock_connection, CacheStats, ConnectionPool, ExecutionStatus, PlanCache, PooledConnection,
    QueryAnalyzer, QueryMetrics, QueryRequest, QueryResult, QueryType, SqlValue, TypeStats,
};
use crate::error::{ConfigError, ExecutionError};

/// Poll interval while waiting for an interrupted statement to return.
const INTERRUPT_RETRY: Duration = Duration::from_millis(50);

type ActiveMap = Mutex<HashMap<String, Arc<AtomicBool>>>;

pub struct QueryExecutor {
    pool: ConnectionPool,
    metrics: QueryMetrics,
    classifications: PlanCache<QueryType>,
    active: ActiveMap,
    allow_dangerous: bool,
}

impl QueryExecutor {
    pub fn new(
        pool: ConnectionPool,
        plan_cache_capacity: usize,
        allow_dangerous: bool,
    ) -> Result<Self, ConfigError> {
        let classifications =
            PlanCache::new(plan_cache_capacity).ok_or(ConfigError::ZeroCacheCapacity)?;
        Ok(Self {
            pool,
            metrics: QueryMetrics::new(),
            classifications,
            active: Mutex::new(HashMap::new()),
            allow_dangerous,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run `request` on a connection checked out for this call only.
    pub async fn execute(&self, request: &QueryRequest) -> QueryResult {
        self.run(request, None).await
    }

    /// Run `request` on a connection the caller already holds, typically one
    /// pinned to an open transaction. No transaction is opened or committed.
    pub async fn execute_on(&self, conn: &PooledConnection, request: &QueryRequest) -> QueryResult {
        self.run(request, Some(conn)).await
    }

    /// Request cooperative cancellation. Returns false if `query_id` is not
    /// currently running.
    pub fn cancel(&self, query_id: &str) -> bool {
        match self.lock_active().get(query_id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                info!(query_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn active_queries(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_active().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn metrics(&self) -> BTreeMap<QueryType, TypeStats> {
        self.metrics.snapshot()
    }

    pub fn plan_cache_stats(&self) -> CacheStats {
        self.classifications.stats()
    }

    /// Statement type, memoized by fingerprint.
    pub fn classify(&self, sql: &str) -> QueryType {
        if let Some(query_type) = self.classifications.get(sql) {
            return query_type;
        }
        let query_type = QueryAnalyzer::determine_type(sql);
        self.classifications.put(sql, query_type);
        query_type
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, query_id: &str) -> Result<Registration<'_>, ExecutionError> {
        let mut active = self.lock_active();
        if active.contains_key(query_id) {
            return Err(ExecutionError::DuplicateQuery(query_id.to_string()));
        }
        let flag = Arc::new(AtomicBool::new(false));
        active.insert(query_id.to_string(), flag.clone());
        Ok(Registration {
            active: &self.active,
            query_id: query_id.to_string(),
            flag,
        })
    }

    async fn run(&self, request: &QueryRequest, pinned: Option<&PooledConnection>) -> QueryResult {
        let started = Instant::now();
        let registration = self.register(request.query_id());
        let query_type = self.classify(request.sql());
        let warnings = QueryAnalyzer::validate_security(request.sql(), self.allow_dangerous);

        let outcome = match &registration {
            Ok(registration) => {
                self.run_registered(request, query_type, &registration.flag, pinned, started)
                    .await
            }
            Err(e) => Err(e.clone()),
        };
        drop(registration);

        self.finish(request, query_type, warnings, outcome, started)
    }

    async fn run_registered(
        &self,
        request: &QueryRequest,
        query_type: QueryType,
        cancel: &Arc<AtomicBool>,
        pinned: Option<&PooledConnection>,
        started: Instant,
    ) -> Result<Fetched, ExecutionError> {
        if request.read_only() && !query_type.is_read_only() {
            return Err(ExecutionError::PolicyViolation);
        }

        let deadline = request.timeout().map(|timeout| started + timeout);
        let (handle, interrupt, checked_out) = match pinned {
            Some(conn) => (conn.handle(), conn.interrupt_handle(), None),
            None => {
                let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                let conn = self.pool.acquire(remaining).await?;
                (conn.handle(), conn.interrupt_handle(), Some(conn))
            }
        };

        let begin = match pinned {
            Some(_) => None,
            None if opens_transaction(query_type) => request.isolation_level().begin_statement(),
            None => None,
        };
        let statement = Statement {
            sql: request.sql().to_string(),
            params: request.params().to_vec(),
            query_type,
            begin,
            fetch_size: request.fetch_size(),
            row_limit: request.row_limit(),
            cancel: cancel.clone(),
        };

        // The blocking task owns a checked-out connection, so it goes back to
        // the pool only after the driver call returns, even if this future is
        // dropped first.
        let mut task = tokio::task::spawn_blocking(move || {
            let outcome = statement.run(&lock_connection(&handle));
            drop(checked_out);
            outcome
        });

        let joined = match deadline {
            None => (&mut task).await,
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Stop at the next batch boundary if the interrupt lands
                    // before the statement starts stepping.
                    cancel.store(true, Ordering::Release);
                    loop {
                        interrupt.interrupt();
                        if tokio::time::timeout(INTERRUPT_RETRY, &mut task).await.is_ok() {
                            break;
                        }
                    }
                    return Err(ExecutionError::Timeout);
                }
            },
        };
        joined.map_err(|e| ExecutionError::Driver(format!("execution task failed: {e}")))?
    }

    fn finish(
        &self,
        request: &QueryRequest,
        query_type: QueryType,
        warnings: Vec<String>,
        outcome: Result<Fetched, ExecutionError>,
        started: Instant,
    ) -> QueryResult {
        let mut result = match outcome {
            Ok(fetched) => {
                let mut result = QueryResult::success(request, query_type, warnings);
                if fetched.cancelled {
                    result.status = ExecutionStatus::Cancelled;
                    result.error = Some(ExecutionError::Cancelled.to_string());
                }
                result.row_count = fetched.rows.len();
                result.rows = fetched.rows;
                result.columns = fetched.columns;
                result.affected_rows = fetched.affected_rows;
                result.last_insert_id = fetched.last_insert_id;
                result
            }
            Err(e) => QueryResult::failure(request, query_type, warnings, &e),
        };
        result.execution_time = started.elapsed();
        self.metrics.record(query_type, result.execution_time);

        let elapsed_ms = result.execution_time.as_secs_f64() * 1000.0;
        match result.status {
            ExecutionStatus::Success => debug!(
                query_id = %result.query_id,
                query_type = %query_type,
                rows = result.row_count,
                affected = result.affected_rows,
                elapsed_ms,
                "query succeeded"
            ),
            ExecutionStatus::Cancelled => info!(
                query_id = %result.query_id,
                query_type = %query_type,
                rows = result.row_count,
                elapsed_ms,
                "query cancelled"
            ),
            status => warn!(
                query_id = %result.query_id,
                query_type = %query_type,
                ?status,
                error = result.error.as_deref().unwrap_or_default(),
                elapsed_ms,
                "query failed"
            ),
        }
        result
    }
}

/// Removes the query's cancel flag once execution ends.
///
/// Dropping it also raises the flag, so a statement still queued on the
/// blocking pool after its caller went away is skipped instead of run.
struct Registration<'a> {
    active: &'a ActiveMap,
    query_id: String,
    flag: Arc<AtomicBool>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::Release);
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if active
            .get(&self.query_id)
            .is_some_and(|flag| Arc::ptr_eq(flag, &self.flag))
        {
            active.remove(&self.query_id);
        }
    }
}

/// Statements that manage transactions or the database file themselves and
/// cannot run inside a `BEGIN`.
fn opens_transaction(query_type: QueryType) -> bool {
    !matches!(
        query_type,
        QueryType::Begin
            | QueryType::Commit
            | QueryType::Rollback
            | QueryType::Pragma
            | QueryType::Attach
            | QueryType::Detach
            | QueryType::Vacuum
    )
}

#[derive(Debug, Default)]
struct Fetched {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    affected_rows: usize,
    last_insert_id: Option<i64>,
    cancelled: bool,
}

/// Everything the blocking thread needs to run one statement.
struct Statement {
    sql: String,
    params: Vec<SqlValue>,
    query_type: QueryType,
    begin: Option<&'static str>,
    fetch_size: usize,
    row_limit: Option<usize>,
    cancel: Arc<AtomicBool>,
}

impl Statement {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn run(self, conn: &Connection) -> Result<Fetched, ExecutionError> {
        if self.cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let Some(begin) = self.begin else {
            return self.run_statement(conn);
        };

        conn.execute_batch(begin)?;
        let outcome = self.run_statement(conn);
        let committed = match &outcome {
            Ok(fetched) if !fetched.cancelled => conn.execute_batch("COMMIT"),
            _ => Ok(()),
        };
        if outcome.as_ref().map_or(true, |f| f.cancelled) || committed.is_err() {
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %e, "rollback failed");
                }
            }
        }
        committed?;
        outcome
    }

    fn run_statement(&self, conn: &Connection) -> Result<Fetched, ExecutionError> {
        let mut stmt = conn.prepare_cached(&self.sql)?;
        let params = params_from_iter(self.params.iter());

        if self.query_type == QueryType::Select {
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();
            let mut cursor = stmt.query(params)?;
            let mut rows = Vec::new();
            let mut in_batch = 0;
            let mut cancelled = false;

            loop {
                if self.row_limit.is_some_and(|limit| rows.len() >= limit) {
                    break;
                }
                let Some(row) = cursor.next()? else {
                    break;
                };
                let values = (0..width)
                    .map(|i| row.get_ref(i).map(SqlValue::from))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.push(values);

                in_batch += 1;
                if in_batch == self.fetch_size {
                    in_batch = 0;
                    if self.cancelled() {
                        cancelled = true;
                        break;
                    }
                }
            }
            return Ok(Fetched {
                columns,
                rows,
                cancelled,
                ..Fetched::default()
            });
        }

        if stmt.column_count() > 0 {
            // e.g. PRAGMA, EXPLAIN or RETURNING: step to completion, discard rows
            let mut cursor = stmt.query(params)?;
            while cursor.next()?.is_some() {}
        } else {
            stmt.execute(params)?;
        }

        let writes = matches!(
            self.query_type,
            QueryType::Insert | QueryType::Update | QueryType::Delete
        );
        let affected_rows = if writes { conn.changes() as usize } else { 0 };
        let last_insert_id = if self.query_type == QueryType::Insert && affected_rows > 0 {
            Some(conn.last_insert_rowid()).filter(|id| *id != 0)
        } else {
            None
        };
        Ok(Fetched {
            affected_rows,
            last_insert_id,
            ..Fetched::default()
        })
    }
}
