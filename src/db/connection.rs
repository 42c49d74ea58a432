use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PoolError;

/// Per-connection SQLite settings, applied once when a connection is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub journal_mode: String,
    pub synchronous: String,
    pub cache_size: i64,
    pub temp_store: String,
    /// How long SQLite retries a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Capacity of rusqlite's per-connection prepared statement cache.
    pub statement_cache_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            journal_mode: String::from("WAL"),
            synchronous: String::from("NORMAL"),
            cache_size: 10_000,
            temp_store: String::from("MEMORY"),
            busy_timeout_ms: 5_000,
            statement_cache_capacity: 64,
        }
    }
}

/// Open and configure a new connection to `database`.
///
/// Accepts plain paths, `:memory:` and `file:` URIs.
pub fn open_connection(database: &str, settings: &ConnectionSettings) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(database, flags)?;

    // journal_mode answers with the mode actually in effect; in-memory
    // databases report "memory" whatever was requested.
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", &settings.journal_mode, |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", &settings.synchronous)?;
    conn.pragma_update(None, "cache_size", settings.cache_size)?;
    conn.pragma_update(None, "temp_store", &settings.temp_store)?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;
    conn.set_prepared_statement_cache_capacity(settings.statement_cache_capacity);

    debug!(database, journal_mode = %mode, "opened sqlite connection");
    Ok(conn)
}

static NEXT_WRAPPER_ID: AtomicU64 = AtomicU64::new(1);

/// A pool-owned database handle plus its usage bookkeeping.
///
/// The handle sits behind a mutex so driver work can be moved onto the
/// blocking thread pool while the wrapper itself stays with its guard.
pub struct ConnectionWrapper {
    id: String,
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    in_use: bool,
}

impl ConnectionWrapper {
    pub fn new(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        let seq = NEXT_WRAPPER_ID.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Self {
            id: format!("{:08x}", seq),
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            created_at: now,
            last_used: now,
            use_count: 0,
            in_use: false,
        }
    }

    /// Open a configured connection on the blocking pool and wrap it.
    pub async fn open(database: &str, settings: &ConnectionSettings) -> Result<Self, PoolError> {
        let database = database.to_string();
        let settings = settings.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&database, &settings))
            .await
            .map_err(|e| PoolError::Connect(format!("connection task failed: {e}")))?
            .map_err(|e| PoolError::Connect(e.to_string()))?;
        Ok(Self::new(conn))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Shared handle for moving into `spawn_blocking`.
    pub fn handle(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    pub fn interrupt_handle(&self) -> Arc<InterruptHandle> {
        self.interrupt.clone()
    }

    /// Abort whatever statement is currently running on this connection.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn mark_in_use(&mut self) {
        self.in_use = true;
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    pub fn mark_available(&mut self) {
        self.in_use = false;
        self.last_used = Instant::now();
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Roll back a transaction left open on the handle, if any.
    ///
    /// Returns true when a rollback was issued.
    pub fn reset(&self) -> rusqlite::Result<bool> {
        let conn = lock_connection(&self.conn);
        if conn.is_autocommit() {
            return Ok(false);
        }
        conn.execute_batch("ROLLBACK")?;
        Ok(true)
    }
}

impl std::fmt::Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWrapper")
            .field("id", &self.id)
            .field("in_use", &self.in_use)
            .field("use_count", &self.use_count)
            .field("age", &self.age())
            .finish()
    }
}

/// Lock a connection mutex, recovering from poisoning.
///
/// A panic on the blocking thread leaves the handle itself intact; the next
/// user resets any dangling transaction.
pub fn lock_connection(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_applies_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.db");
        let conn = open_connection(path.to_str().unwrap(), &ConnectionSettings::default()).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let cache_size: i64 = conn
            .query_row("PRAGMA cache_size", [], |row| row.get(0))
            .unwrap();
        assert_eq!(cache_size, 10_000);
        let temp_store: i64 = conn
            .query_row("PRAGMA temp_store", [], |row| row.get(0))
            .unwrap();
        assert_eq!(temp_store, 2); // MEMORY
    }

    #[test]
    fn test_open_in_memory() {
        let conn = open_connection(":memory:", &ConnectionSettings::default()).unwrap();
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_wrapper_bookkeeping() {
        let conn = Connection::open_in_memory().unwrap();
        let mut wrapper = ConnectionWrapper::new(conn);
        assert_eq!(wrapper.id().len(), 8);
        assert!(!wrapper.is_in_use());

        wrapper.mark_in_use();
        wrapper.mark_in_use();
        assert!(wrapper.is_in_use());
        assert_eq!(wrapper.use_count(), 2);

        wrapper.mark_available();
        assert!(!wrapper.is_in_use());
        assert!(wrapper.idle_time() < Duration::from_secs(1));
    }

    #[test]
    fn test_wrapper_ids_unique() {
        let a = ConnectionWrapper::new(Connection::open_in_memory().unwrap());
        let b = ConnectionWrapper::new(Connection::open_in_memory().unwrap());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_reset_rolls_back_open_transaction() {
        let wrapper = ConnectionWrapper::new(Connection::open_in_memory().unwrap());
        {
            let handle = wrapper.handle();
            let conn = lock_connection(&handle);
            conn.execute_batch("CREATE TABLE t (x INTEGER); BEGIN; INSERT INTO t VALUES (1);")
                .unwrap();
        }
        assert!(wrapper.reset().unwrap());
        assert!(!wrapper.reset().unwrap());

        let handle = wrapper.handle();
        let conn = lock_connection(&handle);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
