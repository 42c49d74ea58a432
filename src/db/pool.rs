//! Connection pool with lifecycle management.
//!
//! Invariants kept under the state lock:
//! - a wrapper is either idle or checked out, never both;
//! - `idle + in_use + opening <= max_connections`, where `opening` counts
//!   slots reserved for connections still being opened.
//!
//! Waiters park on a [`Notify`] that is armed before the state is inspected,
//! so a release landing between the check and the wait is not lost.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{lock_connection, ConnectionSettings, ConnectionWrapper};
use crate::error::{ConfigError, PoolError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    /// Idle connections unused for longer than this are closed by maintenance.
    #[serde(rename = "max_idle_time_secs", with = "secs")]
    pub max_idle_time: Duration,
    /// Connections older than this are retired on release or by maintenance.
    #[serde(rename = "max_connection_age_secs", with = "secs")]
    pub max_connection_age: Duration,
    /// Used by `acquire(None)`.
    #[serde(rename = "acquire_timeout_secs", with = "secs")]
    pub acquire_timeout: Duration,
    #[serde(rename = "maintenance_interval_secs", with = "secs")]
    pub maintenance_interval: Duration,
    pub connection: ConnectionSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            max_idle_time: Duration::from_secs(300),
            max_connection_age: Duration::from_secs(3600),
            acquire_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(30),
            connection: ConnectionSettings::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_connections,
                max: self.max_connections,
            });
        }
        Ok(())
    }
}

/// Durations as (fractional) seconds in config files.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub total: usize,
    pub max_connections: usize,
    pub min_connections: usize,
    pub created_total: u64,
    pub closed_total: u64,
    pub closed: bool,
}

struct PoolState {
    idle: VecDeque<ConnectionWrapper>,
    in_use: HashMap<String, Arc<InterruptHandle>>,
    opening: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.opening
    }
}

enum Checkout {
    Ready(ConnectionWrapper),
    Open,
    Wait,
}

struct Maintenance {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct PoolInner {
    database: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    maintenance: Mutex<Option<Maintenance>>,
    created_total: AtomicU64,
    closed_total: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_checkout(&self) -> Result<Checkout, PoolError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if let Some(mut wrapper) = state.idle.pop_front() {
            wrapper.mark_in_use();
            state
                .in_use
                .insert(wrapper.id().to_string(), wrapper.interrupt_handle());
            return Ok(Checkout::Ready(wrapper));
        }
        if state.total() < self.config.max_connections {
            state.opening += 1;
            return Ok(Checkout::Open);
        }
        Ok(Checkout::Wait)
    }

    /// Reserve a slot for a background top-up, if still below the minimum.
    fn reserve_for_minimum(self: &Arc<Self>) -> Option<OpeningSlot> {
        let mut state = self.lock();
        if state.closed || state.total() >= self.config.min_connections {
            return None;
        }
        state.opening += 1;
        Some(OpeningSlot::new(self.clone()))
    }

    async fn open_wrapper(&self) -> Result<ConnectionWrapper, PoolError> {
        let wrapper = ConnectionWrapper::open(&self.database, &self.config.connection).await?;
        self.created_total.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = wrapper.id(), "created pooled connection");
        Ok(wrapper)
    }

    /// Open connections until the pool holds at least `min_connections`.
    async fn top_up(self: &Arc<Self>) -> Result<usize, PoolError> {
        let mut opened = 0;
        while let Some(slot) = self.reserve_for_minimum() {
            let wrapper = self.open_wrapper().await?;
            slot.into_idle(wrapper);
            opened += 1;
        }
        Ok(opened)
    }

    fn spawn_replacement(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime available; replacement deferred to maintenance");
            return;
        };
        let inner = self.clone();
        runtime.spawn(async move {
            if let Err(e) = inner.top_up().await {
                warn!(error = %e, "failed to create replacement connection");
            }
        });
    }

    fn release(self: &Arc<Self>, wrapper: ConnectionWrapper) {
        let handle = wrapper.handle();
        let busy = matches!(handle.try_lock(), Err(TryLockError::WouldBlock));
        drop(handle);

        // A statement is still running on a blocking thread (its caller went
        // away). Interrupt it and finish the release off the async runtime.
        if busy {
            wrapper.interrupt();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let inner = self.clone();
                runtime.spawn_blocking(move || inner.finish_release(wrapper));
                return;
            }
        }
        self.finish_release(wrapper);
    }

    fn finish_release(self: &Arc<Self>, mut wrapper: ConnectionWrapper) {
        let healthy = match wrapper.reset() {
            Ok(true) => {
                debug!(connection_id = wrapper.id(), "rolled back abandoned transaction");
                true
            }
            Ok(false) => true,
            Err(e) => {
                warn!(connection_id = wrapper.id(), error = %e, "failed to reset connection");
                false
            }
        };
        wrapper.mark_available();

        let mut state = self.lock();
        state.in_use.remove(wrapper.id());

        if state.closed {
            drop(state);
            self.discard(wrapper, "pool closed");
        } else if !healthy || wrapper.age() >= self.config.max_connection_age {
            let below_min = state.total() < self.config.min_connections;
            drop(state);
            self.discard(wrapper, if healthy { "max age exceeded" } else { "unhealthy" });
            if below_min {
                self.spawn_replacement();
            }
        } else {
            state.idle.push_back(wrapper);
        }
        self.available.notify_one();
    }

    fn discard(&self, wrapper: ConnectionWrapper, reason: &str) {
        self.closed_total.fetch_add(1, Ordering::Relaxed);
        debug!(
            connection_id = wrapper.id(),
            uses = wrapper.use_count(),
            reason,
            "closing pooled connection"
        );
        drop(wrapper);
    }

    /// Close idle connections past their idle or age limits, keeping at least
    /// `min_connections` in total.
    fn sweep(&self) -> usize {
        let mut state = self.lock();
        let mut total = state.total();
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(state.idle.len());

        for wrapper in state.idle.drain(..) {
            let stale = wrapper.idle_time() > self.config.max_idle_time
                || wrapper.age() > self.config.max_connection_age;
            if stale && total > self.config.min_connections {
                total -= 1;
                expired.push(wrapper);
            } else {
                kept.push_back(wrapper);
            }
        }
        state.idle = kept;
        drop(state);

        let removed = expired.len();
        for wrapper in expired {
            self.discard(wrapper, "expired");
        }
        removed
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            available: state.idle.len(),
            in_use: state.in_use.len(),
            total: state.idle.len() + state.in_use.len(),
            max_connections: self.config.max_connections,
            min_connections: self.config.min_connections,
            created_total: self.created_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }
}

/// A reserved `opening` slot. Dropping it unfulfilled gives the slot back.
struct OpeningSlot {
    pool: Option<Arc<PoolInner>>,
}

impl OpeningSlot {
    fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool: Some(pool) }
    }

    fn into_checked_out(mut self, mut wrapper: ConnectionWrapper) -> Result<PooledConnection, PoolError> {
        let pool = self.pool.take().expect("slot already consumed");
        let mut state = pool.lock();
        state.opening -= 1;
        if state.closed {
            drop(state);
            pool.discard(wrapper, "pool closed");
            return Err(PoolError::Closed);
        }
        wrapper.mark_in_use();
        state
            .in_use
            .insert(wrapper.id().to_string(), wrapper.interrupt_handle());
        drop(state);
        Ok(PooledConnection::new(wrapper, pool))
    }

    fn into_idle(mut self, wrapper: ConnectionWrapper) {
        let pool = self.pool.take().expect("slot already consumed");
        let mut state = pool.lock();
        state.opening -= 1;
        if state.closed {
            drop(state);
            pool.discard(wrapper, "pool closed");
            return;
        }
        state.idle.push_back(wrapper);
        drop(state);
        pool.available.notify_one();
    }
}

impl Drop for OpeningSlot {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.lock().opening -= 1;
            pool.available.notify_one();
        }
    }
}

/// Exclusive handle on a pooled connection. Returned to the pool on drop.
pub struct PooledConnection {
    wrapper: Option<ConnectionWrapper>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(wrapper: ConnectionWrapper, pool: Arc<PoolInner>) -> Self {
        Self {
            wrapper: Some(wrapper),
            pool,
        }
    }

    fn wrapper(&self) -> &ConnectionWrapper {
        self.wrapper.as_ref().expect("pooled connection missing")
    }

    pub fn id(&self) -> &str {
        self.wrapper().id()
    }

    pub fn use_count(&self) -> u64 {
        self.wrapper().use_count()
    }

    /// Shared handle for moving into `spawn_blocking`.
    pub fn handle(&self) -> Arc<Mutex<Connection>> {
        self.wrapper().handle()
    }

    /// Interrupts whatever statement is running on this connection. Usable
    /// after the guard itself has moved to another thread.
    pub fn interrupt_handle(&self) -> Arc<InterruptHandle> {
        self.wrapper().interrupt_handle()
    }

    /// Run `f` against the connection on the blocking thread pool.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, tokio::task::JoinError>
    where
        F: FnOnce(&mut Connection) -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.handle();
        tokio::task::spawn_blocking(move || {
            let mut conn = lock_connection(&handle);
            f(&mut conn)
        })
        .await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(wrapper) = self.wrapper.take() {
            self.pool.release(wrapper);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("wrapper", &self.wrapper)
            .finish()
    }
}

/// Pool of SQLite connections to a single database.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(database: impl Into<String>, config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                database: database.into(),
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: HashMap::new(),
                    opening: 0,
                    closed: false,
                }),
                available: Notify::new(),
                maintenance: Mutex::new(None),
                created_total: AtomicU64::new(0),
                closed_total: AtomicU64::new(0),
            }),
        })
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Open `min_connections` connections and start the maintenance task.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let opened = self.inner.top_up().await?;
        self.start_maintenance();
        info!(
            database = %self.inner.database,
            opened,
            min = self.inner.config.min_connections,
            max = self.inner.config.max_connections,
            "connection pool initialized"
        );
        Ok(())
    }

    fn start_maintenance(&self) {
        let mut slot = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(maintenance_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.maintenance_interval,
            rx,
        ));
        *slot = Some(Maintenance { shutdown, task });
    }

    /// Check out a connection, waiting up to `timeout` (or the configured
    /// `acquire_timeout`) for one to become available.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<PooledConnection, PoolError> {
        let timeout = timeout.unwrap_or(self.inner.config.acquire_timeout);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.try_checkout()? {
                Checkout::Ready(wrapper) => {
                    return Ok(PooledConnection::new(wrapper, self.inner.clone()));
                }
                Checkout::Open => {
                    let slot = OpeningSlot::new(self.inner.clone());
                    let wrapper = self.inner.open_wrapper().await?;
                    return slot.into_checked_out(wrapper);
                }
                Checkout::Wait => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(?timeout, "timed out waiting for pooled connection");
                return Err(PoolError::Timeout(timeout));
            }
        }
    }

    /// Run one maintenance pass now. Returns the number of connections closed.
    pub async fn run_maintenance(&self) -> usize {
        let removed = self.inner.sweep();
        if let Err(e) = self.inner.top_up().await {
            warn!(error = %e, "failed to restore minimum connections");
        }
        removed
    }

    /// Mark the pool closed, stop maintenance and close all connections.
    ///
    /// Idle connections close immediately. Statements running on checked-out
    /// connections are interrupted; those connections close when released.
    pub async fn close(&self) {
        let (idle, running) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            let running: Vec<_> = state.in_use.values().cloned().collect();
            (idle, running)
        };

        let maintenance = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(maintenance) = maintenance {
            let _ = maintenance.shutdown.send(true);
            if let Err(e) = maintenance.task.await {
                warn!(error = %e, "maintenance task ended abnormally");
            }
        }

        for handle in &running {
            handle.interrupt();
        }
        let closed = idle.len();
        for wrapper in idle {
            self.inner.discard(wrapper, "pool closed");
        }
        self.inner.available.notify_waiters();
        info!(
            closed,
            interrupted = running.len(),
            "connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

async fn maintenance_loop(
    pool: Weak<PoolInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        let removed = inner.sweep();
        if removed > 0 {
            info!(removed, "closed expired idle connections");
        }
        if let Err(e) = inner.top_up().await {
            warn!(error = %e, "failed to restore minimum connections");
        }
    }
    debug!("pool maintenance stopped");
}
