//! Bounded connection pool with per-session lifecycle metrics.
//!
//! Total pool size is bounded by a semaphore whose wait queue is FIFO,
//! so contended acquirers are served fairly; uncontended acquirers pop
//! the idle stack LIFO to prefer warm caches. Each [`Session`] owns its
//! connection exclusively and returns it on drop; a session dropped
//! mid-transaction or after a connection-level error is discarded
//! instead of reused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, CopyInSink, Row, Statement};
use tracing::{debug, warn};

use crate::connection::Connector;
use crate::db::error::{DbError, Result};
use crate::statement_cache::{StatementCache, StatementKey};

/// Queries slower than this count toward `PoolStats::slow_queries`.
const SLOW_QUERY_MS: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_conn: usize,
    pub max_conn: usize,
    pub acquire_timeout: Duration,
    pub max_idle_age: Duration,
    pub cache_cap_per_session: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_conn: 5,
            max_conn: 32,
            acquire_timeout: Duration::from_millis(5000),
            max_idle_age: Duration::from_secs(300),
            cache_cap_per_session: 128,
        }
    }
}

/// Point-in-time snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolStats {
    pub min_size: usize,
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub total_created: u64,
    pub total_returned: u64,
    pub total_failed: u64,
    pub total_queries: u64,
    pub avg_query_ms: f64,
    pub slow_queries: u64,
    pub acquire_timeouts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_created: u64,
    total_returned: u64,
    total_failed: u64,
    total_queries: u64,
    total_query_ms: f64,
    slow_queries: u64,
    acquire_timeouts: u64,
}

/// A live connection plus its session-scoped state.
struct Conn {
    client: Client,
    statements: StatementCache<Statement>,
    last_used: Instant,
    usage_count: u64,
}

struct IdleEntry {
    conn: Conn,
    idle_since: Instant,
}

struct PoolState {
    idle: Vec<IdleEntry>,
    /// Connections in existence (idle + handed out).
    total: usize,
    in_use: usize,
}

struct PoolInner {
    connector: Connector,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    counters: Mutex<Counters>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Builds the pool and eagerly opens `min_conn` connections
    /// (best effort; a partially warm pool is still usable).
    pub async fn connect(connector: Connector, config: PoolConfig) -> Result<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                connector,
                permits: Arc::new(Semaphore::new(config.max_conn)),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                    in_use: 0,
                }),
                counters: Mutex::new(Counters::default()),
                closed: AtomicBool::new(false),
                config,
            }),
        };
        for _ in 0..pool.inner.config.min_conn {
            match pool.open_conn().await {
                Ok(conn) => pool.push_idle(conn),
                Err(e) => {
                    warn!(error = %e, "warmup connection failed");
                    break;
                }
            }
        }
        Ok(pool)
    }

    async fn open_conn(&self) -> Result<Conn> {
        match self.inner.connector.connect().await {
            Ok(client) => {
                let mut state = lock(&self.inner.state);
                state.total += 1;
                drop(state);
                lock(&self.inner.counters).total_created += 1;
                Ok(Conn {
                    client,
                    statements: StatementCache::new(self.inner.config.cache_cap_per_session),
                    last_used: Instant::now(),
                    usage_count: 0,
                })
            }
            Err(e) => {
                lock(&self.inner.counters).total_failed += 1;
                Err(e)
            }
        }
    }

    fn push_idle(&self, conn: Conn) {
        let mut state = lock(&self.inner.state);
        state.idle.push(IdleEntry {
            conn,
            idle_since: Instant::now(),
        });
    }

    fn pop_idle(&self) -> Option<Conn> {
        lock(&self.inner.state).idle.pop().map(|e| e.conn)
    }

    fn drop_conn(&self, conn: Conn) {
        drop(conn);
        lock(&self.inner.state).total -= 1;
    }

    /// Acquires a healthy session, blocking up to `timeout` under
    /// contention. Waiters queued on the size bound are served FIFO.
    pub async fn acquire(&self, timeout: Duration) -> Result<Session> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DbError::PoolClosed);
        }
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::PoolClosed),
            Err(_) => {
                lock(&self.inner.counters).acquire_timeouts += 1;
                return Err(DbError::PoolExhausted {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DbError::PoolClosed);
        }

        // Reuse an idle connection if one validates; otherwise open a
        // fresh one. The permit already reserves our slot in max_conn.
        let conn = loop {
            match self.pop_idle() {
                Some(conn) => {
                    if conn.client.is_closed() {
                        self.drop_conn(conn);
                        continue;
                    }
                    // Skip the ping for connections used moments ago.
                    if conn.last_used.elapsed() < Duration::from_secs(1) {
                        break conn;
                    }
                    match conn.client.simple_query("").await {
                        Ok(_) => break conn,
                        Err(e) => {
                            debug!(error = %e, "idle connection failed ping, discarding");
                            self.drop_conn(conn);
                        }
                    }
                }
                None => break self.open_conn().await?,
            }
        };

        lock(&self.inner.state).in_use += 1;
        Ok(Session {
            conn: Some(conn),
            _permit: permit,
            pool: Arc::clone(&self.inner),
            in_transaction: false,
            error_flag: false,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        let counters = lock(&self.inner.counters);
        PoolStats {
            min_size: self.inner.config.min_conn,
            max_size: self.inner.config.max_conn,
            in_use: state.in_use,
            idle: state.idle.len(),
            total_created: counters.total_created,
            total_returned: counters.total_returned,
            total_failed: counters.total_failed,
            total_queries: counters.total_queries,
            avg_query_ms: if counters.total_queries == 0 {
                0.0
            } else {
                counters.total_query_ms / counters.total_queries as f64
            },
            slow_queries: counters.slow_queries,
            acquire_timeouts: counters.acquire_timeouts,
        }
    }

    /// Closes idle connections past `max_idle_age` and tops the pool
    /// back up to `min_conn`. Driven by the orchestrator's scheduler.
    pub async fn sweep(&self) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let max_age = self.inner.config.max_idle_age;
        let stale: Vec<Conn> = {
            let mut state = lock(&self.inner.state);
            let now = Instant::now();
            let (stale, keep): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|e| now.duration_since(e.idle_since) > max_age || e.conn.client.is_closed());
            state.idle = keep;
            state.total -= stale.len();
            stale.into_iter().map(|e| e.conn).collect()
        };
        if !stale.is_empty() {
            debug!(count = stale.len(), "health sweep closed stale idle connections");
        }
        drop(stale);

        while {
            let state = lock(&self.inner.state);
            state.total < self.inner.config.min_conn
        } {
            match self.open_conn().await {
                Ok(conn) => self.push_idle(conn),
                Err(e) => {
                    debug!(error = %e, "health sweep could not replenish pool");
                    break;
                }
            }
        }
    }

    /// Drains idle connections and fails all future acquires. Sessions
    /// currently handed out are discarded when released.
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let drained: Vec<IdleEntry> = {
            let mut state = lock(&self.inner.state);
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        drop(drained);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A poisoned pool mutex means a panic mid-bookkeeping; the counters
    // are still structurally valid, so keep going.
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Whether a statement is routed through the per-session prepared
/// statement cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prepared {
    /// Cache when the statement has parameters.
    #[default]
    Auto,
    Never,
    Force,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    pub timeout_ms: Option<u64>,
    pub prepared: Prepared,
    pub read_only: bool,
}

/// Scoped handle to a pooled connection. Dropping the session releases
/// it: back to the idle list when clean, discarded when the error flag
/// is set or a transaction was left open.
pub struct Session {
    conn: Option<Conn>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
    in_transaction: bool,
    error_flag: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("in_transaction", &self.in_transaction)
            .field("error_flag", &self.error_flag)
            .finish()
    }
}

impl Session {
    fn conn_mut(&mut self) -> &mut Conn {
        // Invariant: `conn` is Some until drop.
        self.conn.as_mut().expect("session connection already released")
    }

    fn note_result<T>(
        &mut self,
        started: Instant,
        result: std::result::Result<T, tokio_postgres::Error>,
    ) -> Result<T> {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        {
            let mut counters = lock(&self.pool.counters);
            counters.total_queries += 1;
            counters.total_query_ms += elapsed_ms;
            if elapsed_ms >= SLOW_QUERY_MS {
                counters.slow_queries += 1;
            }
        }
        let conn = self.conn_mut();
        conn.last_used = Instant::now();
        conn.usage_count += 1;
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_closed() || e.code().is_none() {
                    self.error_flag = true;
                }
                Err(DbError::Postgres(e))
            }
        }
    }

    async fn prepared(&mut self, sql: &str) -> Result<Statement> {
        let key = StatementKey::new(sql);
        if let Some(stmt) = self.conn_mut().statements.get(&key) {
            return Ok(stmt);
        }
        let stmt = self.conn_mut().client.prepare(sql).await?;
        // An evicted handle is dropped here, which closes the
        // server-side statement.
        let _evicted = self.conn_mut().statements.put(key, stmt.clone());
        Ok(stmt)
    }

    /// Runs a statement and returns the affected-row count.
    pub async fn exec(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        options: ExecOptions,
    ) -> Result<u64> {
        let use_cache = match options.prepared {
            Prepared::Force => true,
            Prepared::Never => false,
            Prepared::Auto => !params.is_empty(),
        };
        if options.read_only && !self.in_transaction {
            self.batch("BEGIN READ ONLY").await?;
            let result = self.exec_inner(sql, params, options.timeout_ms, use_cache).await;
            match &result {
                Ok(_) => self.batch("COMMIT").await?,
                Err(_) => {
                    let _ = self.batch("ROLLBACK").await;
                }
            }
            return result;
        }
        self.exec_inner(sql, params, options.timeout_ms, use_cache).await
    }

    async fn exec_inner(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        timeout_ms: Option<u64>,
        use_cache: bool,
    ) -> Result<u64> {
        let Some(ms) = timeout_ms else {
            return self.exec_raw(sql, params, use_cache).await;
        };
        let result =
            tokio::time::timeout(Duration::from_millis(ms), self.exec_raw(sql, params, use_cache))
                .await;
        match result {
            Ok(r) => r,
            Err(_) => {
                // Connection state is unknown after a client-side
                // timeout; make sure it is not reused.
                self.error_flag = true;
                Err(DbError::StatementTimeout { ms })
            }
        }
    }

    async fn exec_raw(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        use_cache: bool,
    ) -> Result<u64> {
        let started = Instant::now();
        if use_cache {
            let stmt = self.prepared(sql).await?;
            let r = self.conn_mut().client.execute(&stmt, params).await;
            self.note_result(started, r)
        } else {
            let r = self.conn_mut().client.execute(sql, params).await;
            self.note_result(started, r)
        }
    }

    pub async fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        let started = Instant::now();
        if params.is_empty() {
            let r = self.conn_mut().client.query(sql, params).await;
            self.note_result(started, r)
        } else {
            let stmt = self.prepared(sql).await?;
            let r = self.conn_mut().client.query(&stmt, params).await;
            self.note_result(started, r)
        }
    }

    pub async fn query_one(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row> {
        let started = Instant::now();
        let r = self.conn_mut().client.query_one(sql, params).await;
        self.note_result(started, r)
    }

    pub async fn query_opt(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        let started = Instant::now();
        let r = self.conn_mut().client.query_opt(sql, params).await;
        self.note_result(started, r)
    }

    /// Runs one or more statements without parameters (SET, DDL,
    /// transaction control).
    pub async fn batch(&mut self, sql: &str) -> Result<()> {
        let started = Instant::now();
        let r = self.conn_mut().client.batch_execute(sql).await;
        self.note_result(started, r)
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.batch("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.batch("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.batch("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    pub async fn copy_in(&mut self, sql: &str) -> Result<CopyInSink<Bytes>> {
        let started = Instant::now();
        let r = self.conn_mut().client.copy_in(sql).await;
        self.note_result(started, r)
    }

    /// Marks the session so its connection is discarded on release.
    pub fn flag_error(&mut self) {
        self.error_flag = true;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let discard = self.error_flag
            || self.in_transaction
            || conn.client.is_closed()
            || self.pool.closed.load(Ordering::Acquire);

        let mut state = lock(&self.pool.state);
        state.in_use -= 1;
        if discard {
            state.total -= 1;
            drop(state);
            if self.in_transaction {
                warn!("session released mid-transaction, discarding connection");
            } else {
                debug!(queries = conn.usage_count, "discarding session connection");
            }
            drop(conn);
        } else {
            state.idle.push(IdleEntry {
                conn,
                idle_since: Instant::now(),
            });
            drop(state);
            lock(&self.pool.counters).total_returned += 1;
        }
    }
}
