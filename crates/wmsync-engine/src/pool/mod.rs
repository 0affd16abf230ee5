//! Pooled target-database connections with health checks, retry/backoff
//! and failover signalling.
//!
//! Connections are synchronous ([`DbConnection`]); every call runs on the
//! blocking pool so a sync driver can be used from async code. Lease state
//! and health live behind the pool's own locks and are never exposed.

mod lease;
mod lookup;
mod postgres;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use wmsync_types::alert::Alert;
use wmsync_types::record::Record;
use wmsync_types::state::{CorrelationId, EntityName};

use crate::alert::AlertDispatcher;
use crate::config::PoolConfig;
use crate::error::{compute_backoff, ConnectionError, PoolError};

pub use lease::{ConnectionLease, Health};
pub use lookup::TargetKeyLookup;
pub use postgres::{PgConnection, PgConnector};

/// One open connection to the target database.
pub trait DbConnection: Send {
    /// Cheap liveness check.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the connection is unusable.
    fn ping(&mut self) -> Result<(), ConnectionError>;

    /// Write `records` for `entity` atomically, keyed by `primary_key`.
    /// Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the batch was not committed.
    fn commit_batch(
        &mut self,
        entity: &EntityName,
        primary_key: &str,
        records: &[Record],
    ) -> Result<u64, ConnectionError>;

    /// Whether the target holds a table for `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the catalog query fails.
    fn table_exists(&mut self, entity: &EntityName) -> Result<bool, ConnectionError>;

    /// Whether `entity` holds a committed row keyed `key`. A missing table
    /// holds no keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the query fails.
    fn key_exists(&mut self, entity: &EntityName, key: &str) -> Result<bool, ConnectionError>;
}

/// Opens new connections.
pub trait Connector: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if no connection could be established.
    fn connect(&self) -> Result<Box<dyn DbConnection>, ConnectionError>;
}

pub(crate) struct PooledConn {
    pub(crate) id: u64,
    pub(crate) conn: Box<dyn DbConnection>,
    pub(crate) health: Health,
}

/// Run `f` against `conn` on the blocking pool, handing the connection back.
pub(crate) async fn with_conn<T, F>(
    mut conn: PooledConn,
    f: F,
) -> Result<(PooledConn, T), ConnectionError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn DbConnection) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = f(conn.conn.as_mut());
        (conn, out)
    })
    .await
    .map_err(|e| ConnectionError::Fatal(format!("connection task panicked: {e}")))
}

/// Close `conn` on the blocking pool when called from a runtime. Synchronous
/// drivers block while shutting a connection down.
pub(crate) fn close(conn: PooledConn) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || drop(conn));
        }
        Err(_) => drop(conn),
    }
}

#[derive(Debug, Default)]
struct FailoverTracker {
    last_failover: Option<Instant>,
    healthy_since_last: bool,
}

impl FailoverTracker {
    /// Record one failover event; returns whether it escalates.
    fn record_failover(&mut self, now: Instant, window: Duration) -> bool {
        let escalate = matches!(
            self.last_failover,
            Some(prev) if !self.healthy_since_last && now.saturating_duration_since(prev) <= window
        );
        self.last_failover = if escalate { None } else { Some(now) };
        self.healthy_since_last = false;
        escalate
    }

    fn record_healthy(&mut self) {
        self.healthy_since_last = true;
    }
}

pub(crate) struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConn>>,
    alerts: Option<Arc<AlertDispatcher>>,
    failover: Mutex<FailoverTracker>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn take_idle(&self) -> Option<PooledConn> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Return a connection after its lease ends.
    pub(crate) fn release(&self, conn: PooledConn) {
        if conn.health == Health::Dead {
            tracing::debug!(conn_id = conn.id, "Discarding dead connection on release");
            close(conn);
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.config.pool_size {
            idle.push_back(conn);
        } else {
            drop(idle);
            tracing::debug!(conn_id = conn.id, "Closing overflow connection on release");
            close(conn);
        }
    }

    /// Apply a failure reported by a lease holder.
    pub(crate) fn mark_failed(&self, conn: &mut PooledConn, err: &ConnectionError) {
        if !err.is_connection_fault() {
            tracing::debug!(conn_id = conn.id, error = %err, "Statement rejected, connection kept");
            return;
        }
        conn.health = if err.is_transient() {
            Health::Degraded
        } else {
            Health::Dead
        };
        tracing::warn!(
            conn_id = conn.id,
            health = ?conn.health,
            error = %err,
            "Connection reported failed by lease holder"
        );
    }

    fn backoff(&self, attempt: u32) -> Duration {
        compute_backoff(
            self.config.backoff_base(),
            self.config.backoff_multiplier,
            attempt,
            self.config.max_wait(),
        )
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let idle = self.idle.get_mut().unwrap_or_else(PoisonError::into_inner);
        for conn in idle.drain(..) {
            close(conn);
        }
    }
}

enum HealthCheck {
    Healthy(PooledConn),
    Dead { conn_id: u64, error: ConnectionError },
    Cancelled,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub leased: usize,
    pub capacity: usize,
}

/// Fixed-size connection pool with bounded overflow.
///
/// At most `pool_size + max_overflow` leases exist at once; idle connections
/// beyond `pool_size` are closed on release.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        config: PoolConfig,
        alerts: Option<Arc<AlertDispatcher>>,
    ) -> Self {
        let capacity = config.capacity().max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(VecDeque::new()),
                alerts,
                failover: Mutex::new(FailoverTracker::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let capacity = self.inner.config.capacity().max(1);
        PoolStatus {
            idle: self
                .inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            leased: capacity - self.inner.permits.available_permits(),
            capacity,
        }
    }

    /// Lease a healthy connection, waiting up to `timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// See [`lease_for`](Self::lease_for).
    pub async fn lease(&self, timeout: Duration) -> Result<ConnectionLease, PoolError> {
        self.lease_for(timeout, "anonymous", None, &CancellationToken::new())
            .await
    }

    /// Lease a healthy connection on behalf of `owner`.
    ///
    /// Idle connections are pinged first. A failing ping is retried with
    /// exponential backoff; once retries are exhausted the connection is
    /// declared dead, evicted and replaced by a fresh one. A lease that had
    /// to evict raises one failover WARNING; two such leases inside the
    /// escalation window with no healthy lease between them raise a
    /// CRITICAL.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Exhausted`] when no slot frees up within `timeout`
    /// - [`PoolError::Unavailable`] when no replacement connection can be opened
    /// - [`PoolError::Transient`] when opening a connection kept failing transiently
    /// - [`PoolError::Cancelled`] when `cancel` fires first
    pub async fn lease_for(
        &self,
        timeout: Duration,
        owner: &str,
        correlation_id: Option<&CorrelationId>,
        cancel: &CancellationToken,
    ) -> Result<ConnectionLease, PoolError> {
        let permits = Arc::clone(&self.inner.permits);
        let permit = tokio::select! {
            () = cancel.cancelled() => return Err(PoolError::Cancelled),
            acquired = tokio::time::timeout(timeout, permits.acquire_owned()) => match acquired {
                Err(_) => return Err(PoolError::Exhausted { timeout }),
                Ok(Err(_)) => {
                    return Err(PoolError::Unavailable(ConnectionError::Fatal(
                        "connection pool closed".into(),
                    )))
                }
                Ok(Ok(permit)) => permit,
            },
        };

        let max_replacements = self.inner.config.max_replacements();
        let mut evicted = 0usize;
        let mut candidate = self.inner.take_idle();

        loop {
            let conn = match candidate.take() {
                Some(conn) => conn,
                None => match self.open(evicted > 0, cancel).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        self.record_lease_outcome(evicted, owner, correlation_id);
                        return Err(err);
                    }
                },
            };

            match self.health_check(conn, cancel).await {
                HealthCheck::Healthy(conn) => {
                    self.record_lease_outcome(evicted, owner, correlation_id);
                    tracing::debug!(conn_id = conn.id, owner, evicted, "Connection leased");
                    return Ok(ConnectionLease::new(
                        Arc::clone(&self.inner),
                        conn,
                        owner.to_string(),
                        permit,
                    ));
                }
                HealthCheck::Dead { conn_id, error } => {
                    evicted += 1;
                    tracing::warn!(conn_id, owner, evicted, error = %error, "Evicted dead connection");
                    // Every connection after the first one was a replacement.
                    let replacements = evicted - 1;
                    if replacements >= max_replacements {
                        self.record_lease_outcome(evicted, owner, correlation_id);
                        return Err(PoolError::Unavailable(ConnectionError::Fatal(format!(
                            "no healthy connection after {replacements} replacements: {error}"
                        ))));
                    }
                }
                HealthCheck::Cancelled => return Err(PoolError::Cancelled),
            }
        }
    }

    /// End a lease explicitly. Dropping the lease has the same effect.
    pub fn release(&self, lease: ConnectionLease) {
        drop(lease);
    }

    async fn open(&self, replacement: bool, cancel: &CancellationToken) -> Result<PooledConn, PoolError> {
        let mut attempt = 0u32;
        loop {
            let connector = Arc::clone(&self.inner.connector);
            let opened = tokio::task::spawn_blocking(move || connector.connect())
                .await
                .map_err(|e| {
                    PoolError::Unavailable(ConnectionError::Fatal(format!(
                        "connector panicked: {e}"
                    )))
                })?;

            match opened {
                Ok(conn) => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(conn_id = id, replacement, "Opened connection");
                    return Ok(PooledConn {
                        id,
                        conn,
                        health: Health::Healthy,
                    });
                }
                Err(err) if err.is_transient() && attempt < self.inner.config.max_retries => {
                    let delay = self.inner.backoff(attempt);
                    tracing::warn!(attempt, ?delay, error = %err, "Connect failed, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(PoolError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) if replacement || !err.is_transient() => {
                    tracing::error!(error = %err, replacement, "Cannot open connection");
                    return Err(PoolError::Unavailable(err));
                }
                Err(err) => return Err(PoolError::Transient(err)),
            }
        }
    }

    async fn health_check(&self, mut conn: PooledConn, cancel: &CancellationToken) -> HealthCheck {
        let mut attempt = 0u32;
        loop {
            let conn_id = conn.id;
            let (returned, pinged) = match with_conn(conn, |c| c.ping()).await {
                Ok(pair) => pair,
                Err(error) => return HealthCheck::Dead { conn_id, error },
            };
            conn = returned;

            match pinged {
                Ok(()) => {
                    conn.health = Health::Healthy;
                    return HealthCheck::Healthy(conn);
                }
                Err(error) if !error.is_transient() || attempt >= self.inner.config.max_retries => {
                    close(conn);
                    return HealthCheck::Dead { conn_id, error };
                }
                Err(error) => {
                    conn.health = Health::Degraded;
                    let delay = self.inner.backoff(attempt);
                    tracing::debug!(conn_id, attempt, ?delay, error = %error, "Ping failed, connection degraded");
                    tokio::select! {
                        () = cancel.cancelled() => {
                            self.inner.release(conn);
                            return HealthCheck::Cancelled;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn record_lease_outcome(
        &self,
        evicted: usize,
        owner: &str,
        correlation_id: Option<&CorrelationId>,
    ) {
        let escalate = {
            let mut tracker = self
                .inner
                .failover
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if evicted == 0 {
                tracker.record_healthy();
                return;
            }
            tracker.record_failover(Instant::now(), self.inner.config.escalation_window())
        };

        tracing::warn!(owner, evicted, escalate, "Connection failover");
        let Some(alerts) = &self.inner.alerts else {
            return;
        };

        alerts.emit(
            Alert::warning(
                "connection_failover",
                "Connection failover",
                format!("evicted {evicted} dead connection(s) while leasing for {owner}"),
            )
            .with_context("evicted", evicted)
            .with_context("owner", owner)
            .with_correlation(correlation_id.cloned()),
        );

        if escalate {
            alerts.emit(
                Alert::critical(
                    "pool_outage_suspected",
                    "Possible upstream database outage",
                    format!(
                        "two connection failovers within {:?} with no healthy lease in between",
                        self.inner.config.escalation_window()
                    ),
                )
                .with_context("owner", owner)
                .with_correlation(correlation_id.cloned()),
            );
        }
    }
}
