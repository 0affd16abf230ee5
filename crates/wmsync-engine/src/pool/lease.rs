use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OwnedSemaphorePermit;
use wmsync_types::record::Record;
use wmsync_types::state::EntityName;

use super::{with_conn, DbConnection, PoolInner, PooledConn};
use crate::error::ConnectionError;

/// Health of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// A transient failure was seen; the next lease re-checks it.
    Degraded,
    /// Evicted; never handed out again.
    Dead,
}

/// Exclusive use of one connection. Returned to the pool on drop.
///
/// If a call future is dropped mid-flight (for example by a timeout) the
/// connection is not returned and closes once the blocking call finishes.
pub struct ConnectionLease {
    pool: Arc<PoolInner>,
    conn: Option<PooledConn>,
    owner: String,
    leased_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    pub(crate) fn new(
        pool: Arc<PoolInner>,
        conn: PooledConn,
        owner: String,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            conn: Some(conn),
            owner,
            leased_at: Instant::now(),
            _permit: permit,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id)
    }

    #[must_use]
    pub fn health(&self) -> Health {
        self.conn.as_ref().map_or(Health::Dead, |c| c.health)
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn leased_at(&self) -> Instant {
        self.leased_at
    }

    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the ping fails.
    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.call(|c| c.ping()).await
    }

    /// Commit one batch in a single target transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if nothing was committed.
    pub async fn commit_batch(
        &mut self,
        entity: &EntityName,
        primary_key: &str,
        records: Vec<Record>,
    ) -> Result<u64, ConnectionError> {
        let entity = entity.clone();
        let primary_key = primary_key.to_string();
        self.call(move |c| c.commit_batch(&entity, &primary_key, &records))
            .await
    }

    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the catalog query fails.
    pub async fn table_exists(&mut self, entity: &EntityName) -> Result<bool, ConnectionError> {
        let entity = entity.clone();
        self.call(move |c| c.table_exists(&entity)).await
    }

    /// Tell the pool this connection failed: transient errors degrade it,
    /// fatal ones kill it so it is discarded on release. Data rejections
    /// leave it untouched.
    pub fn report_failure(&mut self, err: &ConnectionError) {
        if let Some(conn) = self.conn.as_mut() {
            self.pool.mark_failed(conn, err);
        }
    }

    async fn call<T, F>(&mut self, f: F) -> Result<T, ConnectionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DbConnection) -> Result<T, ConnectionError> + Send + 'static,
    {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| ConnectionError::Fatal("connection lost by an earlier call".into()))?;
        let (conn, result) = with_conn(conn, f).await?;
        self.conn = Some(conn);
        result
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("connection_id", &self.connection_id())
            .field("health", &self.health())
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
