//! Reference checks answered by the target database itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use wmsync_types::state::EntityName;

use super::{Connector, DbConnection};
use crate::error::ConnectionError;
use crate::validator::ReferenceLookup;

/// [`ReferenceLookup`] over rows already committed to the target, whichever
/// process committed them.
///
/// Holds one dedicated connection outside the pool, opened on first use and
/// reopened after a connection fault. Calls block, so they belong on the
/// blocking pool like the validator that makes them.
pub struct TargetKeyLookup {
    connector: Arc<dyn Connector>,
    conn: Mutex<Option<Box<dyn DbConnection>>>,
    tables: RwLock<HashSet<EntityName>>,
}

impl TargetKeyLookup {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            conn: Mutex::new(None),
            tables: RwLock::default(),
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut dyn DbConnection) -> Result<T, ConnectionError>,
    ) -> Result<T, ConnectionError> {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connector.connect()?,
        };
        let result = f(conn.as_mut());
        match &result {
            Err(e) if e.is_connection_fault() => drop(conn),
            _ => *slot = Some(conn),
        }
        result
    }
}

impl ReferenceLookup for TargetKeyLookup {
    fn entity_exists(&self, entity: &EntityName) -> bool {
        if self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(entity)
        {
            return true;
        }
        match self.with_conn(|c| c.table_exists(entity)) {
            Ok(true) => {
                self.tables
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(entity.clone());
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(entity = %entity, error = %e, "Reference table lookup failed");
                false
            }
        }
    }

    /// Lookup failures count as found.
    fn key_exists(&self, entity: &EntityName, key: &str) -> bool {
        self.with_conn(|c| c.key_exists(entity, key))
            .unwrap_or_else(|e| {
                tracing::warn!(entity = %entity, key, error = %e, "Reference key lookup failed");
                true
            })
    }
}

impl Drop for TargetKeyLookup {
    fn drop(&mut self) {
        let slot = self.conn.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = slot.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn_blocking(move || drop(conn));
            }
        }
    }
}
