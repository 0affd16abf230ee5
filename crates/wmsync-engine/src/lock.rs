//! In-process run locks on entity sets.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use wmsync_types::state::EntityName;

use crate::error::AlreadyRunning;

/// Entity sets of the runs currently active in this process.
#[derive(Debug, Default)]
pub struct RunLockRegistry {
    held: Mutex<Vec<BTreeSet<EntityName>>>,
}

impl RunLockRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock for `entities`. Fails if any entity is already part of
    /// an active run.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyRunning`] naming the conflicting entity set.
    pub fn acquire(self: &Arc<Self>, entities: &BTreeSet<EntityName>) -> Result<RunLock, AlreadyRunning> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conflict) = held.iter().find(|set| !set.is_disjoint(entities)) {
            return Err(AlreadyRunning {
                held: set_key(conflict),
            });
        }
        held.push(entities.clone());
        tracing::debug!(entities = %set_key(entities), "Run lock acquired");
        Ok(RunLock {
            registry: Arc::clone(self),
            entities: entities.clone(),
        })
    }

    #[must_use]
    pub fn is_locked(&self, entity: &EntityName) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|set| set.contains(entity))
    }

    fn release(&self, entities: &BTreeSet<EntityName>) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = held.iter().position(|set| set == entities) {
            held.swap_remove(pos);
            tracing::debug!(entities = %set_key(entities), "Run lock released");
        }
    }
}

fn set_key(entities: &BTreeSet<EntityName>) -> String {
    entities
        .iter()
        .map(EntityName::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Held run lock. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    registry: Arc<RunLockRegistry>,
    entities: BTreeSet<EntityName>,
}

impl RunLock {
    #[must_use]
    pub fn entities(&self) -> &BTreeSet<EntityName> {
        &self.entities
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.registry.release(&self.entities);
    }
}
