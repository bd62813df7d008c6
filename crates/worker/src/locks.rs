//! In-process advisory locks, one per entity.
//!
//! A chain holds the lock of its entity for as long as it runs. A second
//! chain for the same entity is rejected rather than queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use rigger_core::entity::{EntityKind, EntityRef};
use rigger_core::types::DbId;

#[derive(Debug, Clone, Default)]
pub struct EntityLocks {
    held: Arc<Mutex<HashSet<EntityRef>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock of `entity`, or `None` if a chain already holds it.
    pub fn try_acquire(&self, entity: EntityRef) -> Option<EntityGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(entity).then(|| EntityGuard {
            locks: self.clone(),
            entity,
        })
    }

    pub fn is_held(&self, entity: EntityRef) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&entity)
    }

    /// Ids of the held entities of one kind.
    pub fn held_ids(&self, kind: EntityKind) -> Vec<DbId> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<DbId> = held
            .iter()
            .filter(|entity| entity.kind == kind)
            .map(|entity| entity.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its entity on drop.
#[derive(Debug)]
pub struct EntityGuard {
    locks: EntityLocks,
    entity: EntityRef,
}

impl EntityGuard {
    pub fn entity(&self) -> EntityRef {
        self.entity
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.entity);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
