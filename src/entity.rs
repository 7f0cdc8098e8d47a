//! Entity identity and allocation.
//!
//! An entity is an index into a growable slot table plus a generation ("version") that is bumped
//! on release so a stale handle can never alias a reused slot. The counter is scoped to a single
//! [`crate::World`] instance rather than shared process-wide, allowing multiple isolated worlds to
//! coexist in one process.

use std::fmt;
use std::num::Wrapping;

pub type EntityIndex = u32;
pub type EntityVersion = Wrapping<u32>;

/// Opaque handle to an entity. Carries no data of its own beyond the index/version pair — all
/// state lives in the owning [`crate::World`]'s [`EntityStore`](crate::store::EntityStore).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Entity {
    pub(crate) index: EntityIndex,
    pub(crate) version: EntityVersion,
}

impl Entity {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}#{})", self.index, self.version.0)
    }
}

/// Allocates and recycles [`Entity`] slots. A free slot's version is bumped on release, so a
/// dangling handle to it compares unequal to whatever entity is allocated into the slot next.
#[derive(Default)]
pub(crate) struct EntityAllocator {
    versions: Vec<EntityVersion>,
    free: Vec<EntityIndex>,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Entity {
        if let Some(index) = self.free.pop() {
            let version = self.versions[index as usize];
            Entity { index, version }
        } else {
            let index = self.versions.len() as EntityIndex;
            self.versions.push(Wrapping(1));
            Entity { index, version: Wrapping(1) }
        }
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.versions
            .get(entity.index as usize)
            .map(|v| *v == entity.version)
            .unwrap_or(false)
    }

    /// Releases the slot back to the free list, bumping its version. Returns whether the entity
    /// was actually alive (callers use this to detect double-frees/unknown entities).
    pub fn free(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        self.versions[entity.index as usize] += Wrapping(1);
        self.free.push(entity.index);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_alive() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        assert!(alloc.is_alive(e));
    }

    #[test]
    fn free_then_dead() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        assert!(alloc.free(e));
        assert!(!alloc.is_alive(e));
    }

    #[test]
    fn recycled_slot_gets_new_version() {
        let mut alloc = EntityAllocator::new();
        let e1 = alloc.allocate();
        alloc.free(e1);
        let e2 = alloc.allocate();

        assert_eq!(e1.index, e2.index);
        assert_ne!(e1.version, e2.version);
        assert!(!alloc.is_alive(e1));
        assert!(alloc.is_alive(e2));
    }

    #[test]
    fn double_free_is_reported() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        assert!(alloc.free(e));
        assert!(!alloc.free(e));
    }
}
