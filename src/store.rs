//! Entity Store (§4.5): the authoritative entity vector, per-entity component map, tag index, and
//! the two deferred-removal queues that give the scheduler a well-defined destruction phase.

use crate::component::{ComponentRegistry, ComponentTypeId};
use crate::entity::{Entity, EntityAllocator};
use crate::error::{Error, Result};
use crate::event::EventDispatcher;
use crate::query::QueryIndex;
use bit_set::BitSet;
use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::trace;

pub const TOPIC_ENTITY_CREATED: &str = "EntityCreated";
pub const TOPIC_ENTITY_REMOVED: &str = "EntityRemoved";
pub const TOPIC_COMPONENT_ADDED: &str = "ComponentAdded";
pub const TOPIC_COMPONENT_REMOVE: &str = "ComponentRemove";

/// Payload for the store's own global dispatcher (distinct from the World-level cross-system bus
/// in §4.9 — this one only ever carries raw store mutation notices, §4.5).
#[derive(Clone, Debug)]
pub enum StoreEvent {
    EntityCreated(Entity),
    EntityRemoved(Entity),
    ComponentAdded(Entity, ComponentTypeId),
    ComponentRemove(Entity, ComponentTypeId),
}

struct EntityRecord {
    id: Entity,
    components: BitSet,
    slots: FxHashMap<ComponentTypeId, usize>,
    tags: FxHashSet<String>,
    queries: SmallVec<[usize; 8]>,
    pending_component_removals: SmallVec<[ComponentTypeId; 4]>,
}

impl EntityRecord {
    fn new(id: Entity) -> Self {
        EntityRecord {
            id,
            components: BitSet::new(),
            slots: FxHashMap::default(),
            tags: FxHashSet::default(),
            queries: SmallVec::new(),
            pending_component_removals: SmallVec::new(),
        }
    }
}

pub struct EntityStore {
    allocator: EntityAllocator,
    records: Vec<Option<EntityRecord>>,
    tag_index: FxHashMap<String, FxHashSet<Entity>>,
    pending_entity_removal: Vec<Entity>,
    pending_component_removal: Vec<Entity>,
    pub(crate) events: EventDispatcher<StoreEvent>,
}

impl EntityStore {
    pub fn new() -> Self {
        EntityStore {
            allocator: EntityAllocator::new(),
            records: Vec::new(),
            tag_index: FxHashMap::default(),
            pending_entity_removal: Vec::new(),
            pending_component_removal: Vec::new(),
            events: EventDispatcher::new(),
        }
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.allocator.is_alive(entity)
    }

    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    fn record(&self, entity: Entity) -> Option<&EntityRecord> {
        self.records
            .get(entity.index() as usize)?
            .as_ref()
            .filter(|r| r.id == entity)
    }

    fn record_mut(&mut self, entity: Entity) -> Option<&mut EntityRecord> {
        self.records
            .get_mut(entity.index() as usize)?
            .as_mut()
            .filter(|r| r.id == entity)
    }

    pub fn components_of(&self, entity: Entity) -> Option<&BitSet> {
        self.record(entity).map(|r| &r.components)
    }

    /// Iterator over every live entity and its current component bitset, used to seed a freshly
    /// constructed [`crate::query::Query`] (§4.4, "Query construction").
    pub fn iter_components(&self) -> impl Iterator<Item = (Entity, &BitSet)> {
        self.records
            .iter()
            .filter_map(|r| r.as_ref())
            .map(|r| (r.id, &r.components))
    }

    pub fn has_component(&self, entity: Entity, type_id: ComponentTypeId) -> bool {
        self.record(entity)
            .map(|r| r.components.contains(type_id))
            .unwrap_or(false)
    }

    pub fn slot_of(&self, entity: Entity, type_id: ComponentTypeId) -> Option<usize> {
        self.record(entity)?.slots.get(&type_id).copied()
    }

    pub fn member_queries(&self, entity: Entity) -> &[usize] {
        self.record(entity).map(|r| r.queries.as_slice()).unwrap_or(&[])
    }

    /// Records that `entities` are now members of `query_id`, following a query's initial scan in
    /// [`QueryIndex::get_or_create`] — which matches against already-existing entities without
    /// going through `add_component`/`remove_component`'s incremental maintenance.
    pub fn attach_query_membership(&mut self, query_id: usize, entities: &[Entity]) {
        for &entity in entities {
            if let Some(record) = self.record_mut(entity) {
                if !record.queries.contains(&query_id) {
                    record.queries.push(query_id);
                }
            }
        }
    }

    pub fn create_entity(&mut self) -> Entity {
        let entity = self.allocator.allocate();
        let idx = entity.index() as usize;
        if idx >= self.records.len() {
            self.records.resize_with(idx + 1, || None);
        }
        self.records[idx] = Some(EntityRecord::new(entity));
        self.events.emit(TOPIC_ENTITY_CREATED, &StoreEvent::EntityCreated(entity));
        trace!(entity = ?entity, "created entity");
        entity
    }

    /// Attaches component `T` to `entity`. Idempotent if `entity` already owns `T` — returns
    /// `Ok(())` silently rather than erroring. `init`, when given, replaces the freshly-reset pool
    /// slot's value wholesale; callers hand over a whole `T` rather than a partial field map, so
    /// there is no field-wise merge to perform.
    pub fn add_component<T: crate::component::Component>(
        &mut self,
        registry: &mut ComponentRegistry,
        query_index: &mut QueryIndex,
        entity: Entity,
        init: Option<T>,
    ) -> Result<()> {
        if !self.is_alive(entity) {
            return Err(Error::UnknownEntity(entity));
        }
        let type_id = registry.ensure_registered::<T>();

        {
            let record = self.record(entity).expect("entity is alive but has no record");
            if record.components.contains(type_id) {
                return Ok(());
            }
        }

        let pool = registry.pool_mut::<T>(type_id);
        let slot = pool.acquire();
        if let Some(value) = init {
            *pool.get_mut(slot) = value;
        }

        let components_snapshot = {
            let record = self.record_mut(entity).unwrap();
            record.components.insert(type_id);
            record.slots.insert(type_id, slot);
            record.components.clone()
        };
        registry.on_attached(type_id);

        let (joined, left) = query_index.on_component_added(entity, type_id, &components_snapshot);
        let record = self.record_mut(entity).unwrap();
        record.queries.retain(|id| !left.contains(id));
        record.queries.extend(joined);

        self.events
            .emit(TOPIC_COMPONENT_ADDED, &StoreEvent::ComponentAdded(entity, type_id));
        trace!(entity = ?entity, type_id, "added component");
        Ok(())
    }

    /// §4.5 `removeComponent`. No-op if `entity` doesn't own `T` (`UnknownComponent`, §7).
    pub fn remove_component<T: crate::component::Component>(
        &mut self,
        registry: &mut ComponentRegistry,
        query_index: &mut QueryIndex,
        entity: Entity,
        force: bool,
    ) -> Result<()> {
        let type_id = match registry.type_id::<T>() {
            Some(id) => id,
            None => return Ok(()),
        };
        self.remove_component_by_id(registry, query_index, entity, type_id, force)
    }

    /// Type-erased core of [`Self::remove_component`], also used by `World::remove_all_components`
    /// to detach every component type an entity owns without the caller knowing each one's `T`.
    pub fn remove_component_by_id(
        &mut self,
        registry: &mut ComponentRegistry,
        query_index: &mut QueryIndex,
        entity: Entity,
        type_id: ComponentTypeId,
        force: bool,
    ) -> Result<()> {
        if !self.is_alive(entity) {
            return Ok(());
        }
        if !self.has_component(entity, type_id) {
            return Ok(());
        }

        self.events
            .emit(TOPIC_COMPONENT_REMOVE, &StoreEvent::ComponentRemove(entity, type_id));

        let components_snapshot = self.record(entity).unwrap().components.clone();
        let (joined, left) = query_index.on_component_removed(entity, type_id, &components_snapshot);
        let record = self.record_mut(entity).unwrap();
        record.queries.retain(|id| !left.contains(id));
        record.queries.extend(joined);

        if force {
            self.detach_component(registry, entity, type_id);
        } else {
            let record = self.record_mut(entity).unwrap();
            let first_pending = record.pending_component_removals.is_empty();
            record.pending_component_removals.push(type_id);
            if first_pending {
                self.pending_component_removal.push(entity);
            }
        }
        trace!(entity = ?entity, type_id, force, "removed component");
        Ok(())
    }

    fn detach_component(&mut self, registry: &mut ComponentRegistry, entity: Entity, type_id: ComponentTypeId) {
        let slot = {
            let record = self.record_mut(entity).expect("entity vanished mid-detach");
            record.components.remove(type_id);
            record.slots.remove(&type_id)
        };
        if let Some(slot) = slot {
            registry.release_slot(type_id, slot);
            registry.on_detached(type_id);
        }
    }

    /// §4.5 `removeEntity`. Errors with `UnknownEntity` if `entity` is not known to the store.
    pub fn remove_entity(&mut self, query_index: &mut QueryIndex, entity: Entity, force: bool) -> Result<()> {
        if !self.is_alive(entity) {
            return Err(Error::UnknownEntity(entity));
        }

        // The EntityRemoved event fires before components are detached (§9 open question): the
        // entity is already gone from every query's entity list by the time listeners see it, but
        // its component data is still intact for inspection.
        self.events
            .emit(TOPIC_ENTITY_REMOVED, &StoreEvent::EntityRemoved(entity));

        let member_of: SmallVec<[usize; 8]> = self
            .record(entity)
            .map(|r| r.queries.clone())
            .unwrap_or_default();
        query_index.on_entity_removed(entity, &member_of);
        if let Some(record) = self.record_mut(entity) {
            record.queries.clear();
        }

        if force {
            self.destroy_entity(entity);
        } else {
            self.pending_entity_removal.push(entity);
        }
        trace!(entity = ?entity, force, "removed entity");
        Ok(())
    }

    fn destroy_entity(&mut self, entity: Entity) {
        if let Some(record) = self.records[entity.index() as usize].take() {
            for tag in &record.tags {
                if let Some(set) = self.tag_index.get_mut(tag) {
                    set.remove(&entity);
                }
            }
        }
        self.allocator.free(entity);
    }

    /// §4.5 `processDeferred`, run by the scheduler once per tick after every system has executed.
    /// Destroys entities queued via `remove_entity(.., false)`, then detaches components queued via
    /// `remove_component(.., false)`. These two drains are independent; entity removals run first
    /// since an entity awaiting destruction may also have pending component removals that
    /// destruction will subsume anyway.
    pub fn process_deferred(&mut self, registry: &mut ComponentRegistry) {
        for entity in self.pending_entity_removal.drain(..) {
            // Components are detached synchronously as part of destruction, bypassing the
            // pending-component-removal queue for this entity if it was also enqueued there.
            if let Some(record) = self.records[entity.index() as usize].take() {
                for (type_id, slot) in record.slots {
                    registry.release_slot(type_id, slot);
                    registry.on_detached(type_id);
                }
                for tag in &record.tags {
                    if let Some(set) = self.tag_index.get_mut(tag) {
                        set.remove(&entity);
                    }
                }
            }
            self.allocator.free(entity);
        }

        for entity in self.pending_component_removal.drain(..) {
            let pending: SmallVec<[ComponentTypeId; 4]> = match self.record_mut(entity) {
                Some(record) => std::mem::take(&mut record.pending_component_removals),
                None => continue,
            };
            for type_id in pending {
                self.detach_component(registry, entity, type_id);
            }
        }
    }

    pub fn add_tag(&mut self, entity: Entity, tag: impl Into<String>) {
        let tag = tag.into();
        if let Some(record) = self.record_mut(entity) {
            record.tags.insert(tag.clone());
            self.tag_index.entry(tag).or_insert_with(FxHashSet::default).insert(entity);
        }
    }

    pub fn remove_tag(&mut self, entity: Entity, tag: &str) {
        if let Some(record) = self.record_mut(entity) {
            record.tags.remove(tag);
        }
        if let Some(set) = self.tag_index.get_mut(tag) {
            set.remove(&entity);
        }
    }

    pub fn has_tag(&self, entity: Entity, tag: &str) -> bool {
        self.record(entity).map(|r| r.tags.contains(tag)).unwrap_or(false)
    }

    pub fn by_tag(&self, tag: &str) -> impl Iterator<Item = Entity> + '_ {
        self.tag_index.get(tag).into_iter().flatten().copied()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Poolable;

    #[derive(Default, PartialEq, Debug)]
    struct Pos {
        x: f32,
        y: f32,
    }
    impl Poolable for Pos {
        fn reset(&mut self) {
            self.x = 0.0;
            self.y = 0.0;
        }
    }

    #[test]
    fn double_add_is_a_silent_noop() {
        let mut store = EntityStore::new();
        let mut registry = ComponentRegistry::new();
        let mut index = QueryIndex::new();
        let e = store.create_entity();

        store.add_component(&mut registry, &mut index, e, Some(Pos { x: 1.0, y: 1.0 })).unwrap();
        store.add_component(&mut registry, &mut index, e, Some(Pos { x: 9.0, y: 9.0 })).unwrap();

        let type_id = registry.type_id::<Pos>().unwrap();
        let slot = store.slot_of(e, type_id).unwrap();
        assert_eq!(registry.pool::<Pos>(type_id).get(slot).x, 1.0);
    }

    #[test]
    fn deferred_removal_keeps_entity_alive_until_processed() {
        let mut store = EntityStore::new();
        let mut index = QueryIndex::new();
        let e = store.create_entity();

        store.remove_entity(&mut index, e, false).unwrap();
        assert!(store.is_alive(e));

        let mut registry = ComponentRegistry::new();
        store.process_deferred(&mut registry);
        assert!(!store.is_alive(e));
    }

    #[test]
    fn tag_bijection() {
        let mut store = EntityStore::new();
        let e = store.create_entity();
        store.add_tag(e, "player");

        assert!(store.has_tag(e, "player"));
        assert_eq!(store.by_tag("player").collect::<Vec<_>>(), vec![e]);

        store.remove_tag(e, "player");
        assert!(!store.has_tag(e, "player"));
        assert!(store.by_tag("player").next().is_none());
    }

    #[test]
    fn removing_unknown_entity_errors() {
        let mut store = EntityStore::new();
        let mut index = QueryIndex::new();
        let e = store.create_entity();
        store.remove_entity(&mut index, e, true).unwrap();

        let err = store.remove_entity(&mut index, e, true).unwrap_err();
        assert!(matches!(err, Error::UnknownEntity(_)));
    }
}
