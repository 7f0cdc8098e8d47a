//! World Façade (§4.9): the composition root. Owns the registry, store, query index, and
//! scheduler, and is the sole entry point a host embeds against (§6).

use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::event::{EventDispatcher, Handler};
use crate::query::{Query, QueryId, QueryIndex, QueryTerm};
use crate::store::EntityStore;
use crate::system::{Scheduler, System, SystemAttributes, SystemStats};
use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

static NEXT_WORLD_ID: AtomicU64 = AtomicU64::new(1);

/// Guard returned by [`World::get_component_mut`]. Derefs to `&T`/`&mut T`; on drop it notifies
/// every currently-reactive query containing the entity that this component changed (§4.4, §4.6,
/// §10.3) — exactly once per guard, regardless of how many fields the caller wrote.
pub struct ComponentRefMut<'a, T: Component> {
    value: &'a mut T,
    query_index: &'a mut QueryIndex,
    entity: Entity,
    type_id: ComponentTypeId,
    member_of: Vec<QueryId>,
}

impl<'a, T: Component> Deref for ComponentRefMut<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value
    }
}

impl<'a, T: Component> DerefMut for ComponentRefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
    }
}

impl<'a, T: Component> Drop for ComponentRefMut<'a, T> {
    fn drop(&mut self) {
        self.query_index.notify_component_changed(self.entity, self.type_id, &self.member_of);
    }
}

#[derive(Debug)]
pub struct QueryStats {
    pub key: String,
    pub required_count: usize,
    pub entity_count: usize,
}

#[derive(Debug)]
pub struct ComponentStats {
    pub type_name: &'static str,
    pub pool_total: usize,
    pub pool_free: usize,
    pub pool_used: usize,
    pub live_count: usize,
}

/// Typed shape of `world.stats()` (§6, §10.6) — a struct rather than a loosely-typed map.
pub struct WorldStats {
    pub systems: Vec<SystemStats>,
    pub queries: Vec<QueryStats>,
    pub components: Vec<ComponentStats>,
    pub events_fired: u64,
    pub events_handled: u64,
}

pub struct World {
    id: u64,
    registry: ComponentRegistry,
    store: EntityStore,
    query_index: QueryIndex,
    scheduler: Scheduler,
    events: EventDispatcher<Rc<dyn Any>>,
    enabled: bool,
}

impl World {
    pub fn new() -> Self {
        let id = NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed);
        info!(world_id = id, "world started");
        World {
            id,
            registry: ComponentRegistry::new(),
            store: EntityStore::new(),
            query_index: QueryIndex::new(),
            scheduler: Scheduler::new(),
            events: EventDispatcher::new(),
            enabled: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn query_index(&self) -> &QueryIndex {
        &self.query_index
    }

    pub(crate) fn process_deferred(&mut self) {
        self.store.process_deferred(&mut self.registry);
    }

    /// §4.3 `register`. Idempotent — also called implicitly on first `add_component`.
    pub fn register_component<T: Component>(&mut self) -> ComponentTypeId {
        self.registry.ensure_registered::<T>()
    }

    /// §4.3 `registerSingleton` / §3 "Singleton component".
    pub fn register_singleton_component<T: Component>(&mut self, value: T) -> ComponentTypeId {
        self.registry.register_singleton(value)
    }

    pub fn singleton<T: Component>(&self) -> Option<&T> {
        self.registry.singleton::<T>()
    }

    pub fn singleton_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.registry.singleton_mut::<T>()
    }

    /// Looks up a singleton by its derived lookup name (first letter of the type name, lowercased)
    /// rather than by static type. Errs if no singleton was ever registered under that name.
    pub fn singleton_by_name(&self, name: &str) -> Result<&dyn Any> {
        self.registry.singleton_by_name(name).ok_or_else(|| Error::UnknownSingleton(name.to_string()))
    }

    /// §4.8 `registerSystem(S, attrs?)`.
    pub fn register_system(&mut self, system: Box<dyn System>, attrs: SystemAttributes) -> Result<()> {
        self.scheduler.register_system(
            system,
            attrs,
            &mut self.registry,
            &mut self.store,
            &mut self.query_index,
            &mut self.events,
        )
    }

    pub fn remove_system(&mut self, name: &str) {
        self.scheduler.remove_system(name);
    }

    pub fn set_system_enabled(&mut self, name: &str, enabled: bool) {
        self.scheduler.set_enabled(name, enabled);
    }

    /// Resolves (or builds) a standalone query outside of any system's `Config` — useful for hosts
    /// that want to inspect membership directly.
    pub fn query(&mut self, terms: &[QueryTerm]) -> Result<QueryId> {
        let (id, matched) = self.query_index.get_or_create(&mut self.registry, terms, self.store.iter_components())?;
        self.store.attach_query_membership(id, &matched);
        Ok(id)
    }

    pub fn query_entities(&self, id: QueryId) -> &[Entity] {
        self.query_index.query(id).entities()
    }

    pub fn create_entity(&mut self) -> Entity {
        self.store.create_entity()
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.store.is_alive(entity)
    }

    pub fn add_component<T: Component>(&mut self, entity: Entity, init: Option<T>) -> Result<()> {
        self.store.add_component(&mut self.registry, &mut self.query_index, entity, init)
    }

    pub fn remove_component<T: Component>(&mut self, entity: Entity, force: bool) -> Result<()> {
        self.store.remove_component::<T>(&mut self.registry, &mut self.query_index, entity, force)
    }

    /// §6 `remove_all_components`. Detaches every component type the entity currently owns.
    pub fn remove_all_components(&mut self, entity: Entity, force: bool) -> Result<()> {
        let type_ids: Vec<ComponentTypeId> = match self.store.components_of(entity) {
            Some(set) => set.iter().collect(),
            None => return Err(Error::UnknownEntity(entity)),
        };
        for type_id in type_ids {
            self.store
                .remove_component_by_id(&mut self.registry, &mut self.query_index, entity, type_id, force)?;
        }
        Ok(())
    }

    pub fn remove_entity(&mut self, entity: Entity, force: bool) -> Result<()> {
        self.store.remove_entity(&mut self.query_index, entity, force)
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        match self.registry.type_id::<T>() {
            Some(id) => self.store.has_component(entity, id),
            None => false,
        }
    }

    pub fn has_all_components(&self, entity: Entity, type_ids: &[ComponentTypeId]) -> bool {
        type_ids.iter().all(|&id| self.store.has_component(entity, id))
    }

    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<&T> {
        let id = self.registry.type_id::<T>()?;
        let slot = self.store.slot_of(entity, id)?;
        Some(self.registry.pool::<T>(id).get(slot))
    }

    /// §4.6 `getMut`. The returned guard emits `ComponentChanged` to every reactive query
    /// containing `entity` when it's dropped.
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Option<ComponentRefMut<'_, T>> {
        let id = self.registry.type_id::<T>()?;
        let slot = self.store.slot_of(entity, id)?;
        let member_of = self.store.member_queries(entity).to_vec();

        let World { registry, query_index, .. } = self;
        let value = registry.pool_mut::<T>(id).get_mut(slot);
        Some(ComponentRefMut { value, query_index, entity, type_id: id, member_of })
    }

    pub fn add_tag(&mut self, entity: Entity, tag: impl Into<String>) {
        self.store.add_tag(entity, tag);
    }

    pub fn remove_tag(&mut self, entity: Entity, tag: &str) {
        self.store.remove_tag(entity, tag);
    }

    pub fn has_tag(&self, entity: Entity, tag: &str) -> bool {
        self.store.has_tag(entity, tag)
    }

    pub fn by_tag(&self, tag: &str) -> impl Iterator<Item = Entity> + '_ {
        self.store.by_tag(tag)
    }

    /// §4.9 `stop`/`play`: gates whether `tick` advances the scheduler at all.
    pub fn stop(&mut self) {
        self.enabled = false;
    }

    pub fn play(&mut self) {
        self.enabled = true;
    }

    pub fn is_running(&self) -> bool {
        self.enabled
    }

    /// §4.9 `emitEvent`. `payload` is boxed as `Rc<dyn Any>`; listeners downcast it themselves or
    /// use [`World::add_event_listener`]'s typed convenience wrapper.
    pub fn emit_event<T: Any>(&mut self, topic: &str, payload: T) {
        let boxed: Rc<dyn Any> = Rc::new(payload);
        self.events.emit(topic, &boxed);
    }

    pub fn add_raw_event_listener(&mut self, topic: &str, handler: Handler<Rc<dyn Any>>) {
        self.events.subscribe(topic, handler);
    }

    /// Typed convenience over [`World::add_raw_event_listener`]: the callback only runs when the
    /// payload actually downcasts to `T`, so mismatched emits on a shared topic are silently
    /// skipped rather than panicking.
    pub fn add_event_listener<T: Any, F: Fn(&T) + 'static>(&mut self, topic: &str, handler: F) -> Handler<Rc<dyn Any>> {
        let wrapped: Handler<Rc<dyn Any>> = Rc::new(move |payload: &Rc<dyn Any>| {
            if let Some(value) = payload.downcast_ref::<T>() {
                handler(value);
            }
        });
        self.events.subscribe(topic, wrapped.clone());
        wrapped
    }

    pub fn remove_event_listener(&mut self, topic: &str, handler: &Handler<Rc<dyn Any>>) {
        self.events.unsubscribe(topic, handler);
    }

    /// §4.9 `tick(delta, time)`. No-op while stopped. Swaps the scheduler out of `self` for the
    /// duration of the pass so systems can take `&mut World` without aliasing the scheduler that's
    /// driving them (the scheduler owns no state a system needs to observe through `self`).
    pub fn tick(&mut self, delta: f64, time: f64) {
        if !self.enabled {
            return;
        }
        let mut scheduler = std::mem::take(&mut self.scheduler);
        scheduler.tick(self, delta, time);
        self.scheduler = scheduler;
    }

    pub fn stats(&self) -> WorldStats {
        let systems = self.scheduler.stats();
        let queries = self
            .query_index
            .all()
            .map(|q: &Query| QueryStats {
                key: q.key().to_string(),
                required_count: q.required_names().len(),
                entity_count: q.entities().len(),
            })
            .collect();
        let components = (0..self.registry.component_type_count())
            .map(|id| {
                let (total, free, used) = self.registry.pool_stats(id);
                ComponentStats {
                    type_name: self.registry.type_name(id),
                    pool_total: total,
                    pool_free: free,
                    pool_used: used,
                    live_count: self.registry.live_count(id),
                }
            })
            .collect();
        WorldStats {
            systems,
            queries,
            components,
            events_fired: self.events.fired(),
            events_handled: self.events.handled(),
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Poolable;
    use crate::query::{term, Not};

    #[derive(Default, PartialEq, Debug, Clone)]
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

    #[derive(Default)]
    struct Dead;
    impl Poolable for Dead {}

    #[test]
    fn basic_membership() {
        let mut world = World::new();
        let e1 = world.create_entity();
        world.add_component::<Pos>(e1, Some(Pos { x: 1.0, y: 1.0 })).unwrap();
        world.add_component::<Dead>(e1, None).unwrap();

        let q = world.query(&[term::<Pos>()]).unwrap();
        assert_eq!(world.query_entities(q), &[e1]);

        world.remove_component::<Pos>(e1, true).unwrap();
        assert_eq!(world.query_entities(q), &[] as &[Entity]);
    }

    #[test]
    fn negation_round_trip() {
        let mut world = World::new();
        let e1 = world.create_entity();
        let q = world.query(&[term::<Pos>(), Not::<Dead>()]).unwrap();

        world.add_component::<Pos>(e1, None).unwrap();
        assert_eq!(world.query_entities(q), &[e1]);

        world.add_component::<Dead>(e1, None).unwrap();
        assert!(world.query_entities(q).is_empty());

        world.remove_component::<Dead>(e1, true).unwrap();
        assert_eq!(world.query_entities(q), &[e1]);
    }

    #[test]
    fn mutable_borrow_emits_change_to_reactive_query() {
        let mut world = World::new();
        let e1 = world.create_entity();
        world.add_component::<Pos>(e1, None).unwrap();

        let q = world.query(&[term::<Pos>()]).unwrap();
        world.query_index.query_mut(q).mark_reactive();

        let fired = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = fired.clone();
        world.query_index.query_mut(q).subscribe(
            crate::query::TOPIC_COMPONENT_CHANGED,
            Rc::new(move |ev: &crate::query::QueryEvent| {
                if let crate::query::QueryEvent::ComponentChanged(e, _) = ev {
                    sink.borrow_mut().push(*e);
                }
            }),
        );

        {
            let mut pos = world.get_component_mut::<Pos>(e1).unwrap();
            pos.x = 9.0;
        }

        assert_eq!(*fired.borrow(), vec![e1]);
    }

    #[test]
    fn pool_reuse_resets_values() {
        let mut world = World::new();
        let e1 = world.create_entity();
        world.add_component::<Pos>(e1, Some(Pos { x: 3.0, y: 4.0 })).unwrap();
        world.remove_component::<Pos>(e1, true).unwrap();

        let e2 = world.create_entity();
        world.add_component::<Pos>(e2, None).unwrap();
        let pos = world.get_component::<Pos>(e2).unwrap();
        assert_eq!(pos.x, 0.0);
        assert_eq!(pos.y, 0.0);
    }

    #[test]
    fn singleton_lookup_by_name_finds_registered_value_and_errors_on_miss() {
        let mut world = World::new();
        world.register_singleton_component(Pos { x: 7.0, y: 8.0 });

        let found = world.singleton_by_name("pos").unwrap().downcast_ref::<Pos>().unwrap();
        assert_eq!(found.x, 7.0);

        assert!(matches!(world.singleton_by_name("missing"), Err(Error::UnknownSingleton(_))));
    }

    #[test]
    fn deferred_entity_removal_is_invisible_to_queries_until_processed() {
        let mut world = World::new();
        let e1 = world.create_entity();
        world.add_component::<Pos>(e1, None).unwrap();
        let q = world.query(&[term::<Pos>()]).unwrap();
        assert_eq!(world.query_entities(q), &[e1]);

        world.remove_entity(e1, false).unwrap();
        assert!(world.query_entities(q).is_empty());
        assert!(world.is_alive(e1));

        world.process_deferred();
        assert!(!world.is_alive(e1));
    }
}
