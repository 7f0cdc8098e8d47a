//! Component Registry (§4.3): interns component types, owns one [`Pool`] per type, and tracks
//! live-instance counts. Also owns World-level singleton components (§3, "Singleton component").

use crate::pool::{AnyPool, Pool, Poolable};
use fxhash::FxHashMap;
use std::any::{type_name, Any, TypeId};

/// Dense, registration-order identifier for a registered component type. Used as the bit index
/// into the `bit-set`-backed component sets that track, per entity, which component types it owns.
pub type ComponentTypeId = usize;

/// Marker trait for anything that can be stored as a component. Anything `Poolable + 'static`
/// qualifies — there is no separate registration boilerplate to hand-write per component.
pub trait Component: Poolable {}
impl<T: Poolable> Component for T {}

pub struct ComponentRegistry {
    ids_by_type: FxHashMap<TypeId, ComponentTypeId>,
    type_names: Vec<&'static str>,
    pools: Vec<Box<dyn AnyPool>>,
    live_counts: Vec<usize>,
    singletons: FxHashMap<ComponentTypeId, Box<dyn Any>>,
    singleton_names: FxHashMap<String, ComponentTypeId>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        ComponentRegistry {
            ids_by_type: FxHashMap::default(),
            type_names: Vec::new(),
            pools: Vec::new(),
            live_counts: Vec::new(),
            singletons: FxHashMap::default(),
            singleton_names: FxHashMap::default(),
        }
    }

    /// Registers `T` if this is the first time it has been seen, otherwise returns its existing
    /// id. Every entry point that needs a `ComponentTypeId` for `T` calls this rather than
    /// requiring an explicit up-front `register::<T>()` call, so a component type is registered
    /// lazily on first attach.
    pub fn ensure_registered<T: Component>(&mut self) -> ComponentTypeId {
        let key = TypeId::of::<T>();
        if let Some(id) = self.ids_by_type.get(&key) {
            return *id;
        }
        let id = self.pools.len();
        self.pools.push(Box::new(Pool::<T>::new()));
        self.live_counts.push(0);
        self.type_names.push(type_name::<T>());
        self.ids_by_type.insert(key, id);
        id
    }

    pub fn type_id<T: Component>(&self) -> Option<ComponentTypeId> {
        self.ids_by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn type_name(&self, id: ComponentTypeId) -> &'static str {
        self.type_names[id]
    }

    pub fn pool_mut<T: Component>(&mut self, id: ComponentTypeId) -> &mut Pool<T> {
        self.pools[id]
            .downcast_mut::<Pool<T>>()
            .expect("ComponentTypeId did not match the requested component type")
    }

    pub fn pool<T: Component>(&self, id: ComponentTypeId) -> &Pool<T> {
        self.pools[id]
            .downcast_ref::<Pool<T>>()
            .expect("ComponentTypeId did not match the requested component type")
    }

    pub fn release_slot(&mut self, id: ComponentTypeId, slot: usize) {
        self.pools[id].release_slot(slot);
    }

    pub fn on_attached(&mut self, id: ComponentTypeId) {
        self.live_counts[id] += 1;
    }

    pub fn on_detached(&mut self, id: ComponentTypeId) {
        self.live_counts[id] -= 1;
    }

    pub fn live_count(&self, id: ComponentTypeId) -> usize {
        self.live_counts[id]
    }

    pub fn component_type_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_stats(&self, id: ComponentTypeId) -> (usize, usize, usize) {
        let pool = self.pools[id].as_ref();
        (pool.total(), pool.free_count(), pool.used_count())
    }

    /// Registers the sole instance of a singleton component type, binding it under the derived
    /// name (first letter of the type's bare name, lowercased).
    pub fn register_singleton<T: Component>(&mut self, value: T) -> ComponentTypeId {
        let id = self.ensure_registered::<T>();
        let name = derive_singleton_name(type_name::<T>());
        self.singleton_names.insert(name, id);
        self.singletons.insert(id, Box::new(value));
        id
    }

    pub fn singleton<T: Component>(&self) -> Option<&T> {
        let id = self.type_id::<T>()?;
        self.singletons.get(&id)?.downcast_ref::<T>()
    }

    pub fn singleton_mut<T: Component>(&mut self) -> Option<&mut T> {
        let id = self.type_id::<T>()?;
        self.singletons.get_mut(&id)?.downcast_mut::<T>()
    }

    pub fn singleton_by_name(&self, name: &str) -> Option<&dyn Any> {
        let id = self.singleton_names.get(name)?;
        self.singletons.get(id).map(|b| b.as_ref())
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_singleton_name(type_name: &str) -> String {
    let bare = type_name.rsplit("::").next().unwrap_or(type_name);
    let mut chars = bare.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Position {
        x: f32,
        y: f32,
    }
    impl Poolable for Position {}

    #[derive(Default)]
    struct Velocity {
        x: f32,
        y: f32,
    }
    impl Poolable for Velocity {}

    #[test]
    fn ensure_registered_is_idempotent() {
        let mut registry = ComponentRegistry::new();
        let a = registry.ensure_registered::<Position>();
        let b = registry.ensure_registered::<Position>();
        assert_eq!(a, b);
        assert_eq!(registry.component_type_count(), 1);
    }

    #[test]
    fn distinct_types_get_distinct_ids() {
        let mut registry = ComponentRegistry::new();
        let pos = registry.ensure_registered::<Position>();
        let vel = registry.ensure_registered::<Velocity>();
        assert_ne!(pos, vel);
    }

    #[test]
    fn live_count_tracks_attach_detach() {
        let mut registry = ComponentRegistry::new();
        let id = registry.ensure_registered::<Position>();
        registry.on_attached(id);
        registry.on_attached(id);
        registry.on_detached(id);
        assert_eq!(registry.live_count(id), 1);
    }

    #[test]
    fn singleton_lookup_by_derived_name() {
        let mut registry = ComponentRegistry::new();
        registry.register_singleton(Position { x: 1.0, y: 2.0 });

        assert_eq!(registry.singleton::<Position>().unwrap().x, 1.0);
        let by_name = registry
            .singleton_by_name("position")
            .and_then(|a| a.downcast_ref::<Position>())
            .unwrap();
        assert_eq!(by_name.y, 2.0);
    }
}
