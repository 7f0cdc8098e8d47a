//! Query and Query Index (§4.4): a compiled predicate `required ∧ ¬forbidden`, memoized by
//! canonical signature, with a live entity list maintained incrementally under every store
//! mutation.

use crate::component::{ComponentRegistry, ComponentTypeId};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::event::{EventDispatcher, Handler};
use bit_set::BitSet;
use fxhash::FxHashMap;
use itertools::Itertools;

/// Dense id of a [`Query`] inside a [`QueryIndex`].
pub type QueryId = usize;

/// One clause of a query's component list: either a required type or, via [`Not`], a forbidden
/// one. Built from a concrete Rust type with [`term`]/[`Not`].
pub struct QueryTerm {
    pub(crate) type_name: &'static str,
    pub(crate) negated: bool,
    register: Box<dyn Fn(&mut ComponentRegistry) -> ComponentTypeId>,
}

impl QueryTerm {
    pub(crate) fn resolve(&self, registry: &mut ComponentRegistry) -> ComponentTypeId {
        (self.register)(registry)
    }
}

/// A required component clause: `T` must be present.
pub fn term<T: crate::component::Component>() -> QueryTerm {
    QueryTerm {
        type_name: std::any::type_name::<T>(),
        negated: false,
        register: Box::new(|r| r.ensure_registered::<T>()),
    }
}

/// The query-construction negation sentinel: `T` must be absent.
#[allow(non_snake_case)]
pub fn Not<T: crate::component::Component>() -> QueryTerm {
    let mut t = term::<T>();
    t.negated = true;
    t
}

/// Events emitted on a query's local topics: entity membership changes carry just the entity;
/// component-mutation notifications also carry which component type changed.
#[derive(Clone, Debug)]
pub enum QueryEvent {
    EntityAdded(Entity),
    EntityRemoved(Entity),
    ComponentChanged(Entity, ComponentTypeId),
}

pub const TOPIC_ENTITY_ADDED: &str = "EntityAdded";
pub const TOPIC_ENTITY_REMOVED: &str = "EntityRemoved";
pub const TOPIC_COMPONENT_CHANGED: &str = "ComponentChanged";

/// A compiled `required ∧ ¬forbidden` predicate plus its currently-matching entities.
pub struct Query {
    key: String,
    required: BitSet,
    forbidden: BitSet,
    required_names: Vec<&'static str>,
    entities: Vec<Entity>,
    position: FxHashMap<Entity, usize>,
    reactive: bool,
    dispatcher: EventDispatcher<QueryEvent>,
}

impl Query {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.position.contains_key(&entity)
    }

    pub fn is_reactive(&self) -> bool {
        self.reactive
    }

    pub fn required_names(&self) -> &[&'static str] {
        &self.required_names
    }

    /// Marks the query reactive. Idempotent; once any subscriber cares about component mutation,
    /// every mutable borrow of a member entity's component raises `ComponentChanged` regardless of
    /// which subscriber asked first.
    pub fn mark_reactive(&mut self) {
        self.reactive = true;
    }

    pub fn subscribe(&mut self, topic: &str, handler: Handler<QueryEvent>) {
        self.dispatcher.subscribe(topic, handler);
    }

    pub fn matches(&self, components: &BitSet) -> bool {
        self.required.is_subset(components) && self.forbidden.is_disjoint(components)
    }

    fn add(&mut self, entity: Entity) {
        if self.position.contains_key(&entity) {
            return;
        }
        self.position.insert(entity, self.entities.len());
        self.entities.push(entity);
        self.dispatcher.emit(TOPIC_ENTITY_ADDED, &QueryEvent::EntityAdded(entity));
    }

    fn remove(&mut self, entity: Entity) {
        if let Some(&idx) = self.position.get(&entity) {
            let last = self.entities.len() - 1;
            self.entities.swap_remove(idx);
            self.position.remove(&entity);
            if idx != last {
                let moved = self.entities[idx];
                self.position.insert(moved, idx);
            }
            self.dispatcher
                .emit(TOPIC_ENTITY_REMOVED, &QueryEvent::EntityRemoved(entity));
        }
    }
}

/// Canonical signature for a term list, exposed for stats reporting (`SystemStats::query_keys`) —
/// same derivation `QueryIndex` uses internally to dedupe queries.
pub fn term_key(terms: &[QueryTerm]) -> String {
    canonical_key(terms)
}

fn canonical_key(terms: &[QueryTerm]) -> String {
    terms
        .iter()
        .map(|t| {
            let lower = t.type_name.to_lowercase();
            if t.negated {
                format!("!{}", lower)
            } else {
                lower
            }
        })
        .sorted()
        .join("-")
}

/// Collection of queries keyed by canonical signature; maintains memberships on every mutation.
pub struct QueryIndex {
    queries: Vec<Query>,
    by_key: FxHashMap<String, QueryId>,
}

impl QueryIndex {
    pub fn new() -> Self {
        QueryIndex {
            queries: Vec::new(),
            by_key: FxHashMap::default(),
        }
    }

    /// Resolves (or builds) the query for `terms`, scanning `all_entities` once if this is a new
    /// signature. No `EntityAdded` events fire for this initial scan. Returns the matched
    /// entities alongside the id (empty if the query already existed) so the caller can update
    /// each matched entity's own query back-reference list.
    pub fn get_or_create<'a>(
        &mut self,
        registry: &mut ComponentRegistry,
        terms: &[QueryTerm],
        all_entities: impl Iterator<Item = (Entity, &'a BitSet)>,
    ) -> Result<(QueryId, Vec<Entity>)> {
        let key = canonical_key(terms);
        if let Some(&id) = self.by_key.get(&key) {
            return Ok((id, Vec::new()));
        }

        let mut required = BitSet::new();
        let mut forbidden = BitSet::new();
        let mut required_names = Vec::new();
        for t in terms {
            let id = t.resolve(registry);
            if t.negated {
                forbidden.insert(id);
            } else {
                required.insert(id);
                required_names.push(t.type_name);
            }
        }
        if required.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let mut query = Query {
            key: key.clone(),
            required: required.clone(),
            forbidden: forbidden.clone(),
            required_names,
            entities: Vec::new(),
            position: FxHashMap::default(),
            reactive: false,
            dispatcher: EventDispatcher::new(),
        };

        let mut matched = Vec::new();
        for (entity, components) in all_entities {
            if required.is_subset(components) && forbidden.is_disjoint(components) {
                query.position.insert(entity, query.entities.len());
                query.entities.push(entity);
                matched.push(entity);
            }
        }

        let id = self.queries.len();
        self.queries.push(query);
        self.by_key.insert(key, id);
        Ok((id, matched))
    }

    pub fn query(&self, id: QueryId) -> &Query {
        &self.queries[id]
    }

    pub fn query_mut(&mut self, id: QueryId) -> &mut Query {
        &mut self.queries[id]
    }

    pub fn all(&self) -> impl Iterator<Item = &Query> {
        self.queries.iter()
    }

    /// §4.4 "Membership maintenance on component add". `components` must already reflect the
    /// post-add state. Returns `(joined, left)` query ids, so the caller can keep the entity's
    /// own query back-reference list (§3) in sync.
    pub fn on_component_added(
        &mut self,
        entity: Entity,
        type_id: ComponentTypeId,
        components: &BitSet,
    ) -> (Vec<QueryId>, Vec<QueryId>) {
        let mut joined = Vec::new();
        let mut left = Vec::new();
        for (id, query) in self.queries.iter_mut().enumerate() {
            if query.forbidden.contains(type_id) && query.contains(entity) {
                query.remove(entity);
                left.push(id);
            } else if query.required.contains(type_id)
                && !query.contains(entity)
                && query.matches(components)
            {
                query.add(entity);
                joined.push(id);
            }
        }
        (joined, left)
    }

    /// §4.4 "Membership maintenance on component remove". `components` must still include
    /// `type_id` — the caller detaches it only after this call returns. Returns `(joined, left)`
    /// query ids.
    pub fn on_component_removed(
        &mut self,
        entity: Entity,
        type_id: ComponentTypeId,
        components: &BitSet,
    ) -> (Vec<QueryId>, Vec<QueryId>) {
        let mut post_removal = components.clone();
        post_removal.remove(type_id);

        let mut joined = Vec::new();
        let mut left = Vec::new();
        for (id, query) in self.queries.iter_mut().enumerate() {
            if query.forbidden.contains(type_id) && !query.contains(entity) && query.matches(&post_removal) {
                query.add(entity);
                joined.push(id);
            } else if query.required.contains(type_id) && query.contains(entity) {
                query.remove(entity);
                left.push(id);
            }
        }
        (joined, left)
    }

    /// §4.5 `removeEntity`: strips the entity from every query it belongs to. Returns the ids of
    /// queries it was removed from, so the caller can clear the entity's own back-reference list.
    pub fn on_entity_removed(&mut self, entity: Entity, member_of: &[QueryId]) {
        for &id in member_of {
            self.queries[id].remove(entity);
        }
    }

    /// §4.4 "Component-mutation notification": called once per `get_mutable_component` guard drop.
    pub fn notify_component_changed(
        &mut self,
        entity: Entity,
        type_id: ComponentTypeId,
        member_of: &[QueryId],
    ) {
        for &id in member_of {
            let query = &mut self.queries[id];
            if query.reactive && query.contains(entity) {
                query
                    .dispatcher
                    .emit(TOPIC_COMPONENT_CHANGED, &QueryEvent::ComponentChanged(entity, type_id));
            }
        }
    }
}

impl Default for QueryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_is_permutation_invariant() {
        #[derive(Default)]
        struct A;
        impl crate::pool::Poolable for A {}
        #[derive(Default)]
        struct B;
        impl crate::pool::Poolable for B {}

        let key1 = canonical_key(&[term::<A>(), Not::<B>()]);
        let key2 = canonical_key(&[Not::<B>(), term::<A>()]);
        assert_eq!(key1, key2);
    }

    #[test]
    fn empty_required_set_errors() {
        #[derive(Default)]
        struct B;
        impl crate::pool::Poolable for B {}

        let mut registry = ComponentRegistry::new();
        let mut index = QueryIndex::new();
        let err = index
            .get_or_create(&mut registry, &[Not::<B>()], std::iter::empty())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyQuery));
    }

    #[test]
    fn get_or_create_returns_matched_entities_only_when_new() {
        #[derive(Default)]
        struct A;
        impl crate::pool::Poolable for A {}

        let mut registry = ComponentRegistry::new();
        let mut index = QueryIndex::new();
        let type_id = registry.ensure_registered::<A>();
        let e1 = crate::entity::EntityAllocator::new().allocate();
        let mut components = BitSet::new();
        components.insert(type_id);

        let (id1, matched) = index
            .get_or_create(&mut registry, &[term::<A>()], std::iter::once((e1, &components)))
            .unwrap();
        assert_eq!(matched, vec![e1]);

        let (id2, matched_again) = index
            .get_or_create(&mut registry, &[term::<A>()], std::iter::once((e1, &components)))
            .unwrap();
        assert_eq!(id1, id2);
        assert!(matched_again.is_empty());
    }
}
