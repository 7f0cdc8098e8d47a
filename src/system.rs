//! System Base + Scheduler (§4.7, §4.8): system lifecycle, config-driven query/event binding, and
//! priority-ordered per-tick execution with scoped event buffers.
//!
//! Limitation: a system's query slices (`SystemRuntime::query`) are refreshed once, immediately
//! before that system's `execute` runs, from whatever the previous system left committed. A system
//! that mutates an entity's own membership in one of its declared queries mid-`execute` (e.g. adding
//! a component that makes the entity newly match) does not see that change reflected in its own
//! `runtime.query(...)` slice until its *next* tick — the live store and query index are already
//! updated by the time `execute` returns, but this call's cached slice is not re-resolved mid-call.

use crate::component::{ComponentRegistry, ComponentTypeId};
use crate::entity::Entity;
use crate::error::Result;
use crate::event::{EventDispatcher, Handler};
use crate::query::{
    Query, QueryEvent, QueryId, QueryIndex, QueryTerm, TOPIC_COMPONENT_CHANGED, TOPIC_ENTITY_ADDED,
    TOPIC_ENTITY_REMOVED,
};
use crate::store::EntityStore;
use crate::world::World;
use fxhash::{FxHashMap, FxHashSet};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::error;

/// Topic a `queries.<name>.events.<evName>` binding reacts to (§4.7's Config grammar).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    EntityAdded,
    EntityRemoved,
    /// Alias over the query's `ComponentChanged` topic that ignores which component changed and
    /// deduplicates by entity within the tick, matching `EntityChanged` in the Config grammar.
    EntityChanged,
    /// Raw `ComponentChanged`, optionally filtered to a component-type allowlist. Unlike every
    /// other entity-keyed topic this one does **not** dedupe — a repeated mutation of the same
    /// entity within a tick appears once per mutation.
    ComponentChanged,
}

struct QueryEventBinding {
    event_name: String,
    kind: EventKind,
    components: Option<Vec<QueryTerm>>,
}

struct QuerySpec {
    name: String,
    terms: Vec<QueryTerm>,
    events: Vec<QueryEventBinding>,
}

/// Builder for what a [`System`]'s `init` returns: which queries it observes, which of each
/// query's events it wants buffered, and which world-level event topics it listens to. Composes
/// runtime behavior from small typed pieces rather than one struct literal.
#[derive(Default)]
pub struct SystemConfig {
    queries: Vec<QuerySpec>,
    world_events: Vec<(String, String)>,
}

impl SystemConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, name: &str, terms: Vec<QueryTerm>) -> Self {
        self.queries.push(QuerySpec { name: name.to_string(), terms, events: Vec::new() });
        self
    }

    /// Binds `event_name` under `query_name`'s runtime event map. `query_name` must have been
    /// declared with an earlier [`SystemConfig::query`] call in the same builder chain.
    pub fn query_event(
        mut self,
        query_name: &str,
        event_name: &str,
        kind: EventKind,
        components: Option<Vec<QueryTerm>>,
    ) -> Self {
        if let Some(spec) = self.queries.iter_mut().find(|q| q.name == query_name) {
            spec.events.push(QueryEventBinding { event_name: event_name.to_string(), kind, components });
        }
        self
    }

    pub fn world_event(mut self, buffer_name: &str, topic: &str) -> Self {
        self.world_events.push((buffer_name.to_string(), topic.to_string()));
        self
    }
}

/// Attributes applied at registration, separate from the system's own `Config` (§4.8
/// `registerSystem(S, attrs?)`).
#[derive(Clone, Copy, Debug)]
pub struct SystemAttributes {
    pub priority: i32,
}

impl Default for SystemAttributes {
    fn default() -> Self {
        SystemAttributes { priority: 0 }
    }
}

struct BoundBuffer {
    entries: Rc<RefCell<Vec<Entity>>>,
    seen: Rc<RefCell<FxHashSet<Entity>>>,
    dedup: bool,
}

impl BoundBuffer {
    fn clear(&self) {
        self.entries.borrow_mut().clear();
        if self.dedup {
            self.seen.borrow_mut().clear();
        }
    }
}

struct WorldEventBuffer {
    entries: Rc<RefCell<Vec<Rc<dyn Any>>>>,
}

impl WorldEventBuffer {
    fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

/// The per-system, per-tick view built from a resolved [`SystemConfig`]: live query slices and
/// drained-each-tick event buffers (§4.7, runtime fields 2).
pub struct SystemRuntime {
    query_ids: FxHashMap<String, QueryId>,
    query_entities: FxHashMap<String, Vec<Entity>>,
    query_events: FxHashMap<(String, String), BoundBuffer>,
    world_events: FxHashMap<String, WorldEventBuffer>,
}

impl SystemRuntime {
    fn build(
        config: SystemConfig,
        registry: &mut ComponentRegistry,
        store: &mut EntityStore,
        query_index: &mut QueryIndex,
        world_events: &mut EventDispatcher<Rc<dyn Any>>,
    ) -> Result<Self> {
        let mut query_ids = FxHashMap::default();
        let mut query_entities = FxHashMap::default();
        let mut query_events = FxHashMap::default();

        for spec in config.queries {
            let (id, matched) = query_index.get_or_create(registry, &spec.terms, store.iter_components())?;
            store.attach_query_membership(id, &matched);
            query_entities.insert(spec.name.clone(), query_index.query(id).entities().to_vec());
            query_ids.insert(spec.name.clone(), id);

            for binding in spec.events {
                bind_query_event(query_index.query_mut(id), registry, &spec.name, binding, &mut query_events);
            }
        }

        let mut world_buffers = FxHashMap::default();
        for (name, topic) in config.world_events {
            let entries: Rc<RefCell<Vec<Rc<dyn Any>>>> = Rc::new(RefCell::new(Vec::new()));
            let sink = entries.clone();
            let handler: Handler<Rc<dyn Any>> = Rc::new(move |payload: &Rc<dyn Any>| {
                sink.borrow_mut().push(payload.clone());
            });
            world_events.subscribe(&topic, handler);
            world_buffers.insert(name, WorldEventBuffer { entries });
        }

        Ok(SystemRuntime {
            query_ids,
            query_entities,
            query_events,
            world_events: world_buffers,
        })
    }

    fn refresh_queries(&mut self, query_index: &QueryIndex) {
        for (name, id) in &self.query_ids {
            if let Some(slot) = self.query_entities.get_mut(name) {
                slot.clear();
                slot.extend_from_slice(query_index.query(*id).entities());
            }
        }
    }

    fn clear_events(&self) {
        for buffer in self.query_events.values() {
            buffer.clear();
        }
        for buffer in self.world_events.values() {
            buffer.clear();
        }
    }

    pub fn query(&self, name: &str) -> &[Entity] {
        self.query_entities.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn query_event(&self, query_name: &str, event_name: &str) -> Vec<Entity> {
        self.query_events
            .get(&(query_name.to_string(), event_name.to_string()))
            .map(|b| b.entries.borrow().clone())
            .unwrap_or_default()
    }

    pub fn world_event(&self, name: &str) -> Vec<Rc<dyn Any>> {
        self.world_events.get(name).map(|b| b.entries.borrow().clone()).unwrap_or_default()
    }
}

fn bind_query_event(
    query: &mut Query,
    registry: &mut ComponentRegistry,
    query_name: &str,
    binding: QueryEventBinding,
    out: &mut FxHashMap<(String, String), BoundBuffer>,
) {
    let dedup = !matches!(binding.kind, EventKind::ComponentChanged);
    if matches!(binding.kind, EventKind::EntityChanged | EventKind::ComponentChanged) {
        query.mark_reactive();
    }

    let component_filter: Option<Vec<ComponentTypeId>> = binding
        .components
        .map(|terms| terms.iter().map(|t| t.resolve(registry)).collect());

    let topic = match binding.kind {
        EventKind::EntityAdded => TOPIC_ENTITY_ADDED,
        EventKind::EntityRemoved => TOPIC_ENTITY_REMOVED,
        EventKind::EntityChanged | EventKind::ComponentChanged => TOPIC_COMPONENT_CHANGED,
    };

    let entries: Rc<RefCell<Vec<Entity>>> = Rc::new(RefCell::new(Vec::new()));
    let seen: Rc<RefCell<FxHashSet<Entity>>> = Rc::new(RefCell::new(FxHashSet::default()));

    let sink_entries = entries.clone();
    let sink_seen = seen.clone();
    let handler: Handler<QueryEvent> = Rc::new(move |event: &QueryEvent| {
        let (entity, changed_type) = match *event {
            QueryEvent::EntityAdded(e) | QueryEvent::EntityRemoved(e) => (e, None),
            QueryEvent::ComponentChanged(e, t) => (e, Some(t)),
        };
        if let (Some(filter), Some(changed_type)) = (&component_filter, changed_type) {
            if !filter.contains(&changed_type) {
                return;
            }
        }
        if dedup && !sink_seen.borrow_mut().insert(entity) {
            return;
        }
        sink_entries.borrow_mut().push(entity);
    });
    query.subscribe(topic, handler);

    out.insert((query_name.to_string(), binding.event_name), BoundBuffer { entries, seen, dedup });
}

/// Behavior executed once per tick (§4.7). `execute` receives the owning [`World`] so it can read
/// and mutate components through `Entity`-keyed accessors while also reading this call's
/// [`SystemRuntime`] view of its declared queries and events.
pub trait System {
    fn init(&mut self) -> Option<SystemConfig> {
        None
    }

    fn execute(&mut self, world: &mut World, runtime: &SystemRuntime, delta: f64, time: f64) -> Result<()>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

pub struct SystemStats {
    pub name: String,
    pub priority: i32,
    pub last_execute_micros: u64,
    pub query_keys: Vec<String>,
}

struct SystemEntry {
    system: Box<dyn System>,
    runtime: SystemRuntime,
    priority: i32,
    enabled: bool,
    name: String,
    last_execute_micros: u64,
    query_keys: Vec<String>,
}

/// Holds registered systems in priority order and drives one tick's worth of execution (§4.8).
#[derive(Default)]
pub struct Scheduler {
    entries: Vec<SystemEntry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_system(
        &mut self,
        mut system: Box<dyn System>,
        attrs: SystemAttributes,
        registry: &mut ComponentRegistry,
        store: &mut EntityStore,
        query_index: &mut QueryIndex,
        world_events: &mut EventDispatcher<Rc<dyn Any>>,
    ) -> Result<()> {
        let config = system.init().unwrap_or_default();
        let name = system.name().to_string();
        let query_keys: Vec<String> = config.queries.iter().map(|q| crate::query::term_key(&q.terms)).collect();
        let runtime = SystemRuntime::build(config, registry, store, query_index, world_events)?;

        let entry = SystemEntry {
            system,
            runtime,
            priority: attrs.priority,
            enabled: true,
            name,
            last_execute_micros: 0,
            query_keys,
        };

        let pos = self
            .entries
            .iter()
            .position(|e| e.priority > attrs.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
        Ok(())
    }

    /// Removes every system whose `name()` matches. Names are expected unique per registered
    /// instance.
    pub fn remove_system(&mut self, name: &str) {
        self.entries.retain(|e| e.name != name);
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.enabled = enabled;
        }
    }

    pub fn stats(&self) -> Vec<SystemStats> {
        self.entries
            .iter()
            .map(|e| SystemStats {
                name: e.name.clone(),
                priority: e.priority,
                last_execute_micros: e.last_execute_micros,
                query_keys: e.query_keys.clone(),
            })
            .collect()
    }

    /// Runs every enabled system in priority order, then flushes deferred store removals
    /// (§4.8, §4.5). The caller (`World::tick`) must have swapped its `scheduler` field out via
    /// `mem::take` before calling this so the `&mut World` here doesn't alias `self`.
    pub fn tick(&mut self, world: &mut World, delta: f64, time: f64) {
        for entry in &mut self.entries {
            if !entry.enabled {
                continue;
            }
            entry.runtime.refresh_queries(world.query_index());
            let start = std::time::Instant::now();
            let result = entry.system.execute(world, &entry.runtime, delta, time);
            entry.last_execute_micros = start.elapsed().as_micros() as u64;
            if let Err(err) = result {
                error!(system = %entry.name, error = %err, "system execute failed");
            }
            entry.runtime.clear_events();
        }
        world.process_deferred();
    }
}
