//! Event Dispatcher (§4.2): a named-topic, multi-listener fan-out used both by the Entity Store's
//! global event stream and by each [`crate::query::Query`]'s local `EntityAdded`/`EntityRemoved`/
//! `ComponentChanged` topics.

use fxhash::FxHashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::warn;

/// A subscribed listener. Identity for `unsubscribe`/`has` is the pointer identity of the
/// `Rc<dyn Fn>` itself, not its effect, so re-subscribing the same handler twice is a no-op.
pub type Handler<E> = Rc<dyn Fn(&E)>;

fn same_handler<E>(a: &Handler<E>, b: &Handler<E>) -> bool {
    Rc::ptr_eq(a, b)
}

/// Fan-out dispatcher for a fixed event payload type `E`, with listeners grouped by string topic.
///
/// `emit` iterates a clone of the topic's handler `Vec` (an `Rc` clone per handler, so this is a
/// cheap snapshot) so that a handler is free to subscribe or unsubscribe during its own
/// invocation without disturbing the in-flight dispatch.
pub struct EventDispatcher<E> {
    topics: FxHashMap<String, Vec<Handler<E>>>,
    fired: u64,
    handled: u64,
}

impl<E> EventDispatcher<E> {
    pub fn new() -> Self {
        EventDispatcher {
            topics: FxHashMap::default(),
            fired: 0,
            handled: 0,
        }
    }

    pub fn subscribe(&mut self, topic: &str, handler: Handler<E>) {
        let listeners = self.topics.entry(topic.to_string()).or_insert_with(Vec::new);
        if !listeners.iter().any(|h| same_handler(h, &handler)) {
            listeners.push(handler);
        }
    }

    pub fn unsubscribe(&mut self, topic: &str, handler: &Handler<E>) {
        if let Some(listeners) = self.topics.get_mut(topic) {
            listeners.retain(|h| !same_handler(h, handler));
        }
    }

    pub fn has(&self, topic: &str, handler: &Handler<E>) -> bool {
        self.topics
            .get(topic)
            .map(|listeners| listeners.iter().any(|h| same_handler(h, handler)))
            .unwrap_or(false)
    }

    pub fn emit(&mut self, topic: &str, payload: &E) {
        self.fired += 1;
        let snapshot = match self.topics.get(topic) {
            Some(listeners) => listeners.clone(),
            None => return,
        };
        for handler in &snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| handler(payload)));
            if result.is_err() {
                warn!(topic, "event handler panicked; remaining handlers still run");
            }
            self.handled += 1;
        }
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    pub fn handled(&self) -> u64 {
        self.handled
    }
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn duplicate_subscriptions_are_ignored() {
        let mut dispatcher: EventDispatcher<i32> = EventDispatcher::new();
        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();
        let handler: Handler<i32> = Rc::new(move |_| *calls2.borrow_mut() += 1);

        dispatcher.subscribe("tick", handler.clone());
        dispatcher.subscribe("tick", handler.clone());
        dispatcher.emit("tick", &1);

        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn handler_can_unsubscribe_itself_mid_emit() {
        let dispatcher = Rc::new(RefCell::new(EventDispatcher::<i32>::new()));
        let calls = Rc::new(RefCell::new(0));

        let calls2 = calls.clone();
        let dispatcher2 = dispatcher.clone();
        let handler: Handler<i32> = Rc::new(move |_| {
            *calls2.borrow_mut() += 1;
        });
        dispatcher.borrow_mut().subscribe("topic", handler.clone());

        // unsubscribe happens "during" conceptually the same tick, after snapshot was taken.
        dispatcher.borrow_mut().emit("topic", &1);
        dispatcher2.borrow_mut().unsubscribe("topic", &handler);
        dispatcher.borrow_mut().emit("topic", &1);

        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let mut dispatcher: EventDispatcher<i32> = EventDispatcher::new();
        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();

        dispatcher.subscribe("topic", Rc::new(|_| panic!("boom")));
        dispatcher.subscribe("topic", Rc::new(move |_| *calls2.borrow_mut() += 1));

        dispatcher.emit("topic", &7);

        assert_eq!(*calls.borrow(), 1);
        assert_eq!(dispatcher.handled(), 2);
    }
}
