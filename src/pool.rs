//! Object Pool (§4.1): a pre-allocated free list of `T` with a defined reset-on-acquire contract.
//!
//! Growth policy: when the free list is empty, grow by `ceil(0.2 * total) + 1` before satisfying
//! the acquire. The pool never shrinks on release.

use downcast_rs::{impl_downcast, Downcast};
use std::any::type_name;
use tracing::debug;

/// Trait implemented by anything that can live inside a [`Pool`].
///
/// `reset` restores an instance to its canonical initial state. The default implementation just
/// replaces the value with `Default::default()`; overriding `reset` is how a type opts into a
/// cheaper or more specific reset than a full `Default::default()` rebuild.
pub trait Poolable: Default + 'static {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A growable free list of `T`, addressed by stable slot indices.
///
/// Slots are never moved once assigned: growth only appends, so an index handed out by `acquire`
/// stays valid for as long as the caller holds it, even across later growth.
pub struct Pool<T: Poolable> {
    storage: Vec<T>,
    free: Vec<usize>,
    type_name: &'static str,
}

impl<T: Poolable> Pool<T> {
    pub fn new() -> Self {
        Pool {
            storage: Vec::new(),
            free: Vec::new(),
            type_name: type_name::<T>(),
        }
    }

    /// Acquire a slot, growing the pool first if the free list is empty.
    pub fn acquire(&mut self) -> usize {
        if self.free.is_empty() {
            self.grow();
        }
        let slot = self.free.pop().expect("pool was grown but is still empty");
        self.storage[slot].reset();
        slot
    }

    pub fn release(&mut self, slot: usize) {
        self.free.push(slot);
    }

    pub fn get(&self, slot: usize) -> &T {
        &self.storage[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut T {
        &mut self.storage[slot]
    }

    pub fn total(&self) -> usize {
        self.storage.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn used_count(&self) -> usize {
        self.total() - self.free_count()
    }

    fn grow(&mut self) {
        let total = self.storage.len();
        let growth = ((total as f64 * 0.2).ceil() as usize) + 1;
        let start = self.storage.len();
        self.storage.reserve(growth);
        for _ in 0..growth {
            self.storage.push(T::default());
        }
        self.free.extend((start..start + growth).rev());
        debug!(type_name = self.type_name, total = self.storage.len(), added = growth, "pool grew");
    }
}

impl<T: Poolable> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased handle to a [`Pool<T>`], so the [`crate::component::ComponentRegistry`] can hold
/// pools of heterogeneous component types in one collection and still report per-type stats.
pub trait AnyPool: Downcast {
    fn total(&self) -> usize;
    fn free_count(&self) -> usize;
    fn used_count(&self) -> usize;
    fn type_name(&self) -> &'static str;
    fn release_slot(&mut self, slot: usize);
}
impl_downcast!(AnyPool);

impl<T: Poolable> AnyPool for Pool<T> {
    fn total(&self) -> usize {
        Pool::total(self)
    }
    fn free_count(&self) -> usize {
        Pool::free_count(self)
    }
    fn used_count(&self) -> usize {
        Pool::used_count(self)
    }
    fn type_name(&self) -> &'static str {
        self.type_name
    }
    fn release_slot(&mut self, slot: usize) {
        self.release(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
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
    fn acquire_grows_by_twenty_percent_plus_one() {
        let mut pool: Pool<Pos> = Pool::new();
        assert_eq!(pool.total(), 0);

        let first = pool.acquire();
        assert_eq!(pool.total(), 1); // ceil(0.2*0)+1 == 1
        assert_eq!(first, 0);

        let second = pool.acquire();
        assert_eq!(pool.total(), 1 + 2); // ceil(0.2*1)+1 == 2
        assert_eq!(second, 1);
    }

    #[test]
    fn conservation_holds_across_acquire_release() {
        let mut pool: Pool<Pos> = Pool::new();
        let slots: Vec<usize> = (0..10).map(|_| pool.acquire()).collect();
        assert_eq!(pool.used_count() + pool.free_count(), pool.total());

        for s in &slots[..4] {
            pool.release(*s);
        }
        assert_eq!(pool.used_count() + pool.free_count(), pool.total());
        assert_eq!(pool.used_count(), 6);
    }

    #[test]
    fn acquire_resets_fields() {
        let mut pool: Pool<Pos> = Pool::new();
        let slot = pool.acquire();
        pool.get_mut(slot).x = 3.0;
        pool.get_mut(slot).y = 4.0;
        pool.release(slot);

        let slot2 = pool.acquire();
        assert_eq!(pool.get(slot2).x, 0.0);
        assert_eq!(pool.get(slot2).y, 0.0);
    }

    #[test]
    fn release_does_not_shrink() {
        let mut pool: Pool<Pos> = Pool::new();
        let slots: Vec<usize> = (0..5).map(|_| pool.acquire()).collect();
        let total_before = pool.total();
        for s in slots {
            pool.release(s);
        }
        assert_eq!(pool.total(), total_before);
        assert_eq!(pool.free_count(), total_before);
    }
}
