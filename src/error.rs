//! Crate-wide error surface.

use crate::entity::Entity;
use thiserror::Error;

/// Everything that can go fatally wrong while driving a [`crate::World`].
///
/// Conditions treated as silent no-ops (double-adding a component, removing a component an entity
/// doesn't own, looking up an unknown component) are *not* represented here — those return
/// `Option`/`()` at the call site instead of an `Err`.
#[derive(Debug, Error)]
pub enum Error {
    /// A query was constructed with zero required component types.
    #[error("query has an empty required set")]
    EmptyQuery,

    /// `remove_entity`/`remove_all_components` (or any other per-entity op that requires the
    /// entity to exist) was called on an entity the store has never seen or has already released.
    #[error("entity {0:?} is not known to this world")]
    UnknownEntity(Entity),

    /// A singleton was looked up by its derived name but no such singleton was ever registered.
    #[error("no singleton component registered under name {0:?}")]
    UnknownSingleton(String),
}

pub type Result<T> = std::result::Result<T, Error>;
