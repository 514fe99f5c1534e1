//! Persistence boundary.
//!
//! The backend is a flat key/value store that merges writes at key
//! granularity. It may throttle, run out of quota, or disappear entirely
//! when the host context is torn down; [`WriteScheduler`] absorbs all of it.

use serde_json::{Map, Value};

use crate::error::StoreError;

pub mod degrade;
pub mod file;
pub mod memory;
pub mod scheduler;

pub use degrade::QuotaPolicy;
pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use scheduler::{FlushOutcome, WritePolicy, WriteScheduler};

/// Key holding the group map (id -> group body)
pub const KEY_GROUPS: &str = "groups";
/// Key holding the display order of group ids
pub const KEY_ORDER: &str = "order";
/// Key holding the path -> last active group map
pub const KEY_LAST_ACTIVE: &str = "lastActive";
/// Key holding the one-time preset seeding flag
pub const KEY_PRESET_SEEDED: &str = "presetSeeded";

/// Key/value backend
pub trait PersistentStore {
    /// Read one key. `Ok(None)` when the key was never written.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Merge `patch` into the store, replacing each listed key wholesale.
    fn set(&mut self, patch: Map<String, Value>) -> Result<(), StoreError>;
}
