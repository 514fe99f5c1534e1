//! In-memory store with injectable failures.

use std::collections::VecDeque;

use serde_json::{Map, Value};

use super::PersistentStore;
use crate::error::StoreError;

/// Store kept entirely in memory.
///
/// Used by tests and by embedders that persist elsewhere. Failures queued
/// with [`MemoryStore::fail_next`] are returned by subsequent `set` calls in
/// order; [`MemoryStore::invalidate_context`] makes every call fail the way a
/// torn-down host context does.
#[derive(Debug)]
pub struct MemoryStore {
    data: Map<String, Value>,
    failures: VecDeque<StoreError>,
    context_valid: bool,
    writes: Vec<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Map::new(),
            failures: VecDeque::new(),
            context_valid: true,
            writes: Vec::new(),
        }
    }

    /// Create a store pre-populated with `data`
    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            data,
            ..Self::new()
        }
    }

    /// Queue a failure for the next `set`
    pub fn fail_next(&mut self, error: StoreError) {
        self.failures.push_back(error);
    }

    pub fn invalidate_context(&mut self) {
        self.context_valid = false;
    }

    pub fn restore_context(&mut self) {
        self.context_valid = true;
    }

    /// Every payload that was successfully written, oldest first
    pub fn writes(&self) -> &[Map<String, Value>] {
        &self.writes
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        if !self.context_valid {
            return Err(StoreError::ContextInvalid("Extension context invalidated.".into()));
        }
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, patch: Map<String, Value>) -> Result<(), StoreError> {
        if !self.context_valid {
            return Err(StoreError::ContextInvalid("Extension context invalidated.".into()));
        }
        if let Some(err) = self.failures.pop_front() {
            return Err(err);
        }
        for (key, value) in &patch {
            self.data.insert(key.clone(), value.clone());
        }
        self.writes.push(patch);
        Ok(())
    }
}
