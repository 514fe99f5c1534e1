//! Ephemeral index of rendered session elements.
//!
//! Maps a normalized session path to every element currently representing
//! it, either inside a group's list or in the host's own list. Nothing here
//! is persisted; the index is rebuilt from observation and must shed
//! bindings whose elements leave the document.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::groups::GroupId;
use crate::host::{ElementId, HostAdapter};

pub mod budget;

pub use budget::{FrameBudget, RenderQueue};

/// Which list rendered a binding's element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingOwner {
    Group(GroupId),
    /// The host's own ungrouped list
    HostList,
}

impl BindingOwner {
    pub fn group(&self) -> Option<&GroupId> {
        match self {
            BindingOwner::Group(id) => Some(id),
            BindingOwner::HostList => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveBinding {
    pub owner: BindingOwner,
    pub element: ElementId,
}

#[derive(Debug, Default)]
pub struct LiveIndex {
    by_path: HashMap<String, Vec<LiveBinding>>,
    by_element: HashMap<ElementId, String>,
    /// Above this many paths, pruning drops unlisted paths wholesale
    aggressive_threshold: usize,
}

impl LiveIndex {
    pub fn new(aggressive_threshold: usize) -> Self {
        Self {
            by_path: HashMap::new(),
            by_element: HashMap::new(),
            aggressive_threshold,
        }
    }

    /// Bind `element` to `path`. Returns false if the exact binding exists.
    ///
    /// An element can only represent one path; rebinding it moves it.
    pub fn register(&mut self, path: &str, owner: BindingOwner, element: ElementId) -> bool {
        if let Some(previous) = self.by_element.get(&element) {
            if previous == path {
                let bindings = self.by_path.entry(path.to_string()).or_default();
                if bindings.iter().any(|b| b.element == element && b.owner == owner) {
                    return false;
                }
                bindings.retain(|b| b.element != element);
                bindings.push(LiveBinding { owner, element });
                return true;
            }
            self.evict_element(element);
        }

        self.by_path
            .entry(path.to_string())
            .or_default()
            .push(LiveBinding { owner, element });
        self.by_element.insert(element, path.to_string());
        true
    }

    /// Drop the binding for `element`. Returns true if one existed.
    pub fn evict_element(&mut self, element: ElementId) -> bool {
        let Some(path) = self.by_element.remove(&element) else {
            return false;
        };
        if let Some(bindings) = self.by_path.get_mut(&path) {
            bindings.retain(|b| b.element != element);
            if bindings.is_empty() {
                self.by_path.remove(&path);
            }
        }
        true
    }

    /// Drop every binding rendered by `group_id`
    pub fn evict_owner(&mut self, group_id: &GroupId) -> usize {
        let elements: Vec<ElementId> = self
            .by_path
            .values()
            .flatten()
            .filter(|b| b.owner.group() == Some(group_id))
            .map(|b| b.element)
            .collect();
        for element in &elements {
            self.evict_element(*element);
        }
        elements.len()
    }

    /// Drop every binding whose element left the document
    pub fn evict_disconnected(&mut self, host: &dyn HostAdapter) -> usize {
        let dead: Vec<ElementId> = self
            .by_element
            .keys()
            .copied()
            .filter(|e| !host.is_connected(*e))
            .collect();
        for element in &dead {
            self.evict_element(*element);
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "evicted detached bindings");
        }
        dead.len()
    }

    /// Drop bindings for paths the host no longer lists.
    ///
    /// Past the aggressive threshold every unlisted path goes at once.
    /// Below it, unlisted paths only lose bindings that are detached or that
    /// claim to come from the host list.
    pub fn prune(&mut self, listed: &HashSet<String>, host: &dyn HostAdapter) -> usize {
        let unlisted: Vec<String> = self
            .by_path
            .keys()
            .filter(|p| !listed.contains(*p))
            .cloned()
            .collect();

        let aggressive = self.by_path.len() > self.aggressive_threshold;
        let mut dropped = 0;
        for path in unlisted {
            let victims: Vec<ElementId> = match self.by_path.get(&path) {
                Some(bindings) => bindings
                    .iter()
                    .filter(|b| {
                        aggressive
                            || b.owner == BindingOwner::HostList
                            || !host.is_connected(b.element)
                    })
                    .map(|b| b.element)
                    .collect(),
                None => continue,
            };
            for element in victims {
                self.evict_element(element);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, aggressive, "pruned unlisted bindings");
        }
        dropped
    }

    pub fn bindings(&self, path: &str) -> &[LiveBinding] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Path and owner bound to `element`
    pub fn lookup(&self, element: ElementId) -> Option<(&str, &BindingOwner)> {
        let path = self.by_element.get(&element)?;
        let binding = self
            .by_path
            .get(path)?
            .iter()
            .find(|b| b.element == element)?;
        Some((path.as_str(), &binding.owner))
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.by_path.keys().map(String::as_str)
    }

    pub fn path_count(&self) -> usize {
        self.by_path.len()
    }

    pub fn binding_count(&self) -> usize {
        self.by_element.len()
    }

    pub fn clear(&mut self) {
        self.by_path.clear();
        self.by_element.clear();
    }
}
