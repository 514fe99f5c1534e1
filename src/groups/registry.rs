//! Authoritative in-memory model of groups.
//!
//! Every mutator applies synchronously and marks the persisted keys it
//! touched as dirty. Dirty keys are handed to the [`WriteScheduler`] on the
//! next [`GroupRegistry::poll_persistence`]; callers never wait for a write.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{ChatRef, Group, GroupId, LastActive, PresetGroup, StoredGroup};
use crate::store::{
    FlushOutcome, PersistentStore, WriteScheduler, KEY_GROUPS, KEY_LAST_ACTIVE, KEY_ORDER,
    KEY_PRESET_SEEDED,
};

/// Persisted keys with unsaved changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DirtyKeys {
    groups: bool,
    order: bool,
    last_active: bool,
    preset_seeded: bool,
}

impl DirtyKeys {
    fn all() -> Self {
        Self {
            groups: true,
            order: true,
            last_active: true,
            preset_seeded: true,
        }
    }

    fn any(&self) -> bool {
        self.groups || self.order || self.last_active || self.preset_seeded
    }
}

/// Summary of a [`GroupRegistry::load`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub groups: usize,
    pub seeded: bool,
    pub migrated: usize,
}

pub struct GroupRegistry {
    groups: HashMap<GroupId, Group>,
    order: Vec<GroupId>,
    last_active: BTreeMap<String, LastActive>,
    preset_seeded: bool,
    dirty: DirtyKeys,
    scheduler: WriteScheduler,
}

impl GroupRegistry {
    pub fn new(scheduler: WriteScheduler) -> Self {
        Self {
            groups: HashMap::new(),
            order: Vec::new(),
            last_active: BTreeMap::new(),
            preset_seeded: false,
            dirty: DirtyKeys::default(),
            scheduler,
        }
    }

    /// Replace the in-memory model with what the store holds.
    ///
    /// Seeds `presets` the first time a store is seen. A store that cannot be
    /// read is treated as already seeded so a transient failure never causes
    /// a second seeding.
    pub fn load(&mut self, store: &dyn PersistentStore, presets: &[PresetGroup]) -> LoadReport {
        let mut report = self.load_existing(store);

        if !self.preset_seeded {
            for preset in presets {
                let id = self.insert(&preset.name);
                if let Some(group) = self.groups.get_mut(&id) {
                    group.prompt = preset.prompt.clone();
                }
            }
            self.preset_seeded = true;
            self.dirty.preset_seeded = true;
            report.seeded = true;
            info!(count = presets.len(), "seeded preset groups");
        }

        report.groups = self.groups.len();
        report
    }

    /// Hydrate from the store without seeding. The seeding flag is read but
    /// never written, so a later [`GroupRegistry::load`] still seeds.
    pub fn load_existing(&mut self, store: &dyn PersistentStore) -> LoadReport {
        self.groups.clear();
        self.order.clear();
        self.last_active.clear();
        self.dirty = DirtyKeys::default();

        let mut report = LoadReport::default();

        if let Some(Value::Object(raw_groups)) = read_key(store, KEY_GROUPS) {
            for (id, body) in raw_groups {
                match serde_json::from_value::<StoredGroup>(body) {
                    Ok(stored) => {
                        let id = GroupId::new(id);
                        let (group, migrated) = stored.into_group(id.clone());
                        if migrated {
                            report.migrated += 1;
                        }
                        self.groups.insert(id, group);
                    }
                    Err(e) => warn!(group_id = %id, error = %e, "skipping unreadable group"),
                }
            }
        }
        if report.migrated > 0 {
            info!(count = report.migrated, "migrated legacy groups without prompt");
            self.dirty.groups = true;
        }

        let stored_order: Vec<GroupId> = read_key(store, KEY_ORDER)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        self.repair_order(stored_order);

        if let Some(value) = read_key(store, KEY_LAST_ACTIVE) {
            match serde_json::from_value::<BTreeMap<String, LastActive>>(value) {
                Ok(map) => self.last_active = map,
                Err(e) => warn!(error = %e, "discarding unreadable last-active map"),
            }
        }

        self.preset_seeded = match store.get(KEY_PRESET_SEEDED) {
            Ok(Some(Value::Bool(flag))) => flag,
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "could not read seeding flag, assuming seeded");
                true
            }
        };

        report.groups = self.groups.len();
        report
    }

    /// Drop unknown ids from `stored`, then append groups it is missing.
    fn repair_order(&mut self, stored: Vec<GroupId>) {
        let mut seen = HashSet::new();
        let mut order: Vec<GroupId> = stored
            .into_iter()
            .filter(|id| self.groups.contains_key(id) && seen.insert(id.clone()))
            .collect();

        let mut missing: Vec<GroupId> = self
            .groups
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        missing.sort();

        if !missing.is_empty() {
            self.dirty.order = true;
        }
        order.extend(missing);
        self.order = order;
    }

    // ---- reads ----

    pub fn group(&self, id: &GroupId) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn contains(&self, id: &GroupId) -> bool {
        self.groups.contains_key(id)
    }

    pub fn order(&self) -> &[GroupId] {
        &self.order
    }

    /// Groups in display order
    pub fn groups_in_order(&self) -> impl Iterator<Item = &Group> {
        self.order.iter().filter_map(|id| self.groups.get(id))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn total_chats(&self) -> usize {
        self.groups.values().map(|g| g.chats.len()).sum()
    }

    /// Ids of every group holding `path`, in display order
    pub fn groups_containing(&self, path: &str) -> Vec<GroupId> {
        self.groups_in_order()
            .filter(|g| g.contains_path(path))
            .map(|g| g.id.clone())
            .collect()
    }

    pub fn group_contains(&self, id: &GroupId, path: &str) -> bool {
        self.groups.get(id).is_some_and(|g| g.contains_path(path))
    }

    pub fn last_active(&self, path: &str) -> Option<&LastActive> {
        self.last_active.get(path)
    }

    pub fn last_active_map(&self) -> &BTreeMap<String, LastActive> {
        &self.last_active
    }

    pub fn preset_seeded(&self) -> bool {
        self.preset_seeded
    }

    // ---- group mutators ----

    /// Create an empty group at the end of the order
    pub fn insert(&mut self, name: &str) -> GroupId {
        let mut id = GroupId::generate();
        let mut suffix = 1;
        while self.groups.contains_key(&id) {
            id = GroupId::new(format!("{}_{}", GroupId::generate(), suffix));
            suffix += 1;
        }

        self.groups
            .insert(id.clone(), Group::new(id.clone(), name.trim()));
        self.order.push(id.clone());
        self.dirty.groups = true;
        self.dirty.order = true;
        debug!(group_id = %id, name, "group created");
        id
    }

    pub fn rename(&mut self, id: &GroupId, name: &str) -> bool {
        self.with_group(id, |g| g.name = name.trim().to_string())
    }

    /// Remove a group along with any last-active entries pointing at it
    pub fn delete(&mut self, id: &GroupId) -> Option<Group> {
        let group = self.groups.remove(id)?;
        self.order.retain(|g| g != id);
        let before = self.last_active.len();
        self.last_active
            .retain(|_, v| !matches!(v, LastActive::Group(g) if g == id));
        if self.last_active.len() != before {
            self.dirty.last_active = true;
        }
        self.dirty.groups = true;
        self.dirty.order = true;
        debug!(group_id = %id, "group deleted");
        Some(group)
    }

    /// Move a group to `index` in the display order (clamped)
    pub fn reorder(&mut self, id: &GroupId, index: usize) -> bool {
        let Some(from) = self.order.iter().position(|g| g == id) else {
            return false;
        };
        let moved = self.order.remove(from);
        let to = index.min(self.order.len());
        self.order.insert(to, moved);
        self.dirty.order = true;
        true
    }

    pub fn set_prompt(&mut self, id: &GroupId, prompt: &str) -> bool {
        self.with_group(id, |g| g.prompt = prompt.to_string())
    }

    pub fn set_gap(&mut self, id: &GroupId, gap: i32) -> bool {
        self.with_group(id, |g| g.gap = gap)
    }

    pub fn toggle_collapsed(&mut self, id: &GroupId) -> bool {
        self.with_group(id, |g| g.collapsed = !g.collapsed)
    }

    pub fn toggle_show_all(&mut self, id: &GroupId) -> bool {
        self.with_group(id, |g| g.show_all = !g.show_all)
    }

    fn with_group(&mut self, id: &GroupId, f: impl FnOnce(&mut Group)) -> bool {
        match self.groups.get_mut(id) {
            Some(group) => {
                f(group);
                self.dirty.groups = true;
                true
            }
            None => false,
        }
    }

    // ---- chat mutators ----

    /// Insert or bump a chat.
    ///
    /// Pinned entries form a contiguous prefix in pin order. An unpinned chat
    /// is (re)inserted at the head of the unpinned section; a pinned one keeps
    /// its slot and only has its title refreshed, or is appended to the pinned
    /// prefix if new.
    pub fn upsert_chat(&mut self, id: &GroupId, chat: ChatRef) -> bool {
        let Some(group) = self.groups.get_mut(id) else {
            return false;
        };

        let existing = chat.path().and_then(|p| group.position_of(&p));
        let pinned = chat.pinned || existing.is_some_and(|i| group.chats[i].pinned);

        match existing {
            Some(i) if pinned => {
                let entry = &mut group.chats[i];
                entry.title = chat.title;
                entry.url = chat.url;
            }
            Some(i) => {
                group.chats.remove(i);
                let at = group.pinned_count();
                group.chats.insert(at, chat);
            }
            None => {
                let at = group.pinned_count();
                group.chats.insert(at, ChatRef { pinned, ..chat });
            }
        }

        self.dirty.groups = true;
        true
    }

    /// Remove the chat at `path`. Returns true if it was present.
    pub fn remove_chat(&mut self, id: &GroupId, path: &str) -> bool {
        let Some(group) = self.groups.get_mut(id) else {
            return false;
        };
        let Some(i) = group.position_of(path) else {
            return false;
        };
        group.chats.remove(i);
        self.dirty.groups = true;
        true
    }

    /// Flip the pin on `path`, moving it to the edge of the pinned prefix
    pub fn toggle_pinned(&mut self, id: &GroupId, path: &str) -> bool {
        let Some(group) = self.groups.get_mut(id) else {
            return false;
        };
        let Some(i) = group.position_of(path) else {
            return false;
        };

        let mut chat = group.chats.remove(i);
        chat.pinned = !chat.pinned;
        // Pinning appends to the pinned prefix, unpinning heads the rest
        let at = group.pinned_count();
        group.chats.insert(at, chat);
        self.dirty.groups = true;
        true
    }

    /// Set the stored title for `path`. Returns true if it changed.
    pub fn update_title(&mut self, id: &GroupId, path: &str, title: &str) -> bool {
        let Some(group) = self.groups.get_mut(id) else {
            return false;
        };
        let Some(i) = group.position_of(path) else {
            return false;
        };
        if group.chats[i].title == title {
            return false;
        }
        group.chats[i].title = title.to_string();
        self.dirty.groups = true;
        true
    }

    /// Keep only the chats for which `keep` returns true. Returns the number
    /// removed.
    pub fn retain_chats(&mut self, id: &GroupId, mut keep: impl FnMut(&ChatRef) -> bool) -> usize {
        let Some(group) = self.groups.get_mut(id) else {
            return 0;
        };
        let before = group.chats.len();
        group.chats.retain(|c| keep(c));
        let removed = before - group.chats.len();
        if removed > 0 {
            self.dirty.groups = true;
        }
        removed
    }

    // ---- last-active map ----

    pub fn set_last_active(&mut self, path: &str, value: LastActive) {
        if self.last_active.get(path) == Some(&value) {
            return;
        }
        self.last_active.insert(path.to_string(), value);
        self.dirty.last_active = true;
    }

    pub fn clear_last_active(&mut self, path: &str) -> bool {
        let removed = self.last_active.remove(path).is_some();
        if removed {
            self.dirty.last_active = true;
        }
        removed
    }

    /// Drop group entries whose path fails `keep`; history markers stay.
    pub fn prune_last_active(&mut self, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.last_active.len();
        self.last_active
            .retain(|path, value| matches!(value, LastActive::History) || keep(path.as_str()));
        let removed = before - self.last_active.len();
        if removed > 0 {
            self.dirty.last_active = true;
        }
        removed
    }

    // ---- persistence ----

    /// Full persisted representation of the model
    pub fn snapshot(&self) -> Map<String, Value> {
        self.patch_for(DirtyKeys::all())
    }

    fn patch_for(&self, keys: DirtyKeys) -> Map<String, Value> {
        let mut patch = Map::new();
        if keys.groups {
            patch.insert(KEY_GROUPS.into(), to_value(&self.groups));
        }
        if keys.order {
            patch.insert(KEY_ORDER.into(), to_value(&self.order));
        }
        if keys.last_active {
            patch.insert(KEY_LAST_ACTIVE.into(), to_value(&self.last_active));
        }
        if keys.preset_seeded {
            patch.insert(KEY_PRESET_SEEDED.into(), Value::Bool(self.preset_seeded));
        }
        patch
    }

    /// Mark the whole model for writing
    pub fn request_persist(&mut self) {
        self.dirty = DirtyKeys::all();
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty.any() || !self.scheduler.is_idle()
    }

    /// Hand dirty keys to the scheduler, then let it flush if due
    pub fn poll_persistence(
        &mut self,
        now: Instant,
        store: &mut dyn PersistentStore,
    ) -> Option<FlushOutcome> {
        self.stage_dirty(now);
        self.scheduler.poll(now, store)
    }

    /// Write everything pending right away (used on teardown)
    pub fn flush_now(&mut self, now: Instant, store: &mut dyn PersistentStore) -> Option<FlushOutcome> {
        self.stage_dirty(now);
        self.scheduler.flush_now(now, store)
    }

    fn stage_dirty(&mut self, now: Instant) {
        if !self.dirty.any() {
            return;
        }
        let patch = self.patch_for(self.dirty);
        self.dirty = DirtyKeys::default();
        self.scheduler.schedule(patch, now);
    }

    pub fn scheduler(&self) -> &WriteScheduler {
        &self.scheduler
    }
}

fn read_key(store: &dyn PersistentStore, key: &str) -> Option<Value> {
    match store.get(key) {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "store read failed");
            None
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
