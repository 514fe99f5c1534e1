//! Keeping stored groups aligned with what the host renders.
//!
//! [`Reconciler`] only owns the timers: the debounced sweep, the periodic
//! deep cleanup and the [`Watchdog`]. The passes themselves are free
//! functions over the registry, the index and the view so the engine decides
//! when they run.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::groups::{GroupId, GroupRegistry};
use crate::host::{query_anchors, GroupView, HostAdapter, SessionAnchor};
use crate::live_index::{BindingOwner, LiveIndex};

pub mod watchdog;

pub use watchdog::{HealthSample, Verdict, Watchdog, WatchdogPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePolicy {
    /// Quiet period after the last container mutation before a sweep
    pub sweep_debounce: Duration,
    pub deep_cleanup_interval: Duration,
    pub watchdog: WatchdogPolicy,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            sweep_debounce: Duration::from_millis(250),
            deep_cleanup_interval: Duration::from_secs(5 * 60),
            watchdog: WatchdogPolicy::default(),
        }
    }
}

pub struct Reconciler {
    policy: ReconcilePolicy,
    sweep_at: Option<Instant>,
    next_deep_cleanup: Option<Instant>,
    watchdog: Watchdog,
}

impl Reconciler {
    pub fn new(policy: ReconcilePolicy) -> Self {
        let watchdog = Watchdog::new(policy.watchdog.clone());
        Self {
            policy,
            sweep_at: None,
            next_deep_cleanup: None,
            watchdog,
        }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Start the periodic timers from `now`
    pub fn start(&mut self, now: Instant) {
        self.next_deep_cleanup = Some(now + self.policy.deep_cleanup_interval);
        self.watchdog.start(now);
    }

    pub fn stop(&mut self) {
        self.sweep_at = None;
        self.next_deep_cleanup = None;
        self.watchdog.stop();
    }

    /// The container changed; push the sweep out by the debounce window
    pub fn note_mutation(&mut self, now: Instant) {
        self.sweep_at = Some(now + self.policy.sweep_debounce);
    }

    pub fn sweep_pending(&self) -> bool {
        self.sweep_at.is_some()
    }

    /// True once per burst, when the debounce window has passed
    pub fn take_sweep(&mut self, now: Instant) -> bool {
        match self.sweep_at {
            Some(at) if now >= at => {
                self.sweep_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn take_deep_cleanup(&mut self, now: Instant) -> bool {
        match self.next_deep_cleanup {
            Some(at) if now >= at => {
                self.next_deep_cleanup = Some(now + self.policy.deep_cleanup_interval);
                true
            }
            _ => false,
        }
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn watchdog_mut(&mut self) -> &mut Watchdog {
        &mut self.watchdog
    }
}

/// Copy host-displayed titles onto stored chats and their group entries.
///
/// Only paths the index knows about are considered. Returns the number of
/// chats whose title changed.
pub fn sync_titles(
    registry: &mut GroupRegistry,
    index: &LiveIndex,
    view: &mut dyn GroupView,
    anchors: &[SessionAnchor],
) -> usize {
    let mut changed = 0;
    for anchor in anchors {
        if !index.contains_path(&anchor.path) {
            continue;
        }
        for group_id in registry.groups_containing(&anchor.path) {
            if !registry.update_title(&group_id, &anchor.path, &anchor.title) {
                continue;
            }
            changed += 1;
            for binding in index.bindings(&anchor.path) {
                if binding.owner == BindingOwner::Group(group_id.clone()) {
                    view.set_text(binding.element, &anchor.title);
                }
            }
        }
    }
    if changed > 0 {
        debug!(changed, "synced titles");
    }
    changed
}

/// Host anchors to check deletions against, or `None` when the host list
/// cannot be trusted right now.
pub fn deletion_snapshot(host: &dyn HostAdapter) -> Option<Vec<SessionAnchor>> {
    if !host.container_present() || host.overlay_present() {
        return None;
    }
    query_anchors(host)
}

/// Drop chats whose session the host no longer lists.
///
/// Chats without a resolvable path are placeholders and stay, as does
/// `unlisted_ok`: a session just created that the host may not list yet.
/// Returns the groups that lost at least one chat.
pub fn sync_deletions(
    registry: &mut GroupRegistry,
    anchors: &[SessionAnchor],
    unlisted_ok: Option<&str>,
) -> Vec<GroupId> {
    let mut listed: HashSet<&str> = anchors.iter().map(|a| a.path.as_str()).collect();
    listed.extend(unlisted_ok);
    let ids: Vec<GroupId> = registry.order().to_vec();
    let mut changed = Vec::new();
    for id in ids {
        let removed = registry.retain_chats(&id, |chat| match chat.path() {
            Some(path) => listed.contains(path.as_str()),
            None => true,
        });
        if removed > 0 {
            debug!(group_id = %id, removed, "dropped deleted sessions");
            changed.push(id);
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::ChatRef;
    use crate::host::{ElementId, MemoryHost};
    use crate::store::{WritePolicy, WriteScheduler};

    fn registry() -> GroupRegistry {
        GroupRegistry::new(WriteScheduler::new(WritePolicy::default()))
    }

    fn anchor(path: &str, title: &str, element: u64) -> SessionAnchor {
        SessionAnchor {
            path: path.into(),
            title: title.into(),
            element: ElementId(element),
        }
    }

    #[test]
    fn mutations_inside_the_window_coalesce_into_one_sweep() {
        let start = Instant::now();
        let mut reconciler = Reconciler::new(ReconcilePolicy::default());
        reconciler.note_mutation(start);
        reconciler.note_mutation(start + Duration::from_millis(200));
        assert!(!reconciler.take_sweep(start + Duration::from_millis(300)));
        assert!(reconciler.take_sweep(start + Duration::from_millis(450)));
        assert!(!reconciler.take_sweep(start + Duration::from_millis(900)));
    }

    #[test]
    fn deep_cleanup_runs_on_its_interval() {
        let start = Instant::now();
        let mut reconciler = Reconciler::new(ReconcilePolicy::default());
        assert!(!reconciler.take_deep_cleanup(start + Duration::from_secs(3600)));

        reconciler.start(start);
        assert!(!reconciler.take_deep_cleanup(start + Duration::from_secs(60)));
        assert!(reconciler.take_deep_cleanup(start + Duration::from_secs(301)));
        assert!(!reconciler.take_deep_cleanup(start + Duration::from_secs(302)));
    }

    #[test]
    fn title_sync_updates_chat_and_entry_text() {
        let mut registry = registry();
        let work = registry.insert("Work");
        registry.upsert_chat(&work, ChatRef::new("/c/abc", "Draft"));

        let mut view = MemoryHost::new();
        let group = registry.group(&work).cloned().unwrap();
        view.render_group(&group);
        let entry = view.append_entry(&work, &group.chats[0]);

        let mut index = LiveIndex::new(100);
        index.register("/c/abc", BindingOwner::Group(work.clone()), entry);

        let anchors = vec![anchor("/c/abc", "Draft v2", 50)];
        assert_eq!(sync_titles(&mut registry, &index, &mut view, &anchors), 1);

        let chats = &registry.group(&work).unwrap().chats;
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].title, "Draft v2");
        assert_eq!(view.text_of(entry), Some("Draft v2"));

        // Second pass is a no-op
        assert_eq!(sync_titles(&mut registry, &index, &mut view, &anchors), 0);
    }

    #[test]
    fn title_sync_ignores_unindexed_paths() {
        let mut registry = registry();
        let work = registry.insert("Work");
        registry.upsert_chat(&work, ChatRef::new("/c/abc", "Draft"));
        let mut view = MemoryHost::new();
        let index = LiveIndex::new(100);

        let anchors = vec![anchor("/c/abc", "Draft v2", 50)];
        assert_eq!(sync_titles(&mut registry, &index, &mut view, &anchors), 0);
    }

    #[test]
    fn deletion_sync_removes_from_every_group_and_keeps_placeholders() {
        let mut registry = registry();
        let work = registry.insert("Work");
        let personal = registry.insert("Personal");
        let other = registry.insert("Other");
        registry.upsert_chat(&work, ChatRef::new("/c/123", "shared"));
        registry.upsert_chat(&work, ChatRef::new("", "pending"));
        registry.upsert_chat(&personal, ChatRef::new("/c/123", "shared"));
        registry.upsert_chat(&personal, ChatRef::new("/c/456", "kept"));
        registry.upsert_chat(&other, ChatRef::new("/c/456", "kept"));

        let anchors = vec![anchor("/c/456", "kept", 1)];
        let changed = sync_deletions(&mut registry, &anchors, None);
        assert_eq!(changed, vec![work.clone(), personal.clone()]);

        assert!(!registry.group_contains(&work, "/c/123"));
        assert!(!registry.group_contains(&personal, "/c/123"));
        assert_eq!(registry.group(&work).unwrap().chats.len(), 1);
        assert!(registry.group_contains(&personal, "/c/456"));
    }

    #[test]
    fn deletion_sync_spares_a_just_created_session() {
        let mut registry = registry();
        let work = registry.insert("Work");
        registry.upsert_chat(&work, ChatRef::new("/c/just-made", "New chat"));
        registry.upsert_chat(&work, ChatRef::new("/c/open", "Open"));

        let changed = sync_deletions(&mut registry, &[], Some("/c/just-made"));
        assert_eq!(changed, vec![work.clone()]);
        assert!(registry.group_contains(&work, "/c/just-made"));
        assert!(!registry.group_contains(&work, "/c/open"));
    }

    #[test]
    fn deletion_snapshot_is_skipped_when_the_host_list_is_unreliable() {
        let mut host = MemoryHost::new();
        host.add_session("/c/1", "one");
        assert_eq!(deletion_snapshot(&host).map(|a| a.len()), Some(1));

        host.set_overlay(true);
        assert!(deletion_snapshot(&host).is_none());
        host.set_overlay(false);

        host.fail_queries(Some(crate::error::HostError::DetachedNode));
        assert!(deletion_snapshot(&host).is_none());
        host.fail_queries(None);

        host.set_container_present(false);
        assert!(deletion_snapshot(&host).is_none());
    }
}
