//! The engine: one owner for the model, the index and every in-flight flow.
//!
//! Embedders construct one [`Engine`] per page, call [`Engine::init`], then
//! feed it host events and periodic [`Engine::tick`]s. All work happens inside
//! those calls; nothing blocks and nothing runs in the background.
//!
//! Lifecycle: `Idle -> WaitingForHost -> Running -> TornDown`. A torn-down
//! engine can be initialized again and keeps its in-memory model.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::creation::{pick_new_chat, CancellationToken, CreationFlow, Observation, Trigger};
use crate::error::EngineError;
use crate::groups::{normalize_path, ChatRef, GroupId, GroupRegistry, LastActive, LoadReport};
use crate::host::{
    query_anchors, Anchor, ElementId, GroupView, HostAdapter, HostEvent, ObserverHandle,
    SessionAnchor,
};
use crate::live_index::{BindingOwner, FrameBudget, LiveIndex, RenderQueue};
use crate::reconcile::{
    deletion_snapshot, sync_deletions, sync_titles, HealthSample, Reconciler, Verdict,
};
use crate::store::{PersistentStore, WriteScheduler};
use crate::tracker::{ActiveSessionTracker, TrackerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    /// Model loaded, host container not seen yet
    WaitingForHost,
    Running,
    TornDown,
}

pub struct Engine<H, S>
where
    H: HostAdapter + GroupView,
    S: PersistentStore,
{
    config: EngineConfig,
    host: H,
    store: S,
    registry: GroupRegistry,
    index: LiveIndex,
    tracker: ActiveSessionTracker,
    reconciler: Reconciler,
    creations: Vec<CreationFlow>,
    frames: FrameBudget,
    render_queue: RenderQueue,
    observer: Option<ObserverHandle>,
    /// Session recorded by a creation that the host has not listed yet
    unlisted_creation: Option<String>,
    lifecycle: Lifecycle,
    loaded: bool,
}

impl<H, S> Engine<H, S>
where
    H: HostAdapter + GroupView,
    S: PersistentStore,
{
    pub fn new(config: EngineConfig, host: H, store: S) -> Self {
        let registry = GroupRegistry::new(WriteScheduler::new(config.write_policy()));
        let index = LiveIndex::new(config.aggressive_prune_threshold);
        let reconciler = Reconciler::new(config.reconcile_policy());
        let render_queue = RenderQueue::new(config.min_slice_items);
        Self {
            config,
            host,
            store,
            registry,
            index,
            tracker: ActiveSessionTracker::new(),
            reconciler,
            creations: Vec::new(),
            frames: FrameBudget::new(),
            render_queue,
            observer: None,
            unlisted_creation: None,
            lifecycle: Lifecycle::Idle,
            loaded: false,
        }
    }

    // ---- accessors ----

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn index(&self) -> &LiveIndex {
        &self.index
    }

    pub fn tracker(&self) -> &ActiveSessionTracker {
        &self.tracker
    }

    pub fn frame_budget(&self) -> &FrameBudget {
        &self.frames
    }

    /// Creation flows still waiting for the host
    pub fn listening_creations(&self) -> usize {
        self.creations.iter().filter(|f| f.is_listening()).count()
    }

    /// Entries still waiting for a render slice
    pub fn pending_renders(&self) -> usize {
        self.render_queue.pending()
    }

    fn current_path(&self) -> String {
        normalize_path(&self.host.current_path()).unwrap_or_else(|| "/".to_string())
    }

    // ---- lifecycle ----

    /// Load the model (first time only) and start waiting for the host.
    ///
    /// Returns the load report on the first initialization.
    pub fn init(&mut self, now: Instant) -> Result<Option<LoadReport>, EngineError> {
        if matches!(self.lifecycle, Lifecycle::WaitingForHost | Lifecycle::Running) {
            return Err(EngineError::AlreadyInitialized);
        }

        let report = if self.loaded {
            None
        } else {
            let report = self.registry.load(&self.store, &self.config.presets);
            self.loaded = true;
            info!(
                groups = report.groups,
                seeded = report.seeded,
                migrated = report.migrated,
                "groups loaded"
            );
            Some(report)
        };

        self.lifecycle = Lifecycle::WaitingForHost;
        self.try_attach(now);
        Ok(report)
    }

    /// Attach to the host once its container exists. Returns true when the
    /// engine is running afterwards.
    pub fn try_attach(&mut self, now: Instant) -> bool {
        match self.lifecycle {
            Lifecycle::Running => return true,
            Lifecycle::WaitingForHost => {}
            Lifecycle::Idle | Lifecycle::TornDown => return false,
        }
        if !self.host.container_present() {
            return false;
        }
        match self.host.observe_container() {
            Ok(handle) => self.observer = Some(handle),
            Err(e) => {
                debug!(error = %e, "container observation failed, still waiting");
                return false;
            }
        }

        self.host.mount();
        self.index_host_list();
        self.render_all();
        self.reconciler.start(now);
        self.lifecycle = Lifecycle::Running;

        let path = self.current_path();
        self.resolve_and_highlight(&path);
        info!(groups = self.registry.len(), "attached to host");
        true
    }

    /// Flush pending writes and release every host resource
    pub fn teardown(&mut self, now: Instant) {
        if matches!(self.lifecycle, Lifecycle::Idle | Lifecycle::TornDown) {
            return;
        }
        self.registry.flush_now(now, &mut self.store);
        self.detach_ui();
        self.stop_creations();
        self.unlisted_creation = None;
        self.tracker.reset();
        self.lifecycle = Lifecycle::TornDown;
        info!("engine torn down");
    }

    /// Drop all observation and UI state and attach again. The model and any
    /// pending creation survive.
    pub fn reinitialize(&mut self, now: Instant) {
        if matches!(self.lifecycle, Lifecycle::Idle | Lifecycle::TornDown) {
            return;
        }
        warn!("reinitializing host attachment");
        self.detach_ui();
        self.lifecycle = Lifecycle::WaitingForHost;
        self.try_attach(now);
    }

    fn detach_ui(&mut self) {
        if let Some(handle) = self.observer.take() {
            self.host.disconnect(handle);
        }
        self.host.unmount();
        self.index.clear();
        self.render_queue.clear();
        self.reconciler.stop();
    }

    // ---- event dispatch ----

    pub fn handle_event(&mut self, event: HostEvent, now: Instant) {
        if self.lifecycle == Lifecycle::WaitingForHost {
            self.try_attach(now);
        }
        if self.lifecycle != Lifecycle::Running {
            return;
        }

        match event {
            HostEvent::ContainerMutated { added, removed } => {
                self.on_container_mutated(&added, &removed, now)
            }
            HostEvent::Navigated { path } => self.on_navigated(&path),
            HostEvent::Clicked { element } => self.on_click(element),
            HostEvent::NativeNewChat => self.on_native_new_chat(),
            HostEvent::MessageSent { path } => self.on_message_sent(&path),
            HostEvent::Frame => self.frames.record_frame(now),
        }
    }

    fn on_container_mutated(&mut self, added: &[Anchor], removed: &[ElementId], now: Instant) {
        for element in removed {
            self.index.evict_element(*element);
        }
        for anchor in added.iter().filter_map(SessionAnchor::from_anchor) {
            self.index
                .register(&anchor.path, BindingOwner::HostList, anchor.element);
            self.host.set_draggable(anchor.element);
        }
        self.index.evict_disconnected(&self.host);
        self.reconciler.note_mutation(now);
        self.feed_creations(Trigger::Mutation);
    }

    fn on_navigated(&mut self, raw: &str) {
        self.feed_creations(Trigger::Navigation);
        let path = normalize_path(raw).unwrap_or_else(|| "/".to_string());
        if self.unlisted_creation.as_deref().is_some_and(|p| p != path) {
            self.unlisted_creation = None;
        }
        self.resolve_and_highlight(&path);
    }

    fn on_click(&mut self, element: ElementId) {
        let Some((path, owner)) = self
            .index
            .lookup(element)
            .map(|(p, o)| (p.to_string(), o.clone()))
        else {
            debug!(?element, "click on unindexed element");
            return;
        };

        self.cancel_creations();
        match owner {
            BindingOwner::Group(group_id) => {
                self.tracker
                    .on_group_click(&mut self.registry, &path, &group_id, element);
                self.host.navigate_to(&path);
            }
            BindingOwner::HostList => self.tracker.on_host_click(&mut self.registry, &path),
        }
        self.tracker.apply_highlight(&self.index, &mut self.host);
    }

    fn on_native_new_chat(&mut self) {
        if !self.tracker.on_native_new_chat(&mut self.registry) {
            debug!("synthetic new chat observed");
            return;
        }
        self.cancel_creations();
        self.tracker.apply_highlight(&self.index, &mut self.host);
    }

    /// Bump the sent-to chat to the top of the active group
    fn on_message_sent(&mut self, raw: &str) {
        let Some(path) = normalize_path(raw) else {
            return;
        };
        let Some(group_id) = self.tracker.active_group().cloned() else {
            return;
        };
        let Some(chat) = self
            .registry
            .group(&group_id)
            .and_then(|g| g.position_of(&path).map(|i| g.chats[i].clone()))
        else {
            return;
        };
        self.registry.upsert_chat(&group_id, chat);
        self.schedule_render(&group_id);
    }

    // ---- creation handshake ----

    fn feed_creations(&mut self, trigger: Trigger) {
        if !self.creations.iter().any(CreationFlow::is_listening) {
            return;
        }
        let current = self.current_path();
        let anchors = query_anchors(&self.host).unwrap_or_default();

        let wins: Vec<Observation> = self
            .creations
            .iter_mut()
            .filter_map(|flow| flow.observe(trigger, &current, &anchors))
            .collect();
        self.creations.retain(CreationFlow::is_listening);

        for observation in wins {
            self.complete_creation(observation);
        }
    }

    fn complete_creation(&mut self, observation: Observation) {
        if !self.tracker.is_current(&observation.token) {
            debug!(
                group_id = %observation.group_id,
                token = %observation.token,
                "stale creation observation ignored"
            );
            return;
        }

        let group_id = observation.group_id.clone();
        let chat = self
            .registry
            .group(&group_id)
            .and_then(|group| pick_new_chat(&observation, group));
        self.tracker.finish_creation(&observation.token);

        if let Some(chat) = chat {
            if let Some(path) = chat.path() {
                self.registry
                    .set_last_active(&path, LastActive::Group(group_id.clone()));
                info!(group_id = %group_id, path = %path, "new chat recorded");
                self.unlisted_creation = Some(path);
            }
            self.registry.upsert_chat(&group_id, chat);
            self.schedule_render(&group_id);
        }

        let path = self.current_path();
        self.resolve_and_highlight(&path);
    }

    /// Deregister every creation flow's listeners
    fn stop_creations(&mut self) {
        for flow in &mut self.creations {
            flow.stop();
        }
        self.creations.clear();
    }

    fn cancel_creations(&mut self) {
        self.stop_creations();
        self.tracker.cancel_pending();
    }

    // ---- periodic work ----

    /// Run everything that is due at `now`
    pub fn tick(&mut self, now: Instant) {
        if self.lifecycle == Lifecycle::WaitingForHost {
            self.try_attach(now);
        }

        if self.lifecycle == Lifecycle::Running {
            self.expire_creations(now);
            self.run_render_slice();

            if self.reconciler.take_sweep(now) {
                self.sweep();
            }
            if self.reconciler.take_deep_cleanup(now) {
                self.deep_cleanup();
            }
            if let Some(drift) = self.reconciler.watchdog_mut().take_due(now) {
                self.check_health(drift, now);
            }
        }

        if self.lifecycle != Lifecycle::Idle {
            self.registry.poll_persistence(now, &mut self.store);
        }
    }

    fn expire_creations(&mut self, now: Instant) {
        let mut cleared = false;
        for flow in &mut self.creations {
            if flow.expire(now) && self.tracker.finish_creation(flow.token()) {
                debug!(group_id = %flow.group_id(), "pending creation expired");
                cleared = true;
            }
        }
        self.creations.retain(CreationFlow::is_listening);
        if cleared {
            let path = self.current_path();
            self.resolve_and_highlight(&path);
        }
    }

    fn run_render_slice(&mut self) {
        if self.render_queue.is_empty() {
            return;
        }
        let host = &mut self.host;
        let index = &mut self.index;
        let rendered = self.render_queue.run_slice(
            self.frames.slice_budget(),
            Instant::now,
            |group_id, chat| {
                let element = host.append_entry(group_id, chat);
                if let Some(path) = chat.path() {
                    index.register(&path, BindingOwner::Group(group_id.clone()), element);
                }
            },
        );
        if rendered > 0 {
            self.tracker.apply_highlight(&self.index, &mut self.host);
        }
    }

    /// Debounced title and deletion sync
    fn sweep(&mut self) {
        self.index.evict_disconnected(&self.host);

        if let Some(anchors) = query_anchors(&self.host) {
            sync_titles(&mut self.registry, &self.index, &mut self.host, &anchors);
        }

        let Some(anchors) = deletion_snapshot(&self.host) else {
            debug!("deletion sync skipped");
            return;
        };
        if self
            .unlisted_creation
            .as_ref()
            .is_some_and(|fresh| anchors.iter().any(|a| &a.path == fresh))
        {
            self.unlisted_creation = None;
        }
        let changed = sync_deletions(
            &mut self.registry,
            &anchors,
            self.unlisted_creation.as_deref(),
        );
        for group_id in &changed {
            self.schedule_render(group_id);
        }
        if !changed.is_empty() {
            self.tracker.apply_highlight(&self.index, &mut self.host);
        }
    }

    fn deep_cleanup(&mut self) {
        self.local_cleanup();

        let active = self.tracker.active_path().to_string();
        let index = &self.index;
        let pruned = self
            .registry
            .prune_last_active(|path| path == active || index.contains_path(path));
        debug!(pruned, "deep cleanup finished");
    }

    fn local_cleanup(&mut self) {
        self.index.evict_disconnected(&self.host);
        if let Some(anchors) = query_anchors(&self.host) {
            let listed: HashSet<String> = anchors.into_iter().map(|a| a.path).collect();
            self.index.prune(&listed, &self.host);
        }
        self.ensure_observer();
    }

    /// Replace a container observation that stopped delivering
    fn ensure_observer(&mut self) {
        if let Some(handle) = self.observer {
            if self.host.observer_alive(handle) {
                return;
            }
            debug!("container observer broken, replacing");
            self.host.disconnect(handle);
            self.observer = None;
        }
        match self.host.observe_container() {
            Ok(handle) => self.observer = Some(handle),
            Err(e) => debug!(error = %e, "could not observe container"),
        }
    }

    fn health_sample(&self) -> HealthSample {
        let listed = query_anchors(&self.host).map(|a| a.len()).unwrap_or(0);
        HealthSample {
            bindings: self.index.binding_count(),
            expected: listed + self.registry.total_chats(),
            wrapper_present: self.host.wrapper_present(),
            container_present: self.host.container_present(),
        }
    }

    fn check_health(&mut self, drift: std::time::Duration, now: Instant) {
        let sample = self.health_sample();
        if self.reconciler.watchdog_mut().assess(drift, &sample) == Verdict::Healthy {
            return;
        }
        self.local_cleanup();
        let sample = self.health_sample();
        if self.reconciler.watchdog_mut().reassess(&sample) == Verdict::Reinitialize {
            self.reinitialize(now);
        }
    }

    // ---- rendering ----

    fn index_host_list(&mut self) {
        let Some(anchors) = query_anchors(&self.host) else {
            return;
        };
        for anchor in anchors {
            self.index
                .register(&anchor.path, BindingOwner::HostList, anchor.element);
            self.host.set_draggable(anchor.element);
        }
    }

    fn render_all(&mut self) {
        let order: Vec<GroupId> = self.registry.order().to_vec();
        for group_id in &order {
            self.schedule_render(group_id);
        }
        self.host.reorder_groups(&order);
    }

    /// Redraw a group header and queue its entries
    fn schedule_render(&mut self, group_id: &GroupId) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let Some(group) = self.registry.group(group_id) else {
            return;
        };
        self.index.evict_owner(group_id);
        self.host.render_group(group);
        self.render_queue.enqueue(group_id.clone(), group.chats.clone());
    }

    fn resolve_and_highlight(&mut self, path: &str) {
        self.tracker
            .resolve(&self.registry, &self.index, &self.host, path);
        self.tracker.apply_highlight(&self.index, &mut self.host);
    }

    // ---- command surface ----

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        match self.lifecycle {
            Lifecycle::WaitingForHost | Lifecycle::Running => Ok(()),
            Lifecycle::Idle | Lifecycle::TornDown => Err(EngineError::NotRunning),
        }
    }

    fn ensure_group(&self, group_id: &GroupId) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        if self.registry.contains(group_id) {
            Ok(())
        } else {
            Err(EngineError::UnknownGroup(group_id.clone()))
        }
    }

    pub fn create_group(&mut self, name: &str) -> Result<GroupId, EngineError> {
        self.ensure_loaded()?;
        if name.trim().is_empty() {
            return Err(EngineError::EmptyName);
        }
        let group_id = self.registry.insert(name);
        self.schedule_render(&group_id);
        self.host.reorder_groups(self.registry.order());
        Ok(group_id)
    }

    pub fn rename_group(&mut self, group_id: &GroupId, name: &str) -> Result<(), EngineError> {
        self.ensure_group(group_id)?;
        if name.trim().is_empty() {
            return Err(EngineError::EmptyName);
        }
        self.registry.rename(group_id, name);
        self.schedule_render(group_id);
        Ok(())
    }

    pub fn delete_group(&mut self, group_id: &GroupId) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        if self.registry.delete(group_id).is_none() {
            return Err(EngineError::UnknownGroup(group_id.clone()));
        }
        if self.tracker.pending().is_some_and(|(g, _)| g == group_id) {
            self.cancel_creations();
        }
        self.render_queue.cancel(group_id);
        self.index.evict_owner(group_id);
        self.host.remove_group(group_id);

        let path = self.tracker.active_path().to_string();
        self.resolve_and_highlight(&path);
        Ok(())
    }

    pub fn reorder_group(&mut self, group_id: &GroupId, index: usize) -> Result<(), EngineError> {
        self.ensure_group(group_id)?;
        self.registry.reorder(group_id, index);
        self.host.reorder_groups(self.registry.order());
        Ok(())
    }

    pub fn set_prompt(&mut self, group_id: &GroupId, prompt: &str) -> Result<(), EngineError> {
        self.ensure_group(group_id)?;
        self.registry.set_prompt(group_id, prompt);
        Ok(())
    }

    pub fn set_gap(&mut self, group_id: &GroupId, gap: i32) -> Result<(), EngineError> {
        self.ensure_group(group_id)?;
        self.registry.set_gap(group_id, gap);
        self.schedule_render(group_id);
        Ok(())
    }

    pub fn toggle_collapsed(&mut self, group_id: &GroupId) -> Result<(), EngineError> {
        self.ensure_group(group_id)?;
        self.registry.toggle_collapsed(group_id);
        self.schedule_render(group_id);
        Ok(())
    }

    pub fn toggle_show_all(&mut self, group_id: &GroupId) -> Result<(), EngineError> {
        self.ensure_group(group_id)?;
        self.registry.toggle_show_all(group_id);
        self.schedule_render(group_id);
        Ok(())
    }

    /// Pin or unpin `url` in a group. Ok(false) if the group lacks it.
    pub fn toggle_pinned(&mut self, group_id: &GroupId, url: &str) -> Result<bool, EngineError> {
        self.ensure_group(group_id)?;
        let Some(path) = normalize_path(url) else {
            return Ok(false);
        };
        let changed = self.registry.toggle_pinned(group_id, &path);
        if changed {
            self.schedule_render(group_id);
        }
        Ok(changed)
    }

    pub fn remove_chat(&mut self, group_id: &GroupId, url: &str) -> Result<bool, EngineError> {
        self.ensure_group(group_id)?;
        let Some(path) = normalize_path(url) else {
            return Ok(false);
        };
        let removed = self.registry.remove_chat(group_id, &path);
        if removed {
            self.schedule_render(group_id);
            let active = self.tracker.active_path().to_string();
            self.resolve_and_highlight(&active);
        }
        Ok(removed)
    }

    /// A session was dragged onto a group
    pub fn drop_chat(&mut self, group_id: &GroupId, chat: ChatRef) -> Result<bool, EngineError> {
        self.ensure_group(group_id)?;
        if chat.is_provisional() {
            return Ok(false);
        }
        self.registry.upsert_chat(group_id, chat);
        self.schedule_render(group_id);
        Ok(true)
    }

    /// Start a new chat that lands in `group_id` once the host creates it
    pub fn start_new_chat(
        &mut self,
        group_id: &GroupId,
        now: Instant,
    ) -> Result<CancellationToken, EngineError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(EngineError::NotRunning);
        }
        self.ensure_group(group_id)?;

        let mut baseline: HashSet<String> = query_anchors(&self.host)
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.path)
            .collect();
        baseline.extend(self.index.paths().map(str::to_string));
        baseline.insert(self.current_path());

        self.stop_creations();
        let token = self.tracker.begin_creation(group_id);
        self.registry
            .set_last_active("/", LastActive::Group(group_id.clone()));
        self.creations.push(CreationFlow::start(
            group_id.clone(),
            token.clone(),
            baseline,
            now,
            self.config.creation_timeout(),
        ));
        info!(group_id = %group_id, token = %token, "new chat requested");

        self.tracker.arm_native_suppression();
        if !self.host.trigger_native_new_chat() {
            self.tracker.disarm_native_suppression();
            let method = self.host.navigate_to("/");
            debug!(?method, "native new chat unavailable, navigated directly");
        }

        self.tracker.apply_highlight(&self.index, &mut self.host);
        Ok(token)
    }

    /// Redraw one group, or every group when `group_id` is `None`
    pub fn request_render(&mut self, group_id: Option<&GroupId>) -> Result<(), EngineError> {
        match group_id {
            Some(id) => {
                self.ensure_group(id)?;
                self.schedule_render(id);
            }
            None => {
                self.ensure_loaded()?;
                self.render_all();
            }
        }
        Ok(())
    }

    /// Write the whole model on the next flush
    pub fn request_persist(&mut self) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        self.registry.request_persist();
        Ok(())
    }

    /// True while a creation started from a group is unresolved
    pub fn creation_pending(&self) -> bool {
        matches!(self.tracker.state(), TrackerState::PendingCreation(..))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::StoreError;
    use crate::groups::PresetGroup;
    use crate::host::{MemoryHost, NavigationMethod};
    use crate::store::{MemoryStore, KEY_GROUPS, KEY_PRESET_SEEDED};

    type TestEngine = Engine<MemoryHost, MemoryStore>;

    fn config() -> EngineConfig {
        EngineConfig {
            presets: Vec::new(),
            ..EngineConfig::default()
        }
    }

    fn running(host: MemoryHost, now: Instant) -> TestEngine {
        let mut engine = Engine::new(config(), host, MemoryStore::new());
        engine.init(now).unwrap();
        settle(&mut engine, now);
        engine
    }

    /// Deliver queued host events and finish pending renders
    fn settle(engine: &mut TestEngine, now: Instant) {
        for _ in 0..100 {
            let events = engine.host_mut().drain_events();
            if events.is_empty() && engine.pending_renders() == 0 {
                return;
            }
            for event in events {
                engine.handle_event(event, now);
            }
            engine.tick(now);
        }
        panic!("engine did not settle");
    }

    fn entry_for(engine: &TestEngine, group_id: &GroupId, path: &str) -> ElementId {
        engine
            .index()
            .bindings(path)
            .iter()
            .find(|b| b.owner == BindingOwner::Group(group_id.clone()))
            .map(|b| b.element)
            .unwrap()
    }

    fn group_paths(engine: &TestEngine, group_id: &GroupId) -> Vec<String> {
        engine
            .registry()
            .group(group_id)
            .unwrap()
            .chats
            .iter()
            .map(|c| c.url.clone())
            .collect()
    }

    #[test]
    fn init_twice_is_refused() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        assert_eq!(engine.lifecycle(), Lifecycle::Running);
        assert_eq!(engine.init(now), Err(EngineError::AlreadyInitialized));
    }

    #[test]
    fn waits_for_the_host_container() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.set_container_present(false);
        let mut engine = Engine::new(config(), host, MemoryStore::new());
        engine.init(now).unwrap();
        assert_eq!(engine.lifecycle(), Lifecycle::WaitingForHost);

        engine.tick(now);
        assert_eq!(engine.lifecycle(), Lifecycle::WaitingForHost);

        engine.host_mut().set_container_present(true);
        engine.tick(now + Duration::from_millis(100));
        assert_eq!(engine.lifecycle(), Lifecycle::Running);
        assert!(engine.host().wrapper_present());
        assert_eq!(engine.host().live_observers(), 1);
    }

    #[test]
    fn commands_before_init_are_refused() {
        let mut engine = Engine::new(config(), MemoryHost::new(), MemoryStore::new());
        assert_eq!(engine.create_group("Work"), Err(EngineError::NotRunning));
    }

    #[test]
    fn preset_seeding_happens_once_across_reinitializations() {
        let now = Instant::now();
        let mut engine = Engine::new(EngineConfig::default(), MemoryHost::new(), MemoryStore::new());
        let report = engine.init(now).unwrap().unwrap();
        assert!(report.seeded);
        assert_eq!(engine.registry().len(), 3);

        let ids: Vec<GroupId> = engine.registry().order().to_vec();
        for id in &ids {
            engine.delete_group(id).unwrap();
        }
        engine.teardown(now);
        assert_eq!(engine.store().data().get(KEY_PRESET_SEEDED), Some(&serde_json::json!(true)));

        assert_eq!(engine.init(now), Ok(None));
        assert!(engine.registry().is_empty());

        // A fresh engine over the same store does not seed either
        let store = MemoryStore::with_data(engine.store().data().clone());
        let mut again = Engine::new(EngineConfig::default(), MemoryHost::new(), store);
        let report = again.init(now).unwrap().unwrap();
        assert!(!report.seeded);
        assert!(again.registry().is_empty());
    }

    #[test]
    fn host_rerender_rebinds_and_marks_draggable() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/a", "A");
        host.append_session("/c/b", "B");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/a", "A")).unwrap();
        settle(&mut engine, now);

        let old = engine.host().element_for("/c/a").unwrap();
        assert!(engine.host().is_draggable(old));
        assert_eq!(engine.index().bindings("/c/a").len(), 2);

        engine.host_mut().rerender_list();
        settle(&mut engine, now);

        let new = engine.host().element_for("/c/a").unwrap();
        assert_ne!(old, new);
        assert!(engine.index().lookup(old).is_none());
        assert_eq!(
            engine.index().lookup(new),
            Some(("/c/a", &BindingOwner::HostList))
        );
        assert!(engine.host().is_draggable(new));
        let older = engine.host().element_for("/c/b").unwrap();
        assert!(engine.host().is_draggable(older));

        // Group entries are untouched by a host re-render
        assert_eq!(engine.index().bindings("/c/a").len(), 2);
        assert_eq!(engine.host().entry_texts(&work), vec!["A".to_string()]);
    }

    #[test]
    fn painted_frames_set_the_render_budget() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        assert_eq!(engine.frame_budget().slice_budget(), Duration::from_millis(8));

        for i in 0..10u32 {
            engine.host_mut().paint_frame();
            let at = now + Duration::from_millis(8) * i;
            for event in engine.host_mut().drain_events() {
                engine.handle_event(event, at);
            }
        }
        assert_eq!(engine.frame_budget().mean_interval(), Duration::from_millis(8));
        assert_eq!(engine.frame_budget().slice_budget(), Duration::from_millis(4));
    }

    #[test]
    fn scenario_a_title_change_is_synced() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/abc", "Draft");
        let mut engine = running(host, now);

        let work = engine.create_group("Work").unwrap();
        engine
            .drop_chat(&work, ChatRef::new("/c/abc", "Draft"))
            .unwrap();
        settle(&mut engine, now);

        engine.host_mut().retitle_session("/c/abc", "Draft v2");
        settle(&mut engine, now);
        engine.tick(now + Duration::from_millis(300));

        let chats = &engine.registry().group(&work).unwrap().chats;
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].title, "Draft v2");
        let entry = entry_for(&engine, &work, "/c/abc");
        assert_eq!(engine.host().text_of(entry), Some("Draft v2"));
    }

    #[test]
    fn scenario_b_superseded_creation_is_ignored() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/old", "Old");
        let mut engine = running(host, now);
        let ideas = engine.create_group("Ideas").unwrap();
        let notes = engine.create_group("Notes").unwrap();
        settle(&mut engine, now);

        let t1 = engine.start_new_chat(&ideas, now).unwrap();
        settle(&mut engine, now);
        assert_eq!(engine.listening_creations(), 1);
        let t2 = engine.start_new_chat(&notes, now).unwrap();
        settle(&mut engine, now);
        assert_ne!(t1, t2);
        assert_eq!(engine.listening_creations(), 1);
        assert_eq!(engine.host().native_new_chat_clicks(), 2);
        assert!(engine.creation_pending());

        engine.host_mut().add_session("/c/new", "New chat");
        engine.host_mut().visit("/c/new");
        settle(&mut engine, now);

        assert!(!engine.registry().group_contains(&ideas, "/c/new"));
        assert!(engine.registry().group_contains(&notes, "/c/new"));
        assert!(!engine.creation_pending());
        assert_eq!(engine.listening_creations(), 0);
        assert_eq!(engine.tracker().active_group(), Some(&notes));
        assert_eq!(engine.host().indicator(), Some(&notes));
    }

    #[test]
    fn scenario_c_deleted_session_leaves_every_group() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/keep", "Keep");
        host.add_session("/c/123", "Doomed");
        let mut engine = running(host, now);

        let work = engine.create_group("Work").unwrap();
        let personal = engine.create_group("Personal").unwrap();
        for id in [&work, &personal] {
            engine.drop_chat(id, ChatRef::new("/c/123", "Doomed")).unwrap();
            engine.drop_chat(id, ChatRef::new("/c/keep", "Keep")).unwrap();
        }
        settle(&mut engine, now);
        assert_eq!(engine.index().bindings("/c/123").len(), 3);

        engine.host_mut().remove_session("/c/123");
        settle(&mut engine, now);
        let later = now + Duration::from_millis(300);
        engine.tick(later);
        settle(&mut engine, later);

        assert_eq!(group_paths(&engine, &work), vec!["/c/keep"]);
        assert_eq!(group_paths(&engine, &personal), vec!["/c/keep"]);
        assert!(!engine.index().contains_path("/c/123"));
    }

    #[test]
    fn deleting_the_open_session_removes_it() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/keep", "Keep");
        host.add_session("/c/open", "Open");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/keep", "Keep")).unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/open", "Open")).unwrap();
        settle(&mut engine, now);
        let entry = entry_for(&engine, &work, "/c/open");
        engine.host_mut().click(entry);
        settle(&mut engine, now);

        // Deleted by the host while still on its page
        engine.host_mut().remove_session("/c/open");
        settle(&mut engine, now);
        engine.tick(now + Duration::from_millis(300));

        assert_eq!(group_paths(&engine, &work), vec!["/c/keep"]);
    }

    #[test]
    fn created_session_is_spared_until_listed() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        let work = engine.create_group("Work").unwrap();
        engine.start_new_chat(&work, now).unwrap();
        settle(&mut engine, now);
        engine.host_mut().visit("/c/fresh");
        settle(&mut engine, now);

        // Listed once, then deleted: no longer spared
        engine.host_mut().add_session("/c/fresh", "Fresh");
        settle(&mut engine, now);
        let t1 = now + Duration::from_millis(300);
        engine.tick(t1);
        assert!(engine.registry().group_contains(&work, "/c/fresh"));

        engine.host_mut().remove_session("/c/fresh");
        settle(&mut engine, t1);
        engine.tick(t1 + Duration::from_millis(300));
        assert!(!engine.registry().group_contains(&work, "/c/fresh"));
    }

    #[test]
    fn scenario_d_quota_failures_write_a_degraded_payload() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        let work = engine.create_group("Work").unwrap();
        let _empty = engine.create_group("Empty").unwrap();
        let long_title = "x".repeat(200);
        for i in 0..60 {
            engine
                .drop_chat(&work, ChatRef::new(format!("/c/{i}"), long_title.clone()))
                .unwrap();
        }

        engine.store_mut().fail_next(StoreError::classify("QUOTA_BYTES quota exceeded"));
        engine.store_mut().fail_next(StoreError::classify("QUOTA_BYTES quota exceeded"));

        let mut t = now;
        for _ in 0..10 {
            t += Duration::from_secs(1);
            engine.tick(t);
        }

        let last = engine.store().writes().last().cloned().unwrap();
        let groups = last[KEY_GROUPS].as_object().unwrap();
        assert_eq!(groups.len(), 2);
        let chats = groups[work.as_str()]["chats"].as_array().unwrap();
        assert!(chats.len() <= 25);
        assert!(!chats.is_empty());
        for chat in chats {
            assert!(chat["title"].as_str().unwrap().chars().count() <= 40);
        }

        // The model itself is untouched
        assert_eq!(engine.registry().group(&work).unwrap().chats.len(), 60);
    }

    #[test]
    fn scenario_e_host_list_click_clears_the_indicator() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        let host_el = host.add_session("/c/shared", "Shared");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        engine
            .drop_chat(&work, ChatRef::new("/c/shared", "Shared"))
            .unwrap();
        settle(&mut engine, now);

        let entry = entry_for(&engine, &work, "/c/shared");
        engine.host_mut().click(entry);
        settle(&mut engine, now);
        assert_eq!(engine.host().indicator(), Some(&work));
        assert_eq!(
            engine.host().navigations(),
            &[("/c/shared".to_string(), NavigationMethod::HostLink)]
        );

        engine.host_mut().click(host_el);
        engine.host_mut().visit("/c/shared");
        settle(&mut engine, now);
        assert_eq!(engine.host().indicator(), None);
        assert!(engine.host().highlighted().is_empty());
        assert_eq!(engine.tracker().state(), &TrackerState::NoActiveGroup);
        assert_eq!(
            engine.registry().last_active("/c/shared"),
            Some(&LastActive::History)
        );
        assert!(engine.registry().group_contains(&work, "/c/shared"));
    }

    #[test]
    fn only_the_clicked_group_is_active() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/shared", "Shared");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        let personal = engine.create_group("Personal").unwrap();
        for id in [&work, &personal] {
            engine.drop_chat(id, ChatRef::new("/c/shared", "Shared")).unwrap();
        }
        settle(&mut engine, now);

        let entry = entry_for(&engine, &personal, "/c/shared");
        engine.host_mut().click(entry);
        settle(&mut engine, now);

        assert_eq!(engine.host().highlighted(), vec![entry]);
        assert_eq!(engine.host().indicator(), Some(&personal));

        // Re-rendering keeps the highlight on the same group only
        engine.request_render(None).unwrap();
        settle(&mut engine, now);
        let entry = entry_for(&engine, &personal, "/c/shared");
        assert_eq!(engine.host().highlighted(), vec![entry]);
    }

    #[test]
    fn navigation_without_click_uses_last_active() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/a", "A");
        host.add_session("/c/b", "B");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        let personal = engine.create_group("Personal").unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/a", "A")).unwrap();
        engine.drop_chat(&personal, ChatRef::new("/c/a", "A")).unwrap();
        engine.drop_chat(&personal, ChatRef::new("/c/b", "B")).unwrap();
        settle(&mut engine, now);

        let entry = entry_for(&engine, &personal, "/c/a");
        engine.host_mut().click(entry);
        settle(&mut engine, now);

        // Away and back through history
        engine.host_mut().visit("/c/b");
        settle(&mut engine, now);
        assert_eq!(engine.tracker().active_group(), Some(&personal));
        engine.host_mut().visit("/c/a");
        settle(&mut engine, now);
        assert_eq!(engine.tracker().active_group(), Some(&personal));
    }

    #[test]
    fn native_new_chat_clears_the_active_group() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/a", "A");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/a", "A")).unwrap();
        settle(&mut engine, now);
        let entry = entry_for(&engine, &work, "/c/a");
        engine.host_mut().click(entry);
        settle(&mut engine, now);

        engine.host_mut().click_native_new_chat();
        settle(&mut engine, now);
        assert_eq!(engine.tracker().active_group(), None);
        assert_eq!(engine.host().indicator(), None);
    }

    #[test]
    fn creation_falls_back_to_direct_navigation() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.set_native_new_chat_available(false);
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();

        engine.start_new_chat(&work, now).unwrap();
        settle(&mut engine, now);
        assert_eq!(
            engine.host().navigations(),
            &[("/".to_string(), NavigationMethod::PushState)]
        );
        assert_eq!(engine.host().indicator(), Some(&work));

        // The suppression flag was not left armed
        engine.host_mut().click_native_new_chat();
        settle(&mut engine, now);
        assert!(!engine.creation_pending());
    }

    #[test]
    fn creation_times_out() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        let work = engine.create_group("Work").unwrap();
        engine.start_new_chat(&work, now).unwrap();
        settle(&mut engine, now);
        assert!(engine.creation_pending());

        engine.tick(now + Duration::from_secs(11));
        assert!(!engine.creation_pending());
        assert_eq!(engine.host().indicator(), None);
    }

    #[test]
    fn creation_resolved_by_navigation_before_the_list_updates() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        let work = engine.create_group("Work").unwrap();
        engine.start_new_chat(&work, now).unwrap();
        settle(&mut engine, now);

        engine.host_mut().visit("/c/fresh");
        settle(&mut engine, now);
        assert_eq!(group_paths(&engine, &work), vec!["/c/fresh"]);
        assert_eq!(engine.tracker().active_group(), Some(&work));

        // A sweep before the host lists it does not delete it
        engine.host_mut().add_session("/c/other", "Other");
        settle(&mut engine, now);
        engine.tick(now + Duration::from_millis(300));
        assert!(engine.registry().group_contains(&work, "/c/fresh"));
    }

    #[test]
    fn message_send_bumps_the_chat() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/a", "A");
        host.add_session("/c/b", "B");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/b", "B")).unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/a", "A")).unwrap();
        settle(&mut engine, now);
        assert_eq!(group_paths(&engine, &work), vec!["/c/a", "/c/b"]);

        let entry = entry_for(&engine, &work, "/c/b");
        engine.host_mut().click(entry);
        settle(&mut engine, now);
        engine.host_mut().send_message();
        settle(&mut engine, now);
        assert_eq!(group_paths(&engine, &work), vec!["/c/b", "/c/a"]);
    }

    #[test]
    fn deleting_the_active_group_clears_the_indicator() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/a", "A");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/a", "A")).unwrap();
        settle(&mut engine, now);
        let entry = entry_for(&engine, &work, "/c/a");
        engine.host_mut().click(entry);
        settle(&mut engine, now);

        engine.delete_group(&work).unwrap();
        assert_eq!(engine.host().indicator(), None);
        assert!(engine.host().rendered_groups().is_empty());
        assert!(engine.index().bindings("/c/a").iter().all(|b| b.owner == BindingOwner::HostList));
        assert_eq!(engine.registry().last_active("/c/a"), None);
        assert_eq!(
            engine.delete_group(&work),
            Err(EngineError::UnknownGroup(work.clone()))
        );
    }

    #[test]
    fn reorder_moves_the_rendered_group() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        let work = engine.create_group("Work").unwrap();
        let ideas = engine.create_group("Ideas").unwrap();
        assert_eq!(engine.host().rendered_groups(), &[work.clone(), ideas.clone()]);

        engine.reorder_group(&ideas, 0).unwrap();
        assert_eq!(engine.registry().order(), &[ideas.clone(), work.clone()]);
        assert_eq!(engine.host().rendered_groups(), &[ideas, work]);
    }

    #[test]
    fn watchdog_reinitializes_when_the_container_vanishes() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/a", "A");
        let mut engine = running(host, now);

        engine.host_mut().set_container_present(false);
        engine.tick(now + Duration::from_secs(10));
        assert_eq!(engine.lifecycle(), Lifecycle::WaitingForHost);
        assert!(!engine.host().wrapper_present());

        engine.host_mut().set_container_present(true);
        engine.tick(now + Duration::from_secs(11));
        assert_eq!(engine.lifecycle(), Lifecycle::Running);
        assert!(engine.host().wrapper_present());
    }

    #[test]
    fn deep_cleanup_replaces_broken_observers_and_prunes_last_active() {
        let now = Instant::now();
        let mut host = MemoryHost::new();
        host.add_session("/c/a", "A");
        let mut engine = running(host, now);
        let work = engine.create_group("Work").unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/a", "A")).unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/x", "X")).unwrap();
        settle(&mut engine, now);
        let entry = entry_for(&engine, &work, "/c/x");
        engine.host_mut().click(entry);
        settle(&mut engine, now);
        assert!(engine.registry().last_active("/c/x").is_some());

        engine.remove_chat(&work, "/c/x").unwrap();
        engine.host_mut().visit("/c/a");
        settle(&mut engine, now);

        engine.host_mut().break_observers();
        assert_eq!(engine.host().live_observers(), 0);
        engine.tick(now + Duration::from_secs(301));
        assert_eq!(engine.host().live_observers(), 1);
        assert_eq!(engine.registry().last_active("/c/x"), None);
        assert_eq!(engine.lifecycle(), Lifecycle::Running);
    }

    #[test]
    fn persisted_snapshot_converges() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        let work = engine.create_group("Work").unwrap();
        engine.rename_group(&work, "Day job").unwrap();
        engine.set_prompt(&work, "be brief").unwrap();
        engine.set_gap(&work, 4).unwrap();
        engine.toggle_collapsed(&work).unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/a", "A")).unwrap();
        engine.drop_chat(&work, ChatRef::new("/c/b", "B")).unwrap();
        assert!(engine.toggle_pinned(&work, "/c/a").unwrap());
        engine.request_persist().unwrap();

        engine.tick(now);
        engine.tick(now + Duration::from_secs(3));

        let expected = engine.registry().snapshot();
        for (key, value) in &expected {
            assert_eq!(engine.store().data().get(key), Some(value), "key {key}");
        }
        assert!(!engine.registry().has_unsaved_changes());
    }

    #[test]
    fn rejected_commands_report_why() {
        let now = Instant::now();
        let mut engine = running(MemoryHost::new(), now);
        assert_eq!(engine.create_group("  "), Err(EngineError::EmptyName));
        let ghost = GroupId::new("f_ghost");
        assert_eq!(
            engine.set_prompt(&ghost, "x"),
            Err(EngineError::UnknownGroup(ghost.clone()))
        );
        let work = engine.create_group("Work").unwrap();
        assert_eq!(engine.rename_group(&work, ""), Err(EngineError::EmptyName));
        assert_eq!(engine.drop_chat(&work, ChatRef::new("", "pending")), Ok(false));
        assert_eq!(engine.remove_chat(&work, "/c/none"), Ok(false));
    }

    #[test]
    fn presets_with_prompts_are_seeded() {
        let now = Instant::now();
        let config = EngineConfig {
            presets: vec![PresetGroup {
                name: "Study".into(),
                prompt: "explain step by step".into(),
            }],
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config, MemoryHost::new(), MemoryStore::new());
        engine.init(now).unwrap();
        let group = engine.registry().groups_in_order().next().unwrap();
        assert_eq!(group.name, "Study");
        assert_eq!(group.prompt, "explain step by step");
    }
}
