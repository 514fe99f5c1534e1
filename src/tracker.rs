//! Which group is active for the current path.
//!
//! Explicit clicks decide directly. Everything else (back/forward, host
//! redirects, late re-renders) goes through [`resolve_active`], a pure
//! priority rule over the persisted last-active map, the pending creation,
//! the last clicked entry and group membership. Mutation order never
//! matters.

use tracing::debug;

use crate::creation::CancellationToken;
use crate::groups::{GroupId, GroupRegistry, LastActive};
use crate::host::{ElementId, GroupView, HostAdapter};
use crate::live_index::LiveIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerState {
    NoActiveGroup,
    ActiveGroup(GroupId),
    PendingCreation(GroupId, CancellationToken),
}

/// Rule that produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Pending,
    LastActive,
    /// Last opened from the host list
    History,
    LastClicked,
    Scan,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub group: Option<GroupId>,
    pub source: ResolutionSource,
}

impl Resolution {
    fn to(group: GroupId, source: ResolutionSource) -> Self {
        Self {
            group: Some(group),
            source,
        }
    }

    fn none(source: ResolutionSource) -> Self {
        Self {
            group: None,
            source,
        }
    }
}

/// Decide the active group for `path`.
///
/// `pending` is the group of an in-flight creation. `clicked` is the path
/// and owning group of the last clicked entry, if that entry is still bound.
pub fn resolve_active(
    registry: &GroupRegistry,
    path: &str,
    pending: Option<&GroupId>,
    clicked: Option<(&str, &GroupId)>,
) -> Resolution {
    if let Some(group) = pending.filter(|g| registry.contains(g)) {
        return Resolution::to(group.clone(), ResolutionSource::Pending);
    }

    match registry.last_active(path) {
        Some(LastActive::History) => return Resolution::none(ResolutionSource::History),
        Some(LastActive::Group(group)) if registry.group_contains(group, path) => {
            return Resolution::to(group.clone(), ResolutionSource::LastActive);
        }
        _ => {}
    }

    if let Some((clicked_path, group)) = clicked {
        if clicked_path == path && registry.group_contains(group, path) {
            return Resolution::to(group.clone(), ResolutionSource::LastClicked);
        }
    }

    match registry
        .groups_in_order()
        .find(|g| g.contains_path(path))
    {
        Some(group) => Resolution::to(group.id.clone(), ResolutionSource::Scan),
        None => Resolution::none(ResolutionSource::Unresolved),
    }
}

#[derive(Debug)]
pub struct ActiveSessionTracker {
    state: TrackerState,
    active_path: String,
    last_clicked: Option<ElementId>,
    /// Set right before a synthetic native "new chat"; consumed by the next one
    suppress_native_once: bool,
    highlighted: Vec<ElementId>,
}

impl Default for ActiveSessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveSessionTracker {
    pub fn new() -> Self {
        Self {
            state: TrackerState::NoActiveGroup,
            active_path: "/".to_string(),
            last_clicked: None,
            suppress_native_once: false,
            highlighted: Vec::new(),
        }
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    /// Group shown as active: the active one, or the pending creation's
    pub fn active_group(&self) -> Option<&GroupId> {
        match &self.state {
            TrackerState::NoActiveGroup => None,
            TrackerState::ActiveGroup(g) | TrackerState::PendingCreation(g, _) => Some(g),
        }
    }

    pub fn pending(&self) -> Option<(&GroupId, &CancellationToken)> {
        match &self.state {
            TrackerState::PendingCreation(g, t) => Some((g, t)),
            _ => None,
        }
    }

    pub fn is_current(&self, token: &CancellationToken) -> bool {
        self.pending().is_some_and(|(_, t)| t == token)
    }

    pub fn active_path(&self) -> &str {
        &self.active_path
    }

    pub fn last_clicked(&self) -> Option<ElementId> {
        self.last_clicked
    }

    pub fn highlighted(&self) -> &[ElementId] {
        &self.highlighted
    }

    /// An entry inside a group was clicked
    pub fn on_group_click(
        &mut self,
        registry: &mut GroupRegistry,
        path: &str,
        group_id: &GroupId,
        element: ElementId,
    ) {
        registry.set_last_active(path, LastActive::Group(group_id.clone()));
        self.last_clicked = Some(element);
        self.active_path = path.to_string();
        self.state = TrackerState::ActiveGroup(group_id.clone());
        debug!(path, group_id = %group_id, "group entry clicked");
    }

    /// An entry in the host's own list was clicked
    pub fn on_host_click(&mut self, registry: &mut GroupRegistry, path: &str) {
        registry.set_last_active(path, LastActive::History);
        self.last_clicked = None;
        self.active_path = path.to_string();
        self.state = TrackerState::NoActiveGroup;
        debug!(path, "host entry clicked");
    }

    /// Enter pending creation for `group_id`, superseding any earlier one
    pub fn begin_creation(&mut self, group_id: &GroupId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some((old_group, old)) = self.pending() {
            debug!(group_id = %old_group, token = %old, "creation superseded");
        }
        self.state = TrackerState::PendingCreation(group_id.clone(), token.clone());
        token
    }

    /// Clear the pending creation if `token` is still current
    pub fn finish_creation(&mut self, token: &CancellationToken) -> bool {
        if !self.is_current(token) {
            return false;
        }
        self.state = TrackerState::NoActiveGroup;
        true
    }

    /// Drop any pending creation regardless of token
    pub fn cancel_pending(&mut self) {
        if self.pending().is_some() {
            self.state = TrackerState::NoActiveGroup;
        }
    }

    pub fn arm_native_suppression(&mut self) {
        self.suppress_native_once = true;
    }

    pub fn disarm_native_suppression(&mut self) {
        self.suppress_native_once = false;
    }

    /// The host's own "new chat" control fired.
    ///
    /// Returns false when the activation was our own synthetic one, which
    /// only consumes the suppression flag.
    pub fn on_native_new_chat(&mut self, registry: &mut GroupRegistry) -> bool {
        if self.suppress_native_once {
            self.suppress_native_once = false;
            return false;
        }
        registry.clear_last_active("/");
        self.state = TrackerState::NoActiveGroup;
        self.last_clicked = None;
        self.active_path = "/".to_string();
        true
    }

    /// Re-derive the active group for `path` from current state
    pub fn resolve(
        &mut self,
        registry: &GroupRegistry,
        index: &LiveIndex,
        host: &dyn HostAdapter,
        path: &str,
    ) -> Resolution {
        let clicked = self
            .last_clicked
            .filter(|e| host.is_connected(*e))
            .and_then(|e| index.lookup(e))
            .and_then(|(p, owner)| owner.group().map(|g| (p, g)));

        let pending = self.pending().map(|(g, t)| (g.clone(), t.clone()));
        let resolution = resolve_active(
            registry,
            path,
            pending.as_ref().map(|(g, _)| g),
            clicked,
        );

        self.active_path = path.to_string();
        self.state = match (&resolution.source, pending, &resolution.group) {
            (ResolutionSource::Pending, Some((g, t)), _) => TrackerState::PendingCreation(g, t),
            (_, _, Some(g)) => TrackerState::ActiveGroup(g.clone()),
            (_, _, None) => TrackerState::NoActiveGroup,
        };
        debug!(path, group = ?resolution.group, source = ?resolution.source, "resolved active group");
        resolution
    }

    /// Highlight the active group's entries for the active path and move the
    /// group indicator. Entries in the host list are never highlighted.
    pub fn apply_highlight(&mut self, index: &LiveIndex, view: &mut dyn GroupView) {
        for element in self.highlighted.drain(..) {
            view.set_highlight(element, false);
        }

        let active = match &self.state {
            TrackerState::ActiveGroup(g) | TrackerState::PendingCreation(g, _) => Some(g.clone()),
            TrackerState::NoActiveGroup => None,
        };
        if let Some(group_id) = &active {
            for binding in index.bindings(&self.active_path) {
                if binding.owner.group() == Some(group_id) {
                    view.set_highlight(binding.element, true);
                    self.highlighted.push(binding.element);
                }
            }
        }
        view.set_group_indicator(active.as_ref());
    }

    /// Forget everything but the persisted map (used on reinit)
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
