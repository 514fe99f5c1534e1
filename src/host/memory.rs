//! In-memory host page.
//!
//! Simulates the host's session list, location, native controls and the
//! group wrapper closely enough to drive the engine without a browser. Every
//! change a real page would signal is queued as a [`HostEvent`]; embedders
//! (and tests) drain them with [`MemoryHost::drain_events`] and feed them to
//! the engine.

use std::collections::HashMap;

use super::{Anchor, ElementId, GroupView, HostAdapter, HostEvent, NavigationMethod, ObserverHandle};
use crate::error::HostError;
use crate::groups::{normalize_path, ChatRef, Group, GroupId};

#[derive(Debug, Clone, Default)]
struct ElementState {
    connected: bool,
    text: String,
    highlighted: bool,
    draggable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryHost {
    next_element: u64,
    elements: HashMap<ElementId, ElementState>,
    /// Host list in render order: (element, href)
    host_list: Vec<(ElementId, String)>,
    container_present: bool,
    overlay: bool,
    current_path: String,
    query_error: Option<HostError>,
    next_observer: u64,
    observers: HashMap<ObserverHandle, bool>,
    native_new_chat_available: bool,
    native_new_chat_clicks: usize,
    navigations: Vec<(String, NavigationMethod)>,
    events: Vec<HostEvent>,
    wrapper: bool,
    rendered_groups: Vec<GroupId>,
    group_entries: HashMap<GroupId, Vec<ElementId>>,
    indicator: Option<GroupId>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            container_present: true,
            current_path: "/".to_string(),
            native_new_chat_available: true,
            ..Self::default()
        }
    }

    fn new_element(&mut self, text: &str) -> ElementId {
        self.next_element += 1;
        let id = ElementId(self.next_element);
        self.elements.insert(
            id,
            ElementState {
                connected: true,
                text: text.to_string(),
                ..ElementState::default()
            },
        );
        id
    }

    fn detach(&mut self, element: ElementId) {
        if let Some(state) = self.elements.get_mut(&element) {
            state.connected = false;
            state.highlighted = false;
        }
    }

    fn anchor_for(&self, element: ElementId, href: &str) -> Anchor {
        Anchor {
            path: href.to_string(),
            title: self.text_of(element).unwrap_or_default().to_string(),
            element,
        }
    }

    fn position_of(&self, href: &str) -> Option<usize> {
        let target = normalize_path(href);
        self.host_list
            .iter()
            .position(|(_, h)| normalize_path(h) == target)
    }

    // ---- simulation ----

    /// Render a new session at the top of the host list
    pub fn add_session(&mut self, href: &str, title: &str) -> ElementId {
        let element = self.new_element(title);
        self.host_list.insert(0, (element, href.to_string()));
        let anchor = self.anchor_for(element, href);
        self.events.push(HostEvent::ContainerMutated {
            added: vec![anchor],
            removed: Vec::new(),
        });
        element
    }

    /// Render a session at the bottom of the host list (older history)
    pub fn append_session(&mut self, href: &str, title: &str) -> ElementId {
        let element = self.new_element(title);
        self.host_list.push((element, href.to_string()));
        let anchor = self.anchor_for(element, href);
        self.events.push(HostEvent::ContainerMutated {
            added: vec![anchor],
            removed: Vec::new(),
        });
        element
    }

    /// Delete a session from the host list
    pub fn remove_session(&mut self, href: &str) {
        let Some(i) = self.position_of(href) else {
            return;
        };
        let (element, _) = self.host_list.remove(i);
        self.detach(element);
        self.events.push(HostEvent::ContainerMutated {
            added: Vec::new(),
            removed: vec![element],
        });
    }

    /// Change the displayed title of a session in place
    pub fn retitle_session(&mut self, href: &str, title: &str) {
        let Some(i) = self.position_of(href) else {
            return;
        };
        let element = self.host_list[i].0;
        if let Some(state) = self.elements.get_mut(&element) {
            state.text = title.to_string();
        }
        self.events.push(HostEvent::ContainerMutated {
            added: Vec::new(),
            removed: Vec::new(),
        });
    }

    /// Replace every host anchor with a fresh element, as a full re-render does
    pub fn rerender_list(&mut self) {
        let old: Vec<(ElementId, String)> = std::mem::take(&mut self.host_list);
        let mut removed = Vec::with_capacity(old.len());
        let mut added = Vec::with_capacity(old.len());
        for (element, href) in old {
            let text = self.text_of(element).unwrap_or_default().to_string();
            self.detach(element);
            removed.push(element);
            let fresh = self.new_element(&text);
            self.host_list.push((fresh, href.clone()));
            added.push(self.anchor_for(fresh, &href));
        }
        self.events.push(HostEvent::ContainerMutated { added, removed });
    }

    /// User (or host) moves to `path`
    pub fn visit(&mut self, path: &str) {
        self.current_path = path.to_string();
        self.events.push(HostEvent::Navigated {
            path: path.to_string(),
        });
    }

    /// User clicks an element
    pub fn click(&mut self, element: ElementId) {
        self.events.push(HostEvent::Clicked { element });
    }

    /// User sends a message in the current session
    pub fn send_message(&mut self) {
        self.events.push(HostEvent::MessageSent {
            path: self.current_path.clone(),
        });
    }

    /// User activates the native new chat control directly
    pub fn click_native_new_chat(&mut self) {
        self.native_new_chat_clicks += 1;
        self.current_path = "/".to_string();
        self.events.push(HostEvent::NativeNewChat);
        self.events.push(HostEvent::Navigated {
            path: "/".to_string(),
        });
    }

    pub fn paint_frame(&mut self) {
        self.events.push(HostEvent::Frame);
    }

    pub fn set_container_present(&mut self, present: bool) {
        self.container_present = present;
        if !present {
            let elements: Vec<ElementId> = self.host_list.iter().map(|(e, _)| *e).collect();
            for element in &elements {
                self.detach(*element);
            }
            self.host_list.clear();
        }
    }

    pub fn set_overlay(&mut self, present: bool) {
        self.overlay = present;
    }

    pub fn set_native_new_chat_available(&mut self, available: bool) {
        self.native_new_chat_available = available;
    }

    /// Make subsequent anchor queries fail with `error`
    pub fn fail_queries(&mut self, error: Option<HostError>) {
        self.query_error = error;
    }

    /// Stop every observation from delivering events
    pub fn break_observers(&mut self) {
        for alive in self.observers.values_mut() {
            *alive = false;
        }
    }

    /// Detach an element behind the engine's back
    pub fn detach_element(&mut self, element: ElementId) {
        self.detach(element);
    }

    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.events)
    }

    // ---- inspection ----

    pub fn element_for(&self, href: &str) -> Option<ElementId> {
        self.position_of(href).map(|i| self.host_list[i].0)
    }

    pub fn text_of(&self, element: ElementId) -> Option<&str> {
        self.elements.get(&element).map(|e| e.text.as_str())
    }

    pub fn is_highlighted(&self, element: ElementId) -> bool {
        self.elements.get(&element).is_some_and(|e| e.highlighted)
    }

    pub fn is_draggable(&self, element: ElementId) -> bool {
        self.elements.get(&element).is_some_and(|e| e.draggable)
    }

    /// Every connected, highlighted element
    pub fn highlighted(&self) -> Vec<ElementId> {
        let mut out: Vec<ElementId> = self
            .elements
            .iter()
            .filter(|(_, e)| e.connected && e.highlighted)
            .map(|(id, _)| *id)
            .collect();
        out.sort();
        out
    }

    /// Connected entry elements rendered for `group_id`
    pub fn entries_of(&self, group_id: &GroupId) -> Vec<ElementId> {
        self.group_entries
            .get(group_id)
            .map(|entries| {
                entries
                    .iter()
                    .copied()
                    .filter(|e| self.is_connected(*e))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entry_texts(&self, group_id: &GroupId) -> Vec<String> {
        self.entries_of(group_id)
            .into_iter()
            .filter_map(|e| self.text_of(e).map(str::to_string))
            .collect()
    }

    pub fn indicator(&self) -> Option<&GroupId> {
        self.indicator.as_ref()
    }

    pub fn rendered_groups(&self) -> &[GroupId] {
        &self.rendered_groups
    }

    pub fn navigations(&self) -> &[(String, NavigationMethod)] {
        &self.navigations
    }

    pub fn native_new_chat_clicks(&self) -> usize {
        self.native_new_chat_clicks
    }

    pub fn live_observers(&self) -> usize {
        self.observers.values().filter(|alive| **alive).count()
    }
}

impl HostAdapter for MemoryHost {
    fn list_session_anchors(&self) -> Result<Vec<Anchor>, HostError> {
        if let Some(err) = &self.query_error {
            return Err(err.clone());
        }
        if !self.container_present {
            return Err(HostError::ContainerMissing);
        }
        Ok(self
            .host_list
            .iter()
            .map(|(element, href)| self.anchor_for(*element, href))
            .collect())
    }

    fn current_path(&self) -> String {
        self.current_path.clone()
    }

    fn is_connected(&self, element: ElementId) -> bool {
        self.elements.get(&element).is_some_and(|e| e.connected)
    }

    fn container_present(&self) -> bool {
        self.container_present
    }

    fn overlay_present(&self) -> bool {
        self.overlay
    }

    fn observe_container(&mut self) -> Result<ObserverHandle, HostError> {
        if !self.container_present {
            return Err(HostError::ContainerMissing);
        }
        self.next_observer += 1;
        let handle = ObserverHandle(self.next_observer);
        self.observers.insert(handle, true);
        Ok(handle)
    }

    fn observer_alive(&self, handle: ObserverHandle) -> bool {
        self.observers.get(&handle).copied().unwrap_or(false)
    }

    fn disconnect(&mut self, handle: ObserverHandle) {
        self.observers.remove(&handle);
    }

    fn navigate_to(&mut self, path: &str) -> NavigationMethod {
        let method = if self.position_of(path).is_some() {
            NavigationMethod::HostLink
        } else {
            NavigationMethod::PushState
        };
        self.navigations.push((path.to_string(), method));
        self.visit(path);
        method
    }

    fn trigger_native_new_chat(&mut self) -> bool {
        if !self.native_new_chat_available {
            return false;
        }
        self.click_native_new_chat();
        true
    }

    fn set_draggable(&mut self, element: ElementId) {
        if let Some(state) = self.elements.get_mut(&element) {
            state.draggable = true;
        }
    }
}

impl GroupView for MemoryHost {
    fn mount(&mut self) {
        self.wrapper = true;
    }

    fn unmount(&mut self) {
        self.wrapper = false;
        let entries: Vec<ElementId> = self.group_entries.values().flatten().copied().collect();
        for element in entries {
            self.detach(element);
        }
        self.group_entries.clear();
        self.rendered_groups.clear();
        self.indicator = None;
    }

    fn wrapper_present(&self) -> bool {
        self.wrapper
    }

    fn render_group(&mut self, group: &Group) {
        if !self.rendered_groups.contains(&group.id) {
            self.rendered_groups.push(group.id.clone());
        }
        let old = self.group_entries.remove(&group.id).unwrap_or_default();
        for element in old {
            self.detach(element);
        }
        self.group_entries.insert(group.id.clone(), Vec::new());
    }

    fn append_entry(&mut self, group_id: &GroupId, chat: &ChatRef) -> ElementId {
        let element = self.new_element(&chat.title);
        self.group_entries
            .entry(group_id.clone())
            .or_default()
            .push(element);
        element
    }

    fn remove_group(&mut self, group_id: &GroupId) {
        self.rendered_groups.retain(|g| g != group_id);
        let old = self.group_entries.remove(group_id).unwrap_or_default();
        for element in old {
            self.detach(element);
        }
        if self.indicator.as_ref() == Some(group_id) {
            self.indicator = None;
        }
    }

    fn reorder_groups(&mut self, order: &[GroupId]) {
        let rendered = std::mem::take(&mut self.rendered_groups);
        self.rendered_groups = order
            .iter()
            .filter(|id| rendered.contains(id))
            .cloned()
            .collect();
    }

    fn set_text(&mut self, element: ElementId, text: &str) {
        if let Some(state) = self.elements.get_mut(&element) {
            if state.connected {
                state.text = text.to_string();
            }
        }
    }

    fn set_highlight(&mut self, element: ElementId, on: bool) {
        if let Some(state) = self.elements.get_mut(&element) {
            if state.connected {
                state.highlighted = on;
            }
        }
    }

    fn set_group_indicator(&mut self, group_id: Option<&GroupId>) {
        self.indicator = group_id.cloned();
    }
}
