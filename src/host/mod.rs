//! Boundary to the host page.
//!
//! The host renders its own list of sessions inside a container it mutates
//! at will. Everything this crate knows about that markup lives behind
//! [`HostAdapter`]; everything it draws lives behind [`GroupView`]. Both are
//! best-effort: no host cooperation is assumed.

use tracing::debug;

use crate::groups::{display_title, is_session_path, normalize_path, ChatRef, Group, GroupId};
use crate::error::HostError;

pub mod memory;

pub use memory::MemoryHost;

/// Opaque handle to a rendered element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

/// Handle to a container observation registered with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(pub u64);

/// A session link as rendered by the host, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// Raw link target (`href`)
    pub path: String,
    /// Displayed text
    pub title: String,
    pub element: ElementId,
}

/// A host anchor that resolved to a session path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAnchor {
    /// Normalized session path
    pub path: String,
    /// Displayed title, trimmed, never empty
    pub title: String,
    pub element: ElementId,
}

impl SessionAnchor {
    /// Normalize a raw anchor; `None` if it does not address a session
    pub fn from_anchor(anchor: &Anchor) -> Option<Self> {
        let path = normalize_path(&anchor.path)?;
        if !is_session_path(&path) {
            return None;
        }
        Some(Self {
            path,
            title: display_title(&anchor.title).to_string(),
            element: anchor.element,
        })
    }

    pub fn to_chat_ref(&self) -> ChatRef {
        ChatRef::new(self.path.clone(), self.title.clone())
    }
}

/// How a navigation request was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationMethod {
    /// The host's own link for the path was activated
    HostLink,
    /// Path state was pushed directly and a routing signal emitted
    PushState,
}

/// Something changed outside the engine.
///
/// Embedders translate whatever observation mechanism they have (mutation
/// observers, history hooks, click listeners) into these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Descendants of the session container were added or removed
    ContainerMutated {
        added: Vec<Anchor>,
        removed: Vec<ElementId>,
    },
    /// The current path changed
    Navigated { path: String },
    /// A rendered session entry (host list or group list) was clicked
    Clicked { element: ElementId },
    /// The host's native "new chat" control was activated
    NativeNewChat,
    /// A message was sent in the session at `path`
    MessageSent { path: String },
    /// The host painted a frame
    Frame,
}

/// Read/navigate access to the host page
pub trait HostAdapter {
    /// Session anchors currently rendered in the host list, in render order
    fn list_session_anchors(&self) -> Result<Vec<Anchor>, HostError>;

    /// Path of the current location
    fn current_path(&self) -> String;

    /// Whether `element` is still attached to the document
    fn is_connected(&self, element: ElementId) -> bool;

    /// Whether the host's session container is in the document
    fn container_present(&self) -> bool;

    /// Whether a blocking overlay (modal, dialog) covers the list
    fn overlay_present(&self) -> bool;

    /// Start observing the session container for added/removed descendants
    fn observe_container(&mut self) -> Result<ObserverHandle, HostError>;

    /// Whether an observation is still delivering events
    fn observer_alive(&self, handle: ObserverHandle) -> bool;

    fn disconnect(&mut self, handle: ObserverHandle);

    /// Navigate to `path`, preferring the host's own link for it
    fn navigate_to(&mut self, path: &str) -> NavigationMethod;

    /// Activate the host's native "new chat" control. Returns false if the
    /// control is not rendered.
    fn trigger_native_new_chat(&mut self) -> bool;

    /// Allow `element` to be dragged onto a group
    fn set_draggable(&mut self, element: ElementId);
}

/// Rendering collaborator for the group list
pub trait GroupView {
    /// Insert the group wrapper above the host list
    fn mount(&mut self);

    /// Remove the wrapper and everything rendered inside it
    fn unmount(&mut self);

    fn wrapper_present(&self) -> bool;

    /// Draw (or redraw) the group header and clear its entries
    fn render_group(&mut self, group: &Group);

    /// Append one chat entry to a rendered group
    fn append_entry(&mut self, group_id: &GroupId, chat: &ChatRef) -> ElementId;

    fn remove_group(&mut self, group_id: &GroupId);

    /// Reorder rendered groups to match `order`
    fn reorder_groups(&mut self, order: &[GroupId]);

    fn set_text(&mut self, element: ElementId, text: &str);

    fn set_highlight(&mut self, element: ElementId, on: bool);

    /// Mark `group_id` as the active group, clearing any other
    fn set_group_indicator(&mut self, group_id: Option<&GroupId>);
}

/// Query the host list, degrading a failed query to `None`.
pub fn query_anchors(host: &dyn HostAdapter) -> Option<Vec<SessionAnchor>> {
    match host.list_session_anchors() {
        Ok(anchors) => Some(anchors.iter().filter_map(SessionAnchor::from_anchor).collect()),
        Err(e) => {
            debug!(error = %e, "host anchor query failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_anchor_normalizes_and_filters() {
        let anchor = Anchor {
            path: "https://chat.example.com/c/abc?x=1".into(),
            title: "  ".into(),
            element: ElementId(7),
        };
        let session = SessionAnchor::from_anchor(&anchor).unwrap();
        assert_eq!(session.path, "/c/abc");
        assert_eq!(session.title, "New chat");

        let not_a_session = Anchor {
            path: "/gpts".into(),
            title: "GPTs".into(),
            element: ElementId(8),
        };
        assert!(SessionAnchor::from_anchor(&not_a_session).is_none());
    }

    #[test]
    fn failed_query_degrades_to_none() {
        let mut host = MemoryHost::new();
        host.fail_queries(Some(HostError::MalformedSelector("a[href*=".into())));
        assert!(query_anchors(&host).is_none());

        host.fail_queries(None);
        assert_eq!(query_anchors(&host), Some(Vec::new()));
    }
}
