//! User-defined groups of chat sessions.
//!
//! A group is a named, ordered collection of references to sessions that the
//! host application renders in its own history list. Groups are the only
//! state this crate owns; everything else is observed from the host.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod path;
pub mod registry;

pub use path::{display_title, is_session_path, normalize_path, same_session, DEFAULT_TITLE};
pub use registry::{GroupRegistry, LoadReport};

/// Stable identifier of a group. Never changes once created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id from the current wall-clock time
    pub fn generate() -> Self {
        Self(format!("f_{}", chrono::Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to one host session stored inside a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRef {
    /// Session url or path. Empty for a provisional entry.
    #[serde(default)]
    pub url: String,
    /// Last known title as displayed by the host
    #[serde(default)]
    pub title: String,
    /// Pinned entries stay at the top of the group
    #[serde(default)]
    pub pinned: bool,
}

impl ChatRef {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            pinned: false,
        }
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Normalized session path, or `None` for provisional entries
    pub fn path(&self) -> Option<String> {
        normalize_path(&self.url)
    }

    pub fn is_provisional(&self) -> bool {
        self.path().is_none()
    }
}

/// A named collection of chat references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Key of the group in the persisted map; not part of the stored body
    #[serde(skip)]
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub chats: Vec<ChatRef>,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub prompt: String,
    /// Vertical spacing between entries, in pixels
    #[serde(default)]
    pub gap: i32,
    #[serde(default)]
    pub show_all: bool,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            chats: Vec::new(),
            collapsed: false,
            prompt: String::new(),
            gap: 0,
            show_all: false,
        }
    }

    /// Index of the chat whose normalized path equals `path`
    pub fn position_of(&self, path: &str) -> Option<usize> {
        self.chats
            .iter()
            .position(|c| c.path().as_deref() == Some(path))
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.position_of(path).is_some()
    }

    pub fn pinned_count(&self) -> usize {
        self.chats.iter().take_while(|c| c.pinned).count()
    }
}

/// Group body as stored by older versions, which may lack `prompt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredGroup {
    name: String,
    #[serde(default)]
    chats: Vec<ChatRef>,
    #[serde(default)]
    collapsed: bool,
    prompt: Option<String>,
    #[serde(default)]
    gap: i32,
    #[serde(default)]
    show_all: bool,
}

impl StoredGroup {
    /// Convert into a [`Group`], reporting whether a legacy field was filled in
    pub(crate) fn into_group(self, id: GroupId) -> (Group, bool) {
        let migrated = self.prompt.is_none();
        let group = Group {
            id,
            name: self.name,
            chats: self.chats,
            collapsed: self.collapsed,
            prompt: self.prompt.unwrap_or_default(),
            gap: self.gap,
            show_all: self.show_all,
        };
        (group, migrated)
    }
}

/// Where a path was last opened from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LastActive {
    /// Opened from inside this group
    Group(GroupId),
    /// Opened from the host's own ungrouped list
    History,
}

/// Persisted spelling of [`LastActive::History`]
pub const HISTORY_SENTINEL: &str = "history";

impl From<String> for LastActive {
    fn from(value: String) -> Self {
        if value == HISTORY_SENTINEL {
            LastActive::History
        } else {
            LastActive::Group(GroupId(value))
        }
    }
}

impl From<LastActive> for String {
    fn from(value: LastActive) -> Self {
        match value {
            LastActive::Group(id) => id.0,
            LastActive::History => HISTORY_SENTINEL.to_string(),
        }
    }
}

/// Group created on first run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetGroup {
    pub name: String,
    #[serde(default)]
    pub prompt: String,
}

impl PresetGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: String::new(),
        }
    }
}
