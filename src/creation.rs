//! "New chat inside a group" handshake.
//!
//! The host offers no callback for session creation. A flow snapshots the
//! rendered paths, asks the host for a new chat and then waits on two
//! listeners, one for navigation and one for container mutations, plus a
//! deadline. The first listener to see a session path outside the snapshot
//! wins and shuts the other down. Every flow carries a [`CancellationToken`];
//! the engine only acts on a win whose token is still the tracker's pending
//! one.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::groups::{is_session_path, ChatRef, Group, GroupId, DEFAULT_TITLE};
use crate::host::SessionAnchor;

/// Identifies one in-flight creation. Issuing a new one supersedes the old.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CancellationToken(Uuid);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which listener fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Navigation,
    Mutation,
}

/// What the winning listener saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub token: CancellationToken,
    pub group_id: GroupId,
    pub trigger: Trigger,
    /// Anchors outside the snapshot, in render order
    pub fresh: Vec<SessionAnchor>,
    pub current_path: String,
    /// Current path is a session outside the snapshot
    pub current_is_new: bool,
}

#[derive(Debug)]
pub struct CreationFlow {
    group_id: GroupId,
    token: CancellationToken,
    baseline: HashSet<String>,
    navigation_listener: bool,
    mutation_listener: bool,
    deadline: Instant,
}

impl CreationFlow {
    /// Start listening. `baseline` is every session path known before the
    /// host was asked for a new chat.
    pub fn start(
        group_id: GroupId,
        token: CancellationToken,
        baseline: impl IntoIterator<Item = String>,
        now: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            group_id,
            token,
            baseline: baseline.into_iter().collect(),
            navigation_listener: true,
            mutation_listener: true,
            deadline: now + timeout,
        }
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_listening(&self) -> bool {
        self.navigation_listener || self.mutation_listener
    }

    fn listens_for(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Navigation => self.navigation_listener,
            Trigger::Mutation => self.mutation_listener,
        }
    }

    /// Deregister both listeners
    pub fn stop(&mut self) {
        self.navigation_listener = false;
        self.mutation_listener = false;
    }

    /// Feed one listener. Returns the observation if it won the race.
    pub fn observe(
        &mut self,
        trigger: Trigger,
        current_path: &str,
        anchors: &[SessionAnchor],
    ) -> Option<Observation> {
        if !self.listens_for(trigger) {
            return None;
        }

        let mut seen = HashSet::new();
        let fresh: Vec<SessionAnchor> = anchors
            .iter()
            .filter(|a| !self.baseline.contains(&a.path) && seen.insert(a.path.clone()))
            .cloned()
            .collect();
        let current_is_new =
            is_session_path(current_path) && !self.baseline.contains(current_path);

        if fresh.is_empty() && !current_is_new {
            return None;
        }

        self.stop();
        debug!(
            group_id = %self.group_id,
            token = %self.token,
            ?trigger,
            fresh = fresh.len(),
            "creation listener won"
        );
        Some(Observation {
            token: self.token.clone(),
            group_id: self.group_id.clone(),
            trigger,
            fresh,
            current_path: current_path.to_string(),
            current_is_new,
        })
    }

    /// Deregister if the deadline passed. True the one time it fires.
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.is_listening() && now >= self.deadline {
            self.stop();
            debug!(group_id = %self.group_id, token = %self.token, "creation timed out");
            return true;
        }
        false
    }
}

/// Choose the chat a winning observation refers to.
///
/// Preference: the fresh anchor at the current path, then the first fresh
/// anchor the group does not hold yet, then the first fresh path under the
/// default title.
///
/// The current-path check runs before render order, so a fresh anchor the
/// host listed above the one just opened does not win.
pub fn pick_new_chat(observation: &Observation, group: &Group) -> Option<ChatRef> {
    if let Some(anchor) = observation
        .fresh
        .iter()
        .find(|a| a.path == observation.current_path)
    {
        return Some(anchor.to_chat_ref());
    }
    if let Some(anchor) = observation
        .fresh
        .iter()
        .find(|a| !group.contains_path(&a.path))
    {
        return Some(anchor.to_chat_ref());
    }
    let path = match observation.fresh.first() {
        Some(anchor) => anchor.path.clone(),
        None if observation.current_is_new => observation.current_path.clone(),
        None => return None,
    };
    Some(ChatRef::new(path, DEFAULT_TITLE))
}
