//! Reduced-fidelity payloads for quota-exceeded writes.
//!
//! When the backend rejects a payload for size, the scheduler rewrites the
//! `groups` entry with capped chat lists and truncated strings. Each further
//! quota failure raises the level, halving every cap. Groups themselves are
//! never dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::KEY_GROUPS;

/// Hard floors no degradation level goes below
const MIN_CHATS: usize = 1;
const MIN_CHARS: usize = 8;

/// Caps applied at degradation level 1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    #[serde(default = "default_max_chats")]
    pub max_chats_per_group: usize,
    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

fn default_max_chats() -> usize {
    50
}

fn default_max_title_chars() -> usize {
    80
}

fn default_max_prompt_chars() -> usize {
    500
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            max_chats_per_group: default_max_chats(),
            max_title_chars: default_max_title_chars(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

impl QuotaPolicy {
    /// Caps in effect at `level` (level 0 means no degradation)
    pub fn caps_at(&self, level: u32) -> Option<(usize, usize, usize)> {
        if level == 0 {
            return None;
        }
        let shift = (level - 1).min(16);
        Some((
            (self.max_chats_per_group >> shift).max(MIN_CHATS),
            (self.max_title_chars >> shift).max(MIN_CHARS),
            (self.max_prompt_chars >> shift).max(MIN_CHARS),
        ))
    }
}

/// Rewrite the `groups` entry of `payload` in place. Returns true if anything
/// was cut.
pub fn degrade_payload(payload: &mut Map<String, Value>, policy: &QuotaPolicy, level: u32) -> bool {
    let Some((max_chats, max_title, max_prompt)) = policy.caps_at(level) else {
        return false;
    };
    let Some(Value::Object(groups)) = payload.get_mut(KEY_GROUPS) else {
        return false;
    };

    let mut cut = false;
    for body in groups.values_mut() {
        let Value::Object(body) = body else {
            continue;
        };

        if let Some(Value::String(prompt)) = body.get_mut("prompt") {
            cut |= truncate_chars(prompt, max_prompt);
        }

        if let Some(Value::Array(chats)) = body.get_mut("chats") {
            if chats.len() > max_chats {
                chats.truncate(max_chats);
                cut = true;
            }
            for chat in chats.iter_mut() {
                if let Some(Value::String(title)) = chat.get_mut("title") {
                    cut |= truncate_chars(title, max_title);
                }
            }
        }
    }
    cut
}

fn truncate_chars(s: &mut String, max: usize) -> bool {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => {
            s.truncate(byte_idx);
            true
        }
        None => false,
    }
}
