//! Coalescing, rate-limited writes to the persistent store.
//!
//! Callers hand over partial objects and never wait on the result. The
//! scheduler merges them into one pending payload and flushes when
//! [`WriteScheduler::poll`] is called past the flush deadline. Backend failures
//! are handled here and never propagated:
//!
//! - rate limited: retry the same payload after exponential backoff (>= 60s)
//! - quota exceeded: retry with a degraded payload, see [`super::degrade`]
//! - context invalid: drop the payload
//! - anything else: retry a bounded number of times, then drop

use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::degrade::{degrade_payload, QuotaPolicy};
use super::PersistentStore;
use crate::error::StoreError;

/// Highest degradation level before the scheduler stops cutting further
const MAX_DEGRADE_LEVEL: u32 = 8;

/// Timing and failure policy for the write scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePolicy {
    /// Flush delay when the last flush is at least `min_interval` ago
    pub short_delay: Duration,
    /// Flush delay when the last flush was recent
    pub long_delay: Duration,
    /// Minimum spacing between flushes before the long delay applies
    pub min_interval: Duration,
    /// Lower bound for rate-limit backoff
    pub backoff_floor: Duration,
    /// Upper bound for rate-limit backoff
    pub max_backoff: Duration,
    /// Attempts for unclassified failures before the payload is dropped
    pub max_other_retries: u32,
    pub quota: QuotaPolicy,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            short_delay: Duration::from_millis(300),
            long_delay: Duration::from_millis(2000),
            min_interval: Duration::from_millis(2000),
            backoff_floor: Duration::from_secs(60),
            max_backoff: Duration::from_secs(15 * 60),
            max_other_retries: 3,
            quota: QuotaPolicy::default(),
        }
    }
}

/// What a flush attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Payload written; `degrade_level` > 0 means a reduced payload went out
    Written { degrade_level: u32 },
    /// Backend throttled; retrying after `retry_in`
    RateLimited { retry_in: Duration },
    /// Payload too large; retrying at the given degradation level
    Degraded { level: u32 },
    /// Payload discarded
    Dropped,
    /// Unclassified failure; retrying later
    Retrying { attempt: u32 },
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub flushes: u64,
    pub rate_limited: u64,
    pub degraded: u64,
    pub dropped: u64,
}

pub struct WriteScheduler {
    policy: WritePolicy,
    pending: Map<String, Value>,
    deadline: Option<Instant>,
    last_flush: Option<Instant>,
    /// Active rate-limit backoff, if any
    backoff: Option<Duration>,
    degrade_level: u32,
    other_failures: u32,
    stats: WriteStats,
}

impl WriteScheduler {
    pub fn new(policy: WritePolicy) -> Self {
        Self {
            policy,
            pending: Map::new(),
            deadline: None,
            last_flush: None,
            backoff: None,
            degrade_level: 0,
            other_failures: 0,
            stats: WriteStats::default(),
        }
    }

    pub fn policy(&self) -> &WritePolicy {
        &self.policy
    }

    /// Merge `patch` into the pending payload and arm the flush deadline.
    ///
    /// An armed deadline is never moved, so a burst of writes coalesces into
    /// the flush scheduled by its first write.
    pub fn schedule(&mut self, patch: Map<String, Value>, now: Instant) {
        if patch.is_empty() {
            return;
        }
        for (key, value) in patch {
            self.pending.insert(key, value);
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.coalesce_delay(now));
        }
    }

    /// Flush delay for a payload that becomes pending at `now`
    fn coalesce_delay(&self, now: Instant) -> Duration {
        match self.last_flush {
            Some(last) if now.saturating_duration_since(last) < self.policy.min_interval => {
                self.policy.long_delay
            }
            _ => self.policy.short_delay,
        }
    }

    /// Flush if the deadline has passed.
    ///
    /// Returns `None` when nothing was attempted.
    pub fn poll(&mut self, now: Instant, store: &mut dyn PersistentStore) -> Option<FlushOutcome> {
        if self.pending.is_empty() {
            return None;
        }
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            Some(_) => return None,
            None => {
                self.deadline = Some(now + self.coalesce_delay(now));
                return None;
            }
        }
        Some(self.attempt(now, store))
    }

    /// Flush immediately, ignoring the deadline and any backoff.
    pub fn flush_now(&mut self, now: Instant, store: &mut dyn PersistentStore) -> Option<FlushOutcome> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.attempt(now, store))
    }

    fn attempt(&mut self, now: Instant, store: &mut dyn PersistentStore) -> FlushOutcome {
        let mut payload = self.pending.clone();
        if self.degrade_level > 0 {
            degrade_payload(&mut payload, &self.policy.quota, self.degrade_level);
        }

        match store.set(payload) {
            Ok(()) => {
                let degrade_level = self.degrade_level;
                self.pending.clear();
                self.deadline = None;
                self.last_flush = Some(now);
                self.backoff = None;
                self.degrade_level = 0;
                self.other_failures = 0;
                self.stats.flushes += 1;
                debug!(degrade_level, "store write flushed");
                FlushOutcome::Written { degrade_level }
            }
            Err(StoreError::RateLimited(message)) => {
                let retry_in = match self.backoff {
                    Some(previous) => (previous * 2).max(self.policy.backoff_floor),
                    None => self.policy.backoff_floor,
                }
                .min(self.policy.max_backoff);
                self.backoff = Some(retry_in);
                self.deadline = Some(now + retry_in);
                self.stats.rate_limited += 1;
                warn!(%message, retry_in_secs = retry_in.as_secs(), "store write rate limited");
                FlushOutcome::RateLimited { retry_in }
            }
            Err(StoreError::QuotaExceeded(message)) => {
                self.degrade_level = (self.degrade_level + 1).min(MAX_DEGRADE_LEVEL);
                self.deadline = Some(now + self.policy.short_delay);
                self.stats.degraded += 1;
                warn!(%message, level = self.degrade_level, "store quota exceeded, degrading payload");
                FlushOutcome::Degraded {
                    level: self.degrade_level,
                }
            }
            Err(StoreError::ContextInvalid(message)) => {
                debug!(%message, "store context gone, dropping pending writes");
                self.drop_pending();
                FlushOutcome::Dropped
            }
            Err(StoreError::Other(message)) => {
                self.other_failures += 1;
                if self.other_failures >= self.policy.max_other_retries {
                    warn!(%message, attempts = self.other_failures, "store write failed, giving up");
                    self.drop_pending();
                    FlushOutcome::Dropped
                } else {
                    warn!(%message, attempt = self.other_failures, "store write failed, retrying");
                    self.deadline = Some(now + self.policy.long_delay);
                    FlushOutcome::Retrying {
                        attempt: self.other_failures,
                    }
                }
            }
        }
    }

    fn drop_pending(&mut self) {
        self.pending.clear();
        self.deadline = None;
        self.backoff = None;
        self.degrade_level = 0;
        self.other_failures = 0;
        self.stats.dropped += 1;
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn in_backoff(&self) -> bool {
        self.backoff.is_some()
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }
}
