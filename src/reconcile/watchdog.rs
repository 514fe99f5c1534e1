//! Self-healing watchdog.
//!
//! Two signals trip it: the check itself running late (the host stalled the
//! event loop) and the rendered state drifting away from what the model
//! predicts. The engine answers a trip with local cleanup and escalates to a
//! full UI reinit only if the divergence survives it.

use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogPolicy {
    pub interval: Duration,
    /// Lateness of a check that counts as a stall
    pub drift_threshold: Duration,
    /// Bindings per expected entry above which local cleanup runs
    pub divergence_ratio: f64,
    /// Ratio that still holds after cleanup and forces a reinit
    pub hard_divergence_ratio: f64,
    /// Added to the expected count so small lists never look divergent
    pub divergence_slack: usize,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            drift_threshold: Duration::from_secs(2),
            divergence_ratio: 2.0,
            hard_divergence_ratio: 4.0,
            divergence_slack: 50,
        }
    }
}

/// Structural state sampled at a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    /// Live bindings in the index
    pub bindings: usize,
    /// Entries the model and host list account for
    pub expected: usize,
    pub wrapper_present: bool,
    pub container_present: bool,
}

impl HealthSample {
    /// Group wrapper and host container disagree about being mounted
    pub fn mount_mismatch(&self) -> bool {
        self.wrapper_present != self.container_present
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Evict and prune, keep the UI
    LocalCleanup,
    /// Tear down observation and UI and start over
    Reinitialize,
}

pub struct Watchdog {
    policy: WatchdogPolicy,
    next_check: Option<Instant>,
    trips: u64,
    reinits: u64,
}

impl Watchdog {
    pub fn new(policy: WatchdogPolicy) -> Self {
        Self {
            policy,
            next_check: None,
            trips: 0,
            reinits: 0,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.next_check = Some(now + self.policy.interval);
    }

    pub fn stop(&mut self) {
        self.next_check = None;
    }

    /// If a check is due, rearm and return how late it ran
    pub fn take_due(&mut self, now: Instant) -> Option<Duration> {
        let at = self.next_check?;
        if now < at {
            return None;
        }
        self.next_check = Some(now + self.policy.interval);
        Some(now - at)
    }

    fn ratio(&self, sample: &HealthSample) -> f64 {
        sample.bindings as f64 / (sample.expected + self.policy.divergence_slack) as f64
    }

    /// First look at a due check
    pub fn assess(&mut self, drift: Duration, sample: &HealthSample) -> Verdict {
        let stalled = drift > self.policy.drift_threshold;
        let ratio = self.ratio(sample);
        let diverged = ratio > self.policy.divergence_ratio || sample.mount_mismatch();
        if !stalled && !diverged {
            return Verdict::Healthy;
        }
        self.trips += 1;
        warn!(
            drift_ms = drift.as_millis() as u64,
            ratio,
            wrapper = sample.wrapper_present,
            container = sample.container_present,
            "watchdog tripped"
        );
        Verdict::LocalCleanup
    }

    /// Second look after local cleanup ran
    pub fn reassess(&mut self, sample: &HealthSample) -> Verdict {
        let ratio = self.ratio(sample);
        if ratio > self.policy.hard_divergence_ratio || sample.mount_mismatch() {
            self.reinits += 1;
            warn!(ratio, "divergence survived cleanup, reinitializing");
            Verdict::Reinitialize
        } else {
            Verdict::Healthy
        }
    }

    pub fn trips(&self) -> u64 {
        self.trips
    }

    pub fn reinits(&self) -> u64 {
        self.reinits
    }
}
