//! Frame-budgeted rendering of group entries.
//!
//! Large groups are not drawn in one go. Their entries are queued and each
//! engine turn renders a slice whose length is bounded by a time budget
//! derived from how fast the host is painting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::groups::{ChatRef, GroupId};

/// Frame intervals kept for the rolling mean
const FRAME_WINDOW: usize = 30;
/// Assumed interval before any frame has been observed
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);
const MIN_SLICE: Duration = Duration::from_millis(2);
const MAX_SLICE: Duration = Duration::from_millis(12);
/// Gaps longer than this are idle periods, not frames
const MAX_FRAME_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
pub struct FrameBudget {
    last_frame: Option<Instant>,
    intervals: VecDeque<Duration>,
}

impl FrameBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that the host painted at `now`
    pub fn record_frame(&mut self, now: Instant) {
        if let Some(last) = self.last_frame {
            let interval = now.saturating_duration_since(last);
            if !interval.is_zero() && interval <= MAX_FRAME_INTERVAL {
                if self.intervals.len() == FRAME_WINDOW {
                    self.intervals.pop_front();
                }
                self.intervals.push_back(interval);
            }
        }
        self.last_frame = Some(now);
    }

    pub fn mean_interval(&self) -> Duration {
        if self.intervals.is_empty() {
            return DEFAULT_FRAME_INTERVAL;
        }
        let total: Duration = self.intervals.iter().sum();
        total / self.intervals.len() as u32
    }

    /// Time one render slice may take: half a frame, clamped
    pub fn slice_budget(&self) -> Duration {
        (self.mean_interval() / 2).clamp(MIN_SLICE, MAX_SLICE)
    }
}

#[derive(Debug)]
struct RenderJob {
    group_id: GroupId,
    chats: VecDeque<ChatRef>,
}

/// Pending entry renders, one job per group
#[derive(Debug)]
pub struct RenderQueue {
    jobs: VecDeque<RenderJob>,
    min_slice_items: usize,
}

impl RenderQueue {
    pub fn new(min_slice_items: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            min_slice_items: min_slice_items.max(1),
        }
    }

    /// Queue the entries of `group_id`, replacing any unfinished job for it
    pub fn enqueue(&mut self, group_id: GroupId, chats: Vec<ChatRef>) {
        self.cancel(&group_id);
        self.jobs.push_back(RenderJob {
            group_id,
            chats: chats.into(),
        });
    }

    pub fn cancel(&mut self, group_id: &GroupId) {
        self.jobs.retain(|job| &job.group_id != group_id);
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Entries still waiting to be rendered
    pub fn pending(&self) -> usize {
        self.jobs.iter().map(|job| job.chats.len()).sum()
    }

    pub fn is_queued(&self, group_id: &GroupId) -> bool {
        self.jobs.iter().any(|job| &job.group_id == group_id)
    }

    /// Render entries until `budget` is spent, but always at least
    /// `min_slice_items`. Returns how many were rendered.
    pub fn run_slice(
        &mut self,
        budget: Duration,
        mut clock: impl FnMut() -> Instant,
        mut render: impl FnMut(&GroupId, &ChatRef),
    ) -> usize {
        let started = clock();
        let mut done = 0;
        while let Some(job) = self.jobs.front_mut() {
            if done >= self.min_slice_items && clock().saturating_duration_since(started) >= budget {
                break;
            }
            match job.chats.pop_front() {
                Some(chat) => {
                    render(&job.group_id, &chat);
                    done += 1;
                }
                None => {
                    self.jobs.pop_front();
                }
            }
        }
        // Drop a job that just ran dry so is_empty() is accurate
        if self.jobs.front().is_some_and(|job| job.chats.is_empty()) {
            self.jobs.pop_front();
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn chats(n: usize) -> Vec<ChatRef> {
        (0..n)
            .map(|i| ChatRef::new(format!("/c/{i}"), format!("chat {i}")))
            .collect()
    }

    #[test]
    fn budget_defaults_to_half_a_sixty_hz_frame() {
        let budget = FrameBudget::new();
        assert_eq!(budget.slice_budget(), Duration::from_millis(8));
    }

    #[test]
    fn budget_follows_the_measured_frame_rate() {
        let start = Instant::now();
        let mut budget = FrameBudget::new();
        for i in 0..5 {
            budget.record_frame(start + Duration::from_millis(8 * i));
        }
        assert_eq!(budget.mean_interval(), Duration::from_millis(8));
        assert_eq!(budget.slice_budget(), Duration::from_millis(4));

        // Slow host
        let mut slow = FrameBudget::new();
        for i in 0..5 {
            slow.record_frame(start + Duration::from_millis(100 * i));
        }
        assert_eq!(slow.slice_budget(), MAX_SLICE);
    }

    #[test]
    fn idle_gaps_are_not_counted_as_frames() {
        let start = Instant::now();
        let mut budget = FrameBudget::new();
        budget.record_frame(start);
        budget.record_frame(start + Duration::from_secs(5));
        assert_eq!(budget.mean_interval(), DEFAULT_FRAME_INTERVAL);
    }

    #[test]
    fn slices_stop_when_the_budget_is_spent() {
        let base = Instant::now();
        let tick = Cell::new(0u64);
        let clock = || {
            tick.set(tick.get() + 1);
            base + Duration::from_millis(tick.get())
        };

        let mut queue = RenderQueue::new(2);
        queue.enqueue(GroupId::new("f_big"), chats(100));

        let mut rendered = Vec::new();
        let done = queue.run_slice(Duration::from_millis(4), clock, |_, chat| {
            rendered.push(chat.url.clone())
        });
        assert!(done >= 2);
        assert!(done < 100);
        assert_eq!(rendered[0], "/c/0");
        assert_eq!(queue.pending(), 100 - done);
    }

    #[test]
    fn minimum_items_are_rendered_even_with_no_budget() {
        let base = Instant::now();
        let mut queue = RenderQueue::new(3);
        queue.enqueue(GroupId::new("f_a"), chats(10));
        let done = queue.run_slice(Duration::ZERO, || base, |_, _| {});
        assert_eq!(done, 3);
    }

    #[test]
    fn requeueing_a_group_replaces_its_job() {
        let base = Instant::now();
        let mut queue = RenderQueue::new(1);
        let id = GroupId::new("f_a");
        queue.enqueue(id.clone(), chats(10));
        queue.enqueue(GroupId::new("f_b"), chats(1));
        queue.enqueue(id.clone(), chats(2));
        assert_eq!(queue.pending(), 3);

        let mut order = Vec::new();
        queue.run_slice(Duration::from_secs(1), || base, |g, _| order.push(g.clone()));
        assert_eq!(order, vec![GroupId::new("f_b"), id.clone(), id]);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_drops_a_pending_job() {
        let mut queue = RenderQueue::new(1);
        queue.enqueue(GroupId::new("f_a"), chats(4));
        queue.cancel(&GroupId::new("f_a"));
        assert!(queue.is_empty());
    }
}
