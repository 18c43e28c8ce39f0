//! Deadline queue used by the poll backend.

use crate::{TimerCallback, TimerId, MIN_REPEAT_INTERVAL};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

pub(crate) struct TimerEntry {
    pub interval: Duration,
    pub repeating: bool,
    /// `None` while the callback is running.
    pub callback: Option<TimerCallback>,
}

/// Min-heap of deadlines plus the live timer table.
///
/// Cancellation only removes the table entry; the stale heap slot is skipped
/// when it surfaces.
#[derive(Default)]
pub(crate) struct TimerQueue {
    deadlines: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn insert(&mut self, now: Instant, delay: Duration, repeating: bool, callback: TimerCallback) -> TimerId {
        self.next_id += 1;
        let id = TimerId::new(self.next_id);
        let interval = if repeating { delay.max(MIN_REPEAT_INTERVAL) } else { delay };
        self.entries.insert(
            id,
            TimerEntry {
                interval,
                repeating,
                callback: Some(callback),
            },
        );
        self.deadlines.push(Reverse((now + delay, id)));
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time until the earliest live deadline, `None` if no timer is pending.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(deadline.saturating_duration_since(now));
            }
            self.deadlines.pop();
        }
        None
    }

    /// Pops every timer whose deadline is at or before `now`.
    pub fn due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if self.entries.contains_key(&id) {
                due.push(id);
            }
        }
        due
    }

    /// Takes the callback of a due timer out of the table. One-shot timers are
    /// removed entirely.
    pub fn begin_fire(&mut self, id: TimerId) -> Option<(TimerCallback, bool)> {
        let entry = self.entries.get_mut(&id)?;
        let callback = entry.callback.take()?;
        let repeating = entry.repeating;
        if !repeating {
            self.entries.remove(&id);
        }
        Some((callback, repeating))
    }

    /// Puts a repeating timer's callback back and schedules its next run,
    /// unless it was cancelled while running.
    pub fn finish_fire(&mut self, id: TimerId, callback: TimerCallback, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.callback = Some(callback);
            self.deadlines.push(Reverse((now + entry.interval, id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_due_order_and_lazy_cancel() {
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let late = queue.insert(now, Duration::from_millis(20), false, noop());
        let early = queue.insert(now, Duration::from_millis(10), false, noop());
        let cancelled = queue.insert(now, Duration::from_millis(5), false, noop());
        assert!(queue.cancel(cancelled));

        assert_eq!(queue.next_timeout(now), Some(Duration::from_millis(10)));
        assert_eq!(queue.due(now + Duration::from_millis(30)), vec![early, late]);
    }

    #[test]
    fn test_repeating_timer_is_rescheduled_after_fire() {
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let id = queue.insert(now, Duration::ZERO, true, noop());
        assert_eq!(queue.due(now), vec![id]);

        let (callback, repeating) = queue.begin_fire(id).unwrap();
        assert!(repeating);
        assert!(queue.begin_fire(id).is_none());
        queue.finish_fire(id, callback, now);
        assert_eq!(queue.next_timeout(now), Some(MIN_REPEAT_INTERVAL));
    }

    #[test]
    fn test_one_shot_is_removed_on_fire() {
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let id = queue.insert(now, Duration::ZERO, false, noop());
        queue.due(now);
        assert!(queue.begin_fire(id).is_some());
        assert!(queue.is_empty());
        assert!(!queue.cancel(id));
    }
}
