//! Dispatch ordering
//!
//! Targets whose last attempt is oldest go first; targets never attempted
//! go before all others.

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use std::cmp::Reverse;

type DispatchPriority = Reverse<(Option<DateTime<Utc>>, String)>;

/// Bounded queue of targets waiting for a run
pub struct DispatchQueue {
    queue: PriorityQueue<String, DispatchPriority>,
    max_concurrent: usize,
    active: usize,
}

impl DispatchQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            queue: PriorityQueue::new(),
            max_concurrent: max_concurrent.max(1),
            active: 0,
        }
    }

    /// Queue a target; scheduling it again only updates its position
    pub fn schedule(&mut self, target_id: impl Into<String>, last_attempt: Option<DateTime<Utc>>) {
        let target_id = target_id.into();
        let priority = Reverse((last_attempt, target_id.clone()));
        if self.queue.change_priority(&target_id, priority.clone()).is_none() {
            self.queue.push(target_id, priority);
        }
    }

    /// Next target, or `None` when the queue is empty or every slot is busy
    pub fn next_target(&mut self) -> Option<String> {
        if self.active >= self.max_concurrent {
            return None;
        }
        self.queue.pop().map(|(target_id, _)| {
            self.active += 1;
            target_id
        })
    }

    pub fn complete(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_oldest_attempt_first() {
        let now = Utc::now();
        let mut queue = DispatchQueue::new(4);
        queue.schedule("recent", Some(now));
        queue.schedule("stale", Some(now - Duration::hours(6)));
        queue.schedule("new", None);
        queue.schedule("older", Some(now - Duration::hours(1)));

        let order: Vec<String> = std::iter::from_fn(|| queue.next_target()).collect();
        assert_eq!(order, vec!["new", "stale", "older", "recent"]);
    }

    #[test]
    fn test_respects_concurrency() {
        let mut queue = DispatchQueue::new(2);
        for id in ["a", "b", "c"] {
            queue.schedule(id, None);
        }
        assert!(queue.next_target().is_some());
        assert!(queue.next_target().is_some());
        assert!(queue.next_target().is_none());
        assert_eq!(queue.active_count(), 2);

        queue.complete();
        assert_eq!(queue.next_target().as_deref(), Some("c"));
        queue.complete();
        queue.complete();
        assert!(queue.is_idle());
    }

    #[test]
    fn test_reschedule_updates_position() {
        let now = Utc::now();
        let mut queue = DispatchQueue::new(1);
        queue.schedule("a", Some(now));
        queue.schedule("b", Some(now - Duration::minutes(5)));
        queue.schedule("a", None);
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.next_target().as_deref(), Some("a"));
    }
}
