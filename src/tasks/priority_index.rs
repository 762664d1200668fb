//! In-memory ordering index over queued tasks. Maintained alongside the
//! durable `tasks` table rather than sorting on every dequeue — the same
//! "index beside the main store" shape the Endpoint Registry uses for its
//! resource map.

use crate::models::{Priority, TaskId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

type Entry = (Priority, DateTime<Utc>, TaskId);

#[derive(Default)]
pub struct PriorityIndex {
    entries: BTreeSet<Entry>,
}

impl PriorityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, priority: Priority, created_at: DateTime<Utc>, task_id: TaskId) {
        self.entries.insert((priority, created_at, task_id));
    }

    pub fn remove(&mut self, priority: Priority, created_at: DateTime<Utc>, task_id: &str) {
        self.entries.remove(&(priority, created_at, task_id.to_string()));
    }

    /// Lowest priority number first (urgent=0 before low=3), FIFO within a
    /// priority via the `created_at` tiebreak built into `Ord` on the tuple.
    pub fn peek_next(&self) -> Option<&TaskId> {
        self.entries.iter().next().map(|(_, _, id)| id)
    }

    pub fn pop_next(&mut self) -> Option<TaskId> {
        let first = self.entries.iter().next().cloned();
        if let Some(entry) = &first {
            self.entries.remove(entry);
        }
        first.map(|(_, _, id)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Priority order as a `Vec`, for scheduler snapshotting.
    pub fn ordered_ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|(_, _, id)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_sorts_before_low_regardless_of_insertion_order() {
        let mut idx = PriorityIndex::new();
        let t0 = Utc::now();
        idx.insert(Priority::Low, t0, "low".to_string());
        idx.insert(Priority::Urgent, t0, "urgent".to_string());
        assert_eq!(idx.pop_next(), Some("urgent".to_string()));
        assert_eq!(idx.pop_next(), Some("low".to_string()));
    }

    #[test]
    fn fifo_within_same_priority() {
        let mut idx = PriorityIndex::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(1);
        idx.insert(Priority::Normal, t1, "second".to_string());
        idx.insert(Priority::Normal, t0, "first".to_string());
        assert_eq!(idx.pop_next(), Some("first".to_string()));
        assert_eq!(idx.pop_next(), Some("second".to_string()));
    }
}
