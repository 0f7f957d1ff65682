use std::cmp::Ordering;
use std::sync::Arc;

use crate::request::{RequestId, RequestRecord};

/// Something that can be held in an [`OrderedQueue`]
pub trait QueueEntry {
    fn priority(&self) -> i32;
    fn request_id(&self) -> RequestId;
}

impl QueueEntry for Arc<RequestRecord> {
    fn priority(&self) -> i32 {
        RequestRecord::priority(self)
    }

    fn request_id(&self) -> RequestId {
        self.id()
    }
}

/// Higher priority first, then admission order
pub fn queue_order<T: QueueEntry>(a: &T, b: &T) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.request_id().cmp(&b.request_id()))
}

/// Bounded priority-ordered list of requests
///
/// Priorities are mutable while requests wait, so the list is re-sorted on every
/// insertion and whenever [`OrderedQueue::resort`] is called.
#[derive(Debug)]
pub struct OrderedQueue<T> {
    entries: Vec<T>,
    max_size: usize,
}

impl<T: QueueEntry> OrderedQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self { entries: Vec::new(), max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `entry` at its place. Returns the tail entry evicted because the
    /// queue grew past its capacity, which may be `entry` itself.
    pub fn insert(&mut self, entry: T) -> Option<T> {
        self.entries.push(entry);
        self.resort();
        if self.entries.len() > self.max_size {
            self.entries.pop()
        } else {
            None
        }
    }

    /// Restore the order; `true` when entries had to move
    pub fn resort(&mut self) -> bool {
        let sorted = self
            .entries
            .windows(2)
            .all(|pair| queue_order(&pair[0], &pair[1]) != Ordering::Greater);
        if !sorted {
            self.entries.sort_by(queue_order);
        }
        !sorted
    }

    pub fn head(&self) -> Option<&T> {
        self.entries.first()
    }

    pub fn pop_head(&mut self) -> Option<T> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.iter().any(|entry| entry.request_id() == id)
    }

    /// Drop every entry matching `predicate` and return them
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if predicate(&self.entries[index]) {
                removed.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }

    pub fn drain_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}
