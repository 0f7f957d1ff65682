//! Request queues
//!
//! Each queue is owned by a [`QueueScheduler`] task. Everything else talks to it
//! through a cloneable [`QueueHandle`]; handles are looked up by id in the
//! [`QueueRegistry`], which is also how busy policies move requests between queues.

pub mod ordering;
pub mod scheduler;

use std::sync::Arc;

use dashmap::DashMap;

pub use ordering::{queue_order, OrderedQueue, QueueEntry};
pub use scheduler::{QueueCommand, QueueHandle, QueueScheduler};

/// Running queues by id
#[derive(Clone, Default)]
pub struct QueueRegistry {
    queues: Arc<DashMap<String, QueueHandle>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: QueueHandle) -> Option<QueueHandle> {
        self.queues.insert(handle.id().to_string(), handle)
    }

    pub fn get(&self, queue_id: &str) -> Option<QueueHandle> {
        self.queues.get(queue_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, queue_id: &str) -> bool {
        self.queues.contains_key(queue_id)
    }

    pub fn remove(&self, queue_id: &str) -> Option<QueueHandle> {
        self.queues.remove(queue_id).map(|(_, handle)| handle)
    }

    /// Sorted queue ids
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn handles(&self) -> Vec<QueueHandle> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
