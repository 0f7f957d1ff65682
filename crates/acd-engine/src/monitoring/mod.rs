//! # Statistics
//!
//! Point-in-time views of queues, operators and the engine as a whole. Queue views
//! are produced by the queue's own scheduler, so they are consistent with the
//! ordering it dispatches from.
//!
//! ```rust,no_run
//! # async fn example(engine: std::sync::Arc<rvoip_acd_engine::AcdEngine>) -> rvoip_acd_engine::Result<()> {
//! let stats = engine.stats().await;
//! for queue in &stats.queues {
//!     println!("📊 {}: {} waiting, longest {} ms", queue.queue_id, queue.total_requests, queue.longest_wait_ms);
//! }
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

use crate::request::{RequestId, RequestStatus};

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_id: String,
    /// Requests currently held
    pub total_requests: usize,
    pub average_wait_ms: u64,
    pub longest_wait_ms: u64,
    /// Requests handed to an operator since start
    pub dispatched: u64,
    /// Requests moved to another queue by a busy policy
    pub moved: u64,
    /// Requests rejected by this queue (overflow, busy policy, shutdown)
    pub rejected: u64,
}

/// One request as seen in a queue snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequestInfo {
    pub request_id: RequestId,
    pub priority: i32,
    pub position: Option<usize>,
    pub status: RequestStatus,
    pub waiting_ms: u64,
}

/// Ordered contents of a queue plus its counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue_id: String,
    pub max_size: usize,
    /// Head first
    pub entries: Vec<QueuedRequestInfo>,
    pub stats: QueueStats,
}

/// Per-operator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub operator_id: String,
    pub enabled: bool,
    pub available: bool,
    pub active_requests: usize,
    pub accepted: u64,
    pub handled: u64,
    pub not_handled: u64,
    pub attempts: u64,
    pub no_free_line: u64,
    pub no_answer: u64,
    pub aborted: u64,
}

/// Engine-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Requests accepted by `enqueue`
    pub admitted: u64,
    /// Requests that ended rejected
    pub rejected: u64,
    /// Requests that ended disconnected, handled or not
    pub disconnected: u64,
    /// Requests waiting in any queue right now
    pub total_queued: usize,
    pub queues: Vec<QueueStats>,
    pub operators: Vec<OperatorStats>,
}
