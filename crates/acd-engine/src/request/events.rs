use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request identifier, assigned in admission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// What happened to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestEventKind {
    /// Admitted to (or returned to) a queue
    Queued,
    /// 1-based position in the visible window of the queue changed
    PositionChanged { position: usize },
    PriorityChanged { priority: i32 },
    /// Moved from one queue to another
    Requeued { from: Option<String>, to: String },
    /// A dial attempt started inviting an operator number
    OperatorAssigned { operator_id: Option<String>, number: String },
    /// An operator answered and claimed the request
    ReadyToCommutate,
    /// The caller leg is prepared; bridging started
    AbonentReady,
    Commutated,
    Transferred,
    Disconnected,
    Rejected { reason: String },
}

impl RequestEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestEventKind::Disconnected | RequestEventKind::Rejected { .. })
    }
}

/// Event published on the engine's event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdEvent {
    pub request_id: RequestId,
    pub queue_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: RequestEventKind,
}

/// Caller-visible request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queueing,
    ReadyToCommutate,
    Commutating,
    Commutated,
    Disconnected,
    Rejected,
}

impl RequestStatus {
    /// Status after `event`, starting from `self`
    pub fn after(self, event: &RequestEventKind) -> RequestStatus {
        if self.is_final() {
            return self;
        }
        match event {
            RequestEventKind::Queued | RequestEventKind::Requeued { .. } => RequestStatus::Queueing,
            RequestEventKind::ReadyToCommutate => RequestStatus::ReadyToCommutate,
            RequestEventKind::AbonentReady => RequestStatus::Commutating,
            RequestEventKind::Commutated => RequestStatus::Commutated,
            RequestEventKind::Disconnected => RequestStatus::Disconnected,
            RequestEventKind::Rejected { .. } => RequestStatus::Rejected,
            RequestEventKind::PositionChanged { .. }
            | RequestEventKind::PriorityChanged { .. }
            | RequestEventKind::OperatorAssigned { .. }
            | RequestEventKind::Transferred => self,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, RequestStatus::Disconnected | RequestStatus::Rejected)
    }
}
