//! Call-detail records and the event → field mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{RequestEventKind, RequestId};

/// Points in a request's life at which a CDR snapshot is pushed to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdrCheckpoint {
    Queued,
    ReadyToCommutate,
    Commutated,
    Disconnected,
    Rejected,
}

impl CdrCheckpoint {
    pub fn is_terminal(self) -> bool {
        matches!(self, CdrCheckpoint::Disconnected | CdrCheckpoint::Rejected)
    }
}

/// Call-detail record of one queueing request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDetailRecord {
    pub request_id: RequestId,
    pub queue_id: Option<String>,
    pub priority: i32,
    pub queued_time: Option<DateTime<Utc>>,
    pub ready_to_commutate_time: Option<DateTime<Utc>>,
    pub commutated_time: Option<DateTime<Utc>>,
    pub disconnected_time: Option<DateTime<Utc>>,
    pub rejected_time: Option<DateTime<Utc>>,
    /// Milliseconds between commutation and disconnection
    pub conversation_duration_ms: Option<i64>,
    pub operator_id: Option<String>,
    pub operator_number: Option<String>,
    pub operator_person_id: Option<String>,
    pub operator_person_description: Option<String>,
    pub transferred: bool,
    pub reject_reason: Option<String>,
    /// Accumulated text log, attached at the terminal checkpoint
    pub log: Option<String>,
}

/// What the CDR sink receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdrSnapshot {
    pub checkpoint: CdrCheckpoint,
    pub record: CallDetailRecord,
}

impl CallDetailRecord {
    pub fn new(request_id: RequestId, priority: i32) -> Self {
        Self {
            request_id,
            queue_id: None,
            priority,
            queued_time: None,
            ready_to_commutate_time: None,
            commutated_time: None,
            disconnected_time: None,
            rejected_time: None,
            conversation_duration_ms: None,
            operator_id: None,
            operator_number: None,
            operator_person_id: None,
            operator_person_description: None,
            transferred: false,
            reject_reason: None,
            log: None,
        }
    }

    /// Write the fields `event` maps to and return the checkpoint to publish, if any.
    ///
    /// Only the first queueing is a checkpoint; returning to the queue after a failed
    /// dial keeps the original queued time.
    pub fn apply(&mut self, event: &RequestEventKind, at: DateTime<Utc>) -> Option<CdrCheckpoint> {
        match event {
            RequestEventKind::Queued => {
                if self.queued_time.is_none() {
                    self.queued_time = Some(at);
                    Some(CdrCheckpoint::Queued)
                } else {
                    None
                }
            }
            RequestEventKind::PositionChanged { .. } | RequestEventKind::AbonentReady => None,
            RequestEventKind::PriorityChanged { priority } => {
                self.priority = *priority;
                None
            }
            RequestEventKind::Requeued { to, .. } => {
                self.queue_id = Some(to.clone());
                None
            }
            RequestEventKind::OperatorAssigned { operator_id, number } => {
                if operator_id.is_some() {
                    self.operator_id = operator_id.clone();
                }
                self.operator_number = Some(number.clone());
                None
            }
            RequestEventKind::ReadyToCommutate => {
                self.ready_to_commutate_time = Some(at);
                Some(CdrCheckpoint::ReadyToCommutate)
            }
            RequestEventKind::Commutated => {
                self.commutated_time = Some(at);
                Some(CdrCheckpoint::Commutated)
            }
            RequestEventKind::Transferred => {
                self.transferred = true;
                None
            }
            RequestEventKind::Disconnected => {
                if self.is_closed() {
                    return None;
                }
                self.disconnected_time = Some(at);
                self.conversation_duration_ms = self
                    .commutated_time
                    .map(|commutated| (at - commutated).num_milliseconds());
                Some(CdrCheckpoint::Disconnected)
            }
            RequestEventKind::Rejected { reason } => {
                if self.is_closed() {
                    return None;
                }
                self.rejected_time = Some(at);
                self.reject_reason = Some(reason.clone());
                Some(CdrCheckpoint::Rejected)
            }
        }
    }

    /// One of the terminal timestamps is set
    pub fn is_closed(&self) -> bool {
        self.disconnected_time.is_some() || self.rejected_time.is_some()
    }
}
