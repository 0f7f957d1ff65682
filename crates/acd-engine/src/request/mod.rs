//! Queueing requests: the per-call record, its events and its call-detail record.

pub mod cdr;
pub mod events;
pub mod record;

pub use cdr::{CallDetailRecord, CdrCheckpoint, CdrSnapshot};
pub use events::{AcdEvent, RequestEventKind, RequestId, RequestStatus};
pub use record::{EventPublisher, RecordListener, RequestRecord};
