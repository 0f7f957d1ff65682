//! Operator management module
//!
//! Operators accept requests handed to them by a queue's [`OperatorDispatcher`].
//! Acceptance is a non-blocking yes/no; an accepting operator starts handling the
//! request in the background and reports back when it is done.

pub mod dial_operator;
pub mod dispatcher;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::monitoring::OperatorStats;
use crate::request::RequestRecord;

pub use dial_operator::DialOperator;
pub use dispatcher::{DispatchResult, OperatorDispatcher, PrioritySelector, NO_SELECTOR_REASON};

/// Who took a request, as written into its CDR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorIdentity {
    pub id: String,
    pub person_id: Option<String>,
    pub person_description: Option<String>,
}

impl OperatorIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), person_id: None, person_description: None }
    }
}

/// Something that can take requests off a queue
pub trait Operator: Send + Sync {
    fn id(&self) -> &str;

    /// Take `record` and start handling it, or decline. Must not block.
    fn try_accept(&self, record: &Arc<RequestRecord>) -> bool;

    fn stats(&self) -> OperatorStats;
}
