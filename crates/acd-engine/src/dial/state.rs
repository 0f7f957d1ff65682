use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one dial attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub String);

impl AttemptId {
    pub fn new() -> Self {
        Self(format!("attempt-{}", uuid::Uuid::new_v4()))
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// States of one dial attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptState {
    /// Waiting for an operator line
    Init,
    /// Operator number is being invited
    Inviting,
    /// No line could be acquired
    NoFreeLine,
    /// Operator answered
    OperatorReady,
    /// Caller leg is prepared, bridge requested
    AbonentReady,
    /// Both legs bridged
    Commutated,
    /// Bridged conversation finished
    Handled,
    /// Terminal
    Invalid,
}

impl AttemptState {
    /// Allowed successor states
    pub fn successors(self) -> &'static [AttemptState] {
        use AttemptState::*;
        match self {
            Init => &[Inviting, NoFreeLine, Invalid],
            NoFreeLine => &[Invalid],
            Inviting => &[OperatorReady, Invalid],
            OperatorReady => &[AbonentReady, Invalid],
            AbonentReady => &[Commutated, Invalid],
            Commutated => &[Handled, Invalid],
            Handled => &[Invalid],
            Invalid => &[],
        }
    }

    pub fn can_transition(self, to: AttemptState) -> bool {
        self.successors().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self == AttemptState::Invalid
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How an attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Bridged and finished normally
    Handled,
    /// No operator line within the wait timeout
    NoFreeLine,
    /// Invite failed or was not answered in time
    NoAnswer,
    /// Caller gone, request claimed by another attempt, or a leg dropped before bridging
    Aborted,
    /// Collaborator error or illegal transition
    Failed,
}

impl AttemptOutcome {
    pub fn is_handled(self) -> bool {
        self == AttemptOutcome::Handled
    }
}
