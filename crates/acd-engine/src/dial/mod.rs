//! Dialing operators and bridging them to callers
//!
//! A [`DialManager`] works through the operator numbers of one accepted request,
//! sequentially or with delayed parallel fan-out. Each number gets a
//! [`DialAttempt`], a small state machine that acquires a line, invites the
//! number, claims the request once the operator answers, and bridges the two legs.
//!
//! ```text
//! Init ──► Inviting ──► OperatorReady ──► AbonentReady ──► Commutated ──► Handled
//!   │          │              │                 │               │            │
//!   └► NoFreeLine ────────────┴─────────────────┴───────────────┴────────────┴──► Invalid
//! ```

pub mod attempt;
pub mod manager;
pub mod state;

use std::time::Duration;

use crate::config::{DialConfig, DialMode};
use crate::integration::HostServices;

pub use attempt::{AttemptObserver, DialAttempt};
pub use manager::{DialManager, DialOwner, DialReport};
pub use state::{AttemptId, AttemptOutcome, AttemptState};

/// Timeouts and defaults applied to every attempt
#[derive(Debug, Clone)]
pub struct DialSettings {
    pub invite_timeout: Duration,
    pub line_wait_timeout: Duration,
    pub scenario: Option<String>,
    pub default_mode: DialMode,
}

impl From<&DialConfig> for DialSettings {
    fn from(config: &DialConfig) -> Self {
        Self {
            invite_timeout: config.invite_timeout(),
            line_wait_timeout: config.line_wait_timeout(),
            scenario: config.scenario.clone(),
            default_mode: config.default_mode.clone(),
        }
    }
}

/// What dial attempts run against
#[derive(Clone)]
pub struct DialContext {
    pub services: HostServices,
    pub settings: DialSettings,
}
