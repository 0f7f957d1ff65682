//! # Host Collaborators
//!
//! The engine never talks to signaling or media directly. Everything it needs from
//! the telephony host is expressed by the traits in this module:
//!
//! - [`ConversationLeg`] / [`LegProvider`]: one end of a call, and a way to invite a
//!   number to get a new one. Progress arrives through [`LegListener`].
//! - [`LinePool`]: the operator lines; a line must be held while an attempt dials.
//! - [`BridgeService`]: joins the caller leg and the operator leg; activation is
//!   reported through [`BridgeListener`].
//! - [`CdrSink`]: receives call-detail snapshots.
//! - [`TaskExecutor`]: runs side effects and timers off the caller's thread.
//!
//! Listener callbacks may be invoked from any thread. The engine never does real
//! work inside them; it re-dispatches onto the executor.

mod executor;

pub use executor::{TaskExecutor, TaskExecutorExt, TokioExecutor};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::request::CdrSnapshot;

/// Identifier of a conversation leg
pub type LegId = String;

/// Shared handle to a conversation leg
pub type LegHandle = Arc<dyn ConversationLeg>;

/// Shared handle to an operator line
pub type LineHandle = Arc<dyn OperatorLine>;

/// One independently controllable end of a call
#[async_trait]
pub trait ConversationLeg: Send + Sync {
    fn id(&self) -> &str;

    /// `false` once the far end hung up or the leg was transferred away
    fn is_valid(&self) -> bool;

    /// Register for ready / stopped / transferred notifications
    fn add_listener(&self, listener: Arc<dyn LegListener>);

    /// Prepare the leg to be bridged (stop hold music, answer early media, ...)
    ///
    /// Called on the caller leg once an operator answered.
    async fn ready_to_commutate(&self) -> Result<()> {
        Ok(())
    }

    /// Hang the leg up. Must be idempotent.
    async fn stop(&self);
}

/// Leg progress notifications
pub trait LegListener: Send + Sync {
    /// The invited party answered
    fn on_leg_ready(&self, leg: LegHandle);

    /// The leg ended
    fn on_leg_stopped(&self, leg_id: &str);

    /// The leg was transferred away from this engine
    fn on_leg_transferred(&self, leg_id: &str);
}

/// Parameters of an outbound invite
#[derive(Debug, Clone, Serialize)]
pub struct InviteRequest {
    pub number: String,
    pub timeout_secs: u64,
    pub scenario: Option<String>,
    pub bindings: HashMap<String, String>,
}

/// Creates outbound conversation legs
#[async_trait]
pub trait LegProvider: Send + Sync {
    /// Start inviting `request.number`
    ///
    /// An `Ok` only means the invite was sent; the answer is reported through
    /// `listener.on_leg_ready`, failures through `on_leg_stopped`.
    async fn invite(&self, request: InviteRequest, listener: Arc<dyn LegListener>) -> Result<()>;
}

/// A line taken from the operator pool
pub trait OperatorLine: Send + Sync {
    fn id(&self) -> &str;
}

/// Operator line pool
#[async_trait]
pub trait LinePool: Send + Sync {
    /// Wait for a free line; `None` when the pool gives up
    async fn request_line(&self, priority: i32, owner: &str) -> Option<LineHandle>;

    /// Return a line to the pool
    fn release_line(&self, line: LineHandle);
}

/// Bridge activation notifications
pub trait BridgeListener: Send + Sync {
    fn on_bridge_activated(&self, bridge_id: &str);

    fn on_bridge_deactivated(&self, bridge_id: &str);
}

/// Joins two legs so media flows between them
#[async_trait]
pub trait BridgeService: Send + Sync {
    /// Create the bridge and return its id; activation is reported to `listener`
    async fn create_bridge(
        &self,
        leg_a: LegHandle,
        leg_b: LegHandle,
        listener: Arc<dyn BridgeListener>,
    ) -> Result<String>;
}

/// Receives one snapshot per CDR checkpoint and one per terminal event
pub trait CdrSink: Send + Sync {
    fn accept(&self, cdr: CdrSnapshot);
}

/// CDR sink writing every snapshot as JSON to the `acd::cdr` tracing target
#[derive(Debug, Default)]
pub struct TracingCdrSink;

impl CdrSink for TracingCdrSink {
    fn accept(&self, cdr: CdrSnapshot) {
        match serde_json::to_string(&cdr) {
            Ok(json) => info!(target: "acd::cdr", "{}", json),
            Err(e) => tracing::warn!(target: "acd::cdr", "Failed to serialize CDR {}: {}", cdr.record.request_id, e),
        }
    }
}

/// The collaborators one engine instance works with
#[derive(Clone)]
pub struct HostServices {
    pub legs: Arc<dyn LegProvider>,
    pub lines: Arc<dyn LinePool>,
    pub bridges: Arc<dyn BridgeService>,
    pub cdr_sink: Arc<dyn CdrSink>,
    pub executor: Arc<dyn TaskExecutor>,
}
