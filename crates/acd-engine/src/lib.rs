//! # Automatic Call Distribution for RVOIP
//!
//! This crate queues incoming calls, hands them to operators and bridges each
//! caller with the operator that answers. It owns no signalling or media itself:
//! conversation legs, operator lines, bridges and CDR storage are supplied by the
//! host through the traits in [`integration`].
//!
//! ## Features
//!
//! - **Priority queues**: bounded, ordered by priority then admission order, with
//!   live position updates
//! - **Operator dispatch**: priority-threshold selectors, round-robin between
//!   operators, per-operator capacity and retry / wrap-up pauses
//! - **Busy policies**: wait, move to another queue, emit to an external sink or
//!   reject when nobody is free
//! - **Dialling**: sequential or delayed-parallel fan-out across operator numbers,
//!   with exactly one attempt winning the bridge
//! - **Call-detail records**: one snapshot per checkpoint and exactly one terminal
//!   record per request
//!
//! ## Architecture
//!
//! - [`queue`]: one scheduler task per queue, owning the ordered request list
//! - [`operator`]: selectors, round-robin dispatch and the dialling operator
//! - [`policy`]: busy-behaviour chains
//! - [`dial`]: dial managers and the per-number attempt state machine
//! - [`request`]: the shared request record, its events and CDR
//! - [`monitoring`]: queue, operator and engine statistics
//! - [`integration`]: host collaborator traits and the task executor
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rvoip_acd_engine::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     legs: Arc<dyn LegProvider>,
//! #     lines: Arc<dyn LinePool>,
//! #     bridges: Arc<dyn BridgeService>,
//! #     caller: LegHandle,
//! # ) -> Result<()> {
//! let config = AcdConfig::from_toml(r#"
//!     [[operators]]
//!     id = "alice"
//!     numbers = ["1001"]
//!
//!     [[queues]]
//!     id = "support"
//!
//!     [[queues.selectors]]
//!     name = "everyone"
//!     priority = 0
//!     operators = ["alice"]
//!     busy_policy = [{ type = "wait", timeout_ms = 30000 }]
//! "#)?;
//!
//! let engine = AcdEngine::builder()
//!     .with_config(config)
//!     .with_leg_provider(legs)
//!     .with_line_pool(lines)
//!     .with_bridge_service(bridges)
//!     .build()
//!     .await?;
//!
//! let request = engine.enqueue(0, "support", vec![], caller)?;
//! println!("📞 {} queued at position {:?}", request.id(), request.position());
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod logging;

// Distribution
pub mod dial;
pub mod operator;
pub mod policy;
pub mod queue;
pub mod request;

// Surfaces
pub mod engine;
pub mod integration;
pub mod monitoring;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use config::AcdConfig;
pub use engine::{AcdEngine, AcdEngineBuilder, RequestHandle};
pub use error::{AcdError, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::{
        AcdConfig, BusyStepConfig, DialConfig, DialMode, GeneralConfig, OperatorConfig, QueueConfig,
        SelectorConfig,
    };
    pub use crate::engine::{AcdEngine, AcdEngineBuilder, RequestHandle};
    pub use crate::error::{AcdError, Result};
    pub use crate::integration::{
        BridgeListener, BridgeService, CdrSink, ConversationLeg, InviteRequest, LegHandle, LegListener,
        LegProvider, LineHandle, LinePool, OperatorLine, TaskExecutor, TokioExecutor, TracingCdrSink,
    };
    pub use crate::logging::{setup_logging, LoggingConfig};
    pub use crate::monitoring::{EngineStats, OperatorStats, QueueSnapshot, QueueStats};
    pub use crate::operator::{Operator, OperatorIdentity};
    pub use crate::policy::BusySideEffect;
    pub use crate::request::{
        AcdEvent, CallDetailRecord, CdrCheckpoint, CdrSnapshot, RequestEventKind, RequestId, RequestRecord,
        RequestStatus,
    };
}
