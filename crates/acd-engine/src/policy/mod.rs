//! Busy-behaviour policies
//!
//! When no operator of the matching selector accepts a request, the selector's
//! [`BusyPolicyChain`] decides what happens next. A chain is an ordered list of
//! steps; each request carries its own cursor into the chain, so the same chain is
//! shared by every request of a selector. The cursor is reset whenever the request
//! changes queues.

pub mod steps;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::BusyStepConfig;
use crate::error::{AcdError, Result};
use crate::integration::TaskExecutor;
use crate::queue::QueueRegistry;
use crate::request::RequestRecord;

pub use steps::{EmitStep, MoveTarget, MoveToQueueStep, WaitStep};

/// Reason given when a request runs off the end of its chain
pub const END_OF_CHAIN_REASON: &str = "reached end of busy-behaviour sequence";

/// What a single step decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Stay on this step, keep the request queued
    Wait,
    /// Advance the cursor, keep the request queued
    NextAndWait,
    /// Advance the cursor and evaluate the next step immediately
    Next,
    /// The request was handed to another queue
    Leave,
    Reject(String),
}

/// What the chain decided for the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusyDecision {
    KeepInQueue,
    LeftQueue,
    Reject(String),
}

/// Engine pieces a step may need
#[derive(Clone)]
pub struct BusyPolicyContext {
    pub queues: QueueRegistry,
    pub executor: Arc<dyn TaskExecutor>,
}

/// One step of a busy-policy chain
pub trait BusyPolicyStep: Send + Sync + fmt::Debug {
    fn apply(&self, record: &Arc<RequestRecord>, ctx: &BusyPolicyContext) -> StepOutcome;
}

/// External consumer of emit steps
#[async_trait]
pub trait BusySideEffect: Send + Sync {
    async fn deliver(&self, record: Arc<RequestRecord>);
}

/// Ordered list of busy-behaviour steps
#[derive(Debug)]
pub struct BusyPolicyChain {
    name: String,
    steps: Vec<Box<dyn BusyPolicyStep>>,
}

impl BusyPolicyChain {
    pub fn new(name: impl Into<String>, steps: Vec<Box<dyn BusyPolicyStep>>) -> Self {
        Self { name: name.into(), steps }
    }

    /// Build a chain from configuration. Emit steps must name a registered side effect.
    pub fn from_config(
        name: impl Into<String>,
        steps: &[BusyStepConfig],
        side_effects: &HashMap<String, Arc<dyn BusySideEffect>>,
    ) -> Result<Self> {
        let name = name.into();
        let mut built: Vec<Box<dyn BusyPolicyStep>> = Vec::with_capacity(steps.len());
        for step in steps {
            built.push(match step {
                BusyStepConfig::Wait { timeout_ms } => {
                    Box::new(WaitStep::new(std::time::Duration::from_millis(*timeout_ms)))
                }
                BusyStepConfig::MoveToQueue { queue } => {
                    Box::new(MoveToQueueStep::new(MoveTarget::Queue(queue.clone())))
                }
                BusyStepConfig::MoveToTargetQueue => Box::new(MoveToQueueStep::new(MoveTarget::TargetQueue)),
                BusyStepConfig::Emit { sink } => {
                    let effect = side_effects.get(sink).ok_or_else(|| {
                        AcdError::config(format!("Busy policy {} emits to unregistered sink {}", name, sink))
                    })?;
                    Box::new(EmitStep::new(sink.clone(), Arc::clone(effect)))
                }
            });
        }
        Ok(Self::new(name, built))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the chain from the request's cursor
    ///
    /// A cursor at or past the last step always rejects without moving it further.
    pub fn process(&self, record: &Arc<RequestRecord>, ctx: &BusyPolicyContext) -> BusyDecision {
        loop {
            let cursor = record.busy_cursor();
            let Some(step) = self.steps.get(cursor) else {
                return BusyDecision::Reject(END_OF_CHAIN_REASON.to_string());
            };

            let outcome = step.apply(record, ctx);
            debug!("Busy policy {} step {} ({:?}) for {}: {:?}", self.name, cursor, step, record.id(), outcome);

            match outcome {
                StepOutcome::Wait => return BusyDecision::KeepInQueue,
                StepOutcome::NextAndWait => {
                    record.advance_busy_cursor();
                    return BusyDecision::KeepInQueue;
                }
                StepOutcome::Next => {
                    record.advance_busy_cursor();
                }
                StepOutcome::Leave => return BusyDecision::LeftQueue,
                StepOutcome::Reject(reason) => return BusyDecision::Reject(reason),
            }
        }
    }
}
