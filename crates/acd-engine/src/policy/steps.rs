use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{BusyPolicyContext, BusyPolicyStep, BusySideEffect, StepOutcome};
use crate::integration::TaskExecutorExt;
use crate::request::RequestRecord;

/// Keep the request queued until it has waited `timeout` since it was last queued
#[derive(Debug, Clone)]
pub struct WaitStep {
    timeout: Duration,
}

impl WaitStep {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl BusyPolicyStep for WaitStep {
    fn apply(&self, record: &Arc<RequestRecord>, _ctx: &BusyPolicyContext) -> StepOutcome {
        if record.since_last_queued() < self.timeout {
            StepOutcome::Wait
        } else {
            StepOutcome::Next
        }
    }
}

/// Where a move step sends the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveTarget {
    Queue(String),
    /// The queue named in the request itself
    TargetQueue,
}

/// Hand the request over to another queue
///
/// Falls through to the next step when the target does not exist or is the queue
/// the request is already in.
#[derive(Debug, Clone)]
pub struct MoveToQueueStep {
    target: MoveTarget,
}

impl MoveToQueueStep {
    pub fn new(target: MoveTarget) -> Self {
        Self { target }
    }
}

impl BusyPolicyStep for MoveToQueueStep {
    fn apply(&self, record: &Arc<RequestRecord>, ctx: &BusyPolicyContext) -> StepOutcome {
        let target_id = match &self.target {
            MoveTarget::Queue(id) => id.clone(),
            MoveTarget::TargetQueue => record.target_queue_id(),
        };

        if record.queue_id().as_deref() == Some(target_id.as_str()) {
            return StepOutcome::Next;
        }

        let Some(target) = ctx.queues.get(&target_id) else {
            warn!("⚠️ Cannot move request {}: queue {} does not exist", record.id(), target_id);
            return StepOutcome::Next;
        };

        match target.enqueue(Arc::clone(record)) {
            Ok(()) => {
                info!("🔀 Moving request {} to queue {}", record.id(), target_id);
                StepOutcome::Leave
            }
            Err(e) => {
                warn!("⚠️ Cannot move request {}: {}", record.id(), e);
                StepOutcome::Next
            }
        }
    }
}

/// Deliver the request to a side-effect sink and continue
#[derive(Clone)]
pub struct EmitStep {
    sink_name: String,
    sink: Arc<dyn BusySideEffect>,
}

impl EmitStep {
    pub fn new(sink_name: impl Into<String>, sink: Arc<dyn BusySideEffect>) -> Self {
        Self { sink_name: sink_name.into(), sink }
    }
}

impl fmt::Debug for EmitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmitStep").field("sink", &self.sink_name).finish()
    }
}

impl BusyPolicyStep for EmitStep {
    fn apply(&self, record: &Arc<RequestRecord>, ctx: &BusyPolicyContext) -> StepOutcome {
        record.add_to_log(format!("emitted to {}", self.sink_name));
        let sink = Arc::clone(&self.sink);
        let record = Arc::clone(record);
        ctx.executor.spawn(async move {
            sink.deliver(record).await;
        });
        StepOutcome::Next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::TokioExecutor;
    use crate::operator::OperatorDispatcher;
    use crate::policy::{BusyDecision, BusyPolicyChain, END_OF_CHAIN_REASON};
    use crate::queue::{QueueRegistry, QueueScheduler};
    use crate::test_support::test_record;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> BusyPolicyContext {
        BusyPolicyContext { queues: QueueRegistry::new(), executor: Arc::new(TokioExecutor::current()) }
    }

    #[derive(Default)]
    struct CountingEffect(AtomicUsize);

    #[async_trait]
    impl BusySideEffect for CountingEffect {
        async fn deliver(&self, _record: Arc<RequestRecord>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_wait_then_fall_off_the_end() {
        let ctx = context();
        let chain = BusyPolicyChain::new("wait", vec![Box::new(WaitStep::new(Duration::from_millis(50)))]);
        let record = test_record(1, 0);
        record.mark_queued(true);

        assert_eq!(chain.process(&record, &ctx), BusyDecision::KeepInQueue);
        assert_eq!(record.busy_cursor(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(chain.process(&record, &ctx), BusyDecision::Reject(END_OF_CHAIN_REASON.to_string()));
        assert_eq!(record.busy_cursor(), 1);

        // Past the end: rejects again, cursor stays put
        assert_eq!(chain.process(&record, &ctx), BusyDecision::Reject(END_OF_CHAIN_REASON.to_string()));
        assert_eq!(record.busy_cursor(), 1);
    }

    #[tokio::test]
    async fn test_empty_chain_rejects() {
        let chain = BusyPolicyChain::new("empty", vec![]);
        let record = test_record(2, 0);
        assert!(matches!(chain.process(&record, &context()), BusyDecision::Reject(_)));
    }

    #[tokio::test]
    async fn test_emit_runs_and_falls_through() {
        let ctx = context();
        let effect = Arc::new(CountingEffect::default());
        let chain = BusyPolicyChain::new(
            "emit",
            vec![
                Box::new(EmitStep::new("ivr", effect.clone())),
                Box::new(WaitStep::new(Duration::from_secs(60))),
            ],
        );
        let record = test_record(3, 0);
        record.mark_queued(true);

        assert_eq!(chain.process(&record, &ctx), BusyDecision::KeepInQueue);
        assert_eq!(record.busy_cursor(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(effect.0.load(Ordering::SeqCst), 1);
        assert!(record.log_lines().iter().any(|line| line.contains("emitted to ivr")));
    }

    #[tokio::test]
    async fn test_move_to_missing_queue_falls_through() {
        let ctx = context();
        let chain = BusyPolicyChain::new(
            "move",
            vec![Box::new(MoveToQueueStep::new(MoveTarget::Queue("nowhere".into())))],
        );
        let record = test_record(4, 0);

        assert_eq!(chain.process(&record, &ctx), BusyDecision::Reject(END_OF_CHAIN_REASON.to_string()));
    }

    #[tokio::test]
    async fn test_move_hands_request_to_other_queue() {
        let ctx = context();
        let overflow = QueueScheduler::spawn(
            "overflow",
            10,
            Duration::from_secs(3600),
            OperatorDispatcher::new(vec![]),
            ctx.clone(),
        );
        ctx.queues.insert(overflow.clone());

        let chain = BusyPolicyChain::new(
            "move",
            vec![Box::new(MoveToQueueStep::new(MoveTarget::Queue("overflow".into())))],
        );
        let record = test_record(5, 0);

        assert_eq!(chain.process(&record, &ctx), BusyDecision::LeftQueue);

        let snapshot = overflow.snapshot().await.unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].request_id, record.id());
        assert_eq!(record.queue_id().as_deref(), Some("overflow"));
        assert_eq!(record.busy_cursor(), 0);
    }
}
