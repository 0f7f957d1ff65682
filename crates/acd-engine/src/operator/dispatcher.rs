use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::Operator;
use crate::policy::{BusyDecision, BusyPolicyChain, BusyPolicyContext};
use crate::request::RequestRecord;

/// Reason given when no selector matches a request's priority
pub const NO_SELECTOR_REASON: &str = "no priority selector";

/// Group of operators serving requests at or above a priority threshold
pub struct PrioritySelector {
    name: String,
    priority: i32,
    operators: Vec<Arc<dyn Operator>>,
    /// Index the next scan starts from
    rotation: AtomicUsize,
    busy_policy: Arc<BusyPolicyChain>,
}

impl PrioritySelector {
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        operators: Vec<Arc<dyn Operator>>,
        busy_policy: BusyPolicyChain,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            operators,
            rotation: AtomicUsize::new(0),
            busy_policy: Arc::new(busy_policy),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn operators(&self) -> &[Arc<dyn Operator>] {
        &self.operators
    }

    pub fn busy_policy(&self) -> &Arc<BusyPolicyChain> {
        &self.busy_policy
    }

    fn rotation_start(&self) -> usize {
        match self.operators.len() {
            0 => 0,
            len => self.rotation.load(Ordering::Relaxed) % len,
        }
    }

    /// Next scan starts right after the operator that just accepted
    fn advance_rotation(&self, accepted_index: usize) {
        self.rotation.store(accepted_index + 1, Ordering::Relaxed);
    }
}

/// How a dispatch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Accepted { operator_id: String },
    /// Nobody free; the busy policy keeps the request queued
    LeaveInQueue,
    /// The busy policy handed the request to another queue
    Moved,
    Rejected(String),
}

/// Picks the selector for a request and offers it to that selector's operators
pub struct OperatorDispatcher {
    /// Highest threshold first
    selectors: Vec<PrioritySelector>,
}

impl OperatorDispatcher {
    pub fn new(mut selectors: Vec<PrioritySelector>) -> Self {
        selectors.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { selectors }
    }

    pub fn selectors(&self) -> &[PrioritySelector] {
        &self.selectors
    }

    /// The highest-threshold selector the priority qualifies for
    pub fn select(&self, priority: i32) -> Option<&PrioritySelector> {
        self.selectors.iter().find(|selector| selector.priority <= priority)
    }

    /// Offer `record` to each operator of its selector once, round-robin, then fall
    /// back to the selector's busy policy
    pub fn dispatch(&self, record: &Arc<RequestRecord>, ctx: &BusyPolicyContext) -> DispatchResult {
        let Some(selector) = self.select(record.priority()) else {
            return DispatchResult::Rejected(NO_SELECTOR_REASON.to_string());
        };

        let count = selector.operators.len();
        let start = selector.rotation_start();
        for offset in 0..count {
            let index = (start + offset) % count;
            let operator = &selector.operators[index];
            record.record_operator_hop();
            if operator.try_accept(record) {
                record.set_operator_index(index);
                selector.advance_rotation(index);
                return DispatchResult::Accepted { operator_id: operator.id().to_string() };
            }
        }

        debug!("No operator of selector {} free for request {}", selector.name, record.id());
        let chain = record.bind_busy_policy(&selector.busy_policy);
        match chain.process(record, ctx) {
            BusyDecision::KeepInQueue => DispatchResult::LeaveInQueue,
            BusyDecision::LeftQueue => DispatchResult::Moved,
            BusyDecision::Reject(reason) => DispatchResult::Rejected(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::TokioExecutor;
    use crate::monitoring::OperatorStats;
    use crate::policy::{WaitStep, END_OF_CHAIN_REASON};
    use crate::queue::QueueRegistry;
    use crate::test_support::test_record;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct ScriptedOperator {
        id: String,
        accepting: AtomicBool,
        offered: Mutex<Vec<u64>>,
    }

    impl ScriptedOperator {
        fn new(id: &str, accepting: bool) -> Arc<Self> {
            Arc::new(Self { id: id.into(), accepting: AtomicBool::new(accepting), offered: Mutex::new(vec![]) })
        }
    }

    impl Operator for ScriptedOperator {
        fn id(&self) -> &str {
            &self.id
        }
        fn try_accept(&self, record: &Arc<RequestRecord>) -> bool {
            self.offered.lock().push(record.id().0);
            self.accepting.load(Ordering::SeqCst)
        }
        fn stats(&self) -> OperatorStats {
            OperatorStats { operator_id: self.id.clone(), ..Default::default() }
        }
    }

    fn context() -> BusyPolicyContext {
        BusyPolicyContext { queues: QueueRegistry::new(), executor: Arc::new(TokioExecutor::current()) }
    }

    fn selector(name: &str, priority: i32, operators: Vec<Arc<ScriptedOperator>>) -> PrioritySelector {
        PrioritySelector::new(
            name,
            priority,
            operators.into_iter().map(|op| op as Arc<dyn Operator>).collect(),
            BusyPolicyChain::new(name, vec![Box::new(WaitStep::new(Duration::from_secs(60)))]),
        )
    }

    fn accepted_by(result: DispatchResult) -> String {
        match result {
            DispatchResult::Accepted { operator_id } => operator_id,
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let ops: Vec<_> = ["a", "b", "c"].iter().map(|id| ScriptedOperator::new(id, true)).collect();
        let dispatcher = OperatorDispatcher::new(vec![selector("all", 0, ops)]);
        let ctx = context();

        let picked: Vec<String> = (1..=4)
            .map(|id| accepted_by(dispatcher.dispatch(&test_record(id, 0), &ctx)))
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_skips_busy_operators_and_counts_hops() {
        let busy = ScriptedOperator::new("busy", false);
        let free = ScriptedOperator::new("free", true);
        let dispatcher = OperatorDispatcher::new(vec![selector("all", 0, vec![busy.clone(), free.clone()])]);
        let record = test_record(1, 0);

        assert_eq!(accepted_by(dispatcher.dispatch(&record, &context())), "free");
        assert_eq!(record.operator_hops(), 2);
        assert_eq!(record.operator_index(), Some(1));
        assert_eq!(busy.offered.lock().as_slice(), &[1]);
    }

    #[tokio::test]
    async fn test_nobody_free_uses_busy_policy() {
        let ops = vec![ScriptedOperator::new("a", false), ScriptedOperator::new("b", false)];
        let dispatcher = OperatorDispatcher::new(vec![selector("all", 0, ops.clone())]);
        let record = test_record(1, 0);
        record.mark_queued(true);

        assert_eq!(dispatcher.dispatch(&record, &context()), DispatchResult::LeaveInQueue);
        // Each operator offered exactly once
        assert_eq!(ops[0].offered.lock().len(), 1);
        assert_eq!(ops[1].offered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_selector_threshold() {
        let vip = ScriptedOperator::new("vip", true);
        let regular = ScriptedOperator::new("regular", true);
        let dispatcher = OperatorDispatcher::new(vec![
            selector("regular", 0, vec![regular]),
            selector("vip", 10, vec![vip]),
        ]);
        let ctx = context();

        assert_eq!(dispatcher.select(15).map(|s| s.name()), Some("vip"));
        assert_eq!(dispatcher.select(10).map(|s| s.name()), Some("vip"));
        assert_eq!(dispatcher.select(3).map(|s| s.name()), Some("regular"));
        assert!(dispatcher.select(-1).is_none());

        assert_eq!(accepted_by(dispatcher.dispatch(&test_record(1, 12), &ctx)), "vip");
        assert_eq!(
            dispatcher.dispatch(&test_record(2, -5), &ctx),
            DispatchResult::Rejected(NO_SELECTOR_REASON.to_string())
        );
    }

    #[tokio::test]
    async fn test_empty_selector_goes_straight_to_policy() {
        let dispatcher = OperatorDispatcher::new(vec![PrioritySelector::new(
            "nobody",
            0,
            vec![],
            BusyPolicyChain::new("nobody", vec![]),
        )]);

        assert_eq!(
            dispatcher.dispatch(&test_record(1, 0), &context()),
            DispatchResult::Rejected(END_OF_CHAIN_REASON.to_string())
        );
    }
}
