use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{AcdConfig, OperatorConfig, QueueConfig};
use crate::dial::{DialContext, DialSettings};
use crate::error::{AcdError, Result};
use crate::integration::{
    BridgeService, CdrSink, HostServices, LegHandle, LegProvider, LinePool, TaskExecutor, TokioExecutor,
    TracingCdrSink,
};
use crate::monitoring::{EngineStats, QueueSnapshot};
use crate::operator::{DialOperator, Operator, OperatorDispatcher, PrioritySelector};
use crate::policy::{BusyPolicyChain, BusyPolicyContext, BusySideEffect};
use crate::queue::{QueueRegistry, QueueScheduler};
use crate::request::{AcdEvent, CallDetailRecord, EventPublisher, RequestId, RequestRecord, RequestStatus};

/// Caller-side handle to an admitted request
#[derive(Clone, Debug)]
pub struct RequestHandle {
    record: Arc<RequestRecord>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.record.id()
    }

    pub fn status(&self) -> RequestStatus {
        self.record.status()
    }

    /// 1-based position while waiting
    pub fn position(&self) -> Option<usize> {
        self.record.position()
    }

    pub fn queue_id(&self) -> Option<String> {
        self.record.queue_id()
    }

    pub fn priority(&self) -> i32 {
        self.record.priority()
    }

    /// Change the priority; the queue re-sorts and renumbers right away
    pub fn set_priority(&self, priority: i32) {
        self.record.set_priority(priority);
    }

    pub fn target_queue_id(&self) -> String {
        self.record.target_queue_id()
    }

    /// Queue used by `move_to_target_queue` busy steps
    pub fn set_target_queue(&self, queue_id: impl Into<String>) {
        self.record.set_target_queue_id(queue_id);
    }

    /// Withdraw the request, as if the caller hung up
    pub fn cancel(&self) {
        self.record.invalidate("cancelled");
    }

    pub fn cdr(&self) -> CallDetailRecord {
        self.record.cdr()
    }

    pub fn log(&self) -> Vec<String> {
        self.record.log_lines()
    }

    pub fn record(&self) -> &Arc<RequestRecord> {
        &self.record
    }
}

/// Automatic call distribution engine
///
/// Owns the queue schedulers and operators built from an [`AcdConfig`] and admits
/// requests into them.
pub struct AcdEngine {
    config: AcdConfig,
    ctx: Arc<DialContext>,
    publisher: EventPublisher,
    queues: QueueRegistry,
    operators: DashMap<String, Arc<dyn Operator>>,
    dial_operators: DashMap<String, Arc<DialOperator>>,
    side_effects: HashMap<String, Arc<dyn BusySideEffect>>,
    next_request_id: AtomicU64,
    admitted: AtomicU64,
}

impl AcdEngine {
    pub fn builder() -> AcdEngineBuilder {
        AcdEngineBuilder::new()
    }

    pub fn config(&self) -> &AcdConfig {
        &self.config
    }

    /// Admit a request into `queue_id`
    ///
    /// `operator_numbers`, when not empty, replaces the numbers of whichever
    /// operator accepts the request.
    pub fn enqueue(
        &self,
        priority: i32,
        queue_id: &str,
        operator_numbers: Vec<String>,
        caller_leg: LegHandle,
    ) -> Result<RequestHandle> {
        let queue = self
            .queues
            .get(queue_id)
            .ok_or_else(|| AcdError::QueueNotFound(queue_id.to_string()))?;

        let id = RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1);
        let record = RequestRecord::new(
            id,
            priority,
            queue_id,
            caller_leg,
            operator_numbers,
            self.publisher.clone(),
        );
        record.add_to_log(format!("admitted to queue {} with priority {}", queue_id, priority));
        record.watch_caller_leg();
        self.admitted.fetch_add(1, Ordering::Relaxed);

        info!("📞 Enqueuing request {} to queue {} (priority: {})", id, queue_id, priority);
        if let Err(e) = queue.enqueue(Arc::clone(&record)) {
            record.reject("queue stopped");
            return Err(e);
        }

        Ok(RequestHandle { record })
    }

    /// Start another queue at runtime
    pub fn create_queue(&self, config: &QueueConfig) -> Result<()> {
        if self.queues.contains(&config.id) {
            return Err(AcdError::config(format!("Duplicate queue id: {}", config.id)));
        }

        let mut selectors = Vec::with_capacity(config.selectors.len());
        for selector in &config.selectors {
            let operators = selector
                .operators
                .iter()
                .map(|id| {
                    self.operators.get(id).map(|op| Arc::clone(op.value())).ok_or_else(|| {
                        AcdError::config(format!("Selector {} references unknown operator {}", selector.name, id))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let chain = BusyPolicyChain::from_config(
                format!("{}/{}", config.id, selector.name),
                &selector.busy_policy,
                &self.side_effects,
            )?;
            selectors.push(PrioritySelector::new(selector.name.clone(), selector.priority, operators, chain));
        }

        let policy_ctx = BusyPolicyContext {
            queues: self.queues.clone(),
            executor: Arc::clone(&self.ctx.services.executor),
        };
        let handle = QueueScheduler::spawn(
            config.id.clone(),
            config.max_size.unwrap_or(self.config.general.default_max_queue_size),
            self.config.general.tick_interval(),
            OperatorDispatcher::new(selectors),
            policy_ctx,
        );
        self.queues.insert(handle);
        Ok(())
    }

    pub fn queue_ids(&self) -> Vec<String> {
        self.queues.ids()
    }

    pub async fn queue_snapshot(&self, queue_id: &str) -> Result<QueueSnapshot> {
        let queue = self
            .queues
            .get(queue_id)
            .ok_or_else(|| AcdError::QueueNotFound(queue_id.to_string()))?;
        queue.snapshot().await
    }

    pub fn operator(&self, operator_id: &str) -> Option<Arc<dyn Operator>> {
        self.operators.get(operator_id).map(|op| Arc::clone(op.value()))
    }

    /// Take a configured operator in or out of rotation
    pub fn set_operator_enabled(&self, operator_id: &str, enabled: bool) -> Result<()> {
        let operator = self
            .dial_operators
            .get(operator_id)
            .ok_or_else(|| AcdError::operator(format!("Unknown operator {}", operator_id)))?;
        operator.set_enabled(enabled);
        Ok(())
    }

    /// Stream of every request event
    pub fn subscribe(&self) -> broadcast::Receiver<AcdEvent> {
        self.publisher.subscribe()
    }

    pub async fn stats(&self) -> EngineStats {
        let mut queues = Vec::new();
        for queue_id in self.queues.ids() {
            match self.queue_snapshot(&queue_id).await {
                Ok(snapshot) => queues.push(snapshot.stats),
                Err(e) => warn!("⚠️ No statistics for queue {}: {}", queue_id, e),
            }
        }

        let mut operators: Vec<_> = self.operators.iter().map(|op| op.value().stats()).collect();
        operators.sort_by(|a, b| a.operator_id.cmp(&b.operator_id));

        let (rejected, disconnected) = self.publisher.terminal_totals();
        EngineStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected,
            disconnected,
            total_queued: queues.iter().map(|q| q.total_requests).sum(),
            queues,
            operators,
        }
    }

    /// Stop every queue; requests still waiting are rejected
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down ACD engine");
        for queue in self.queues.handles() {
            queue.shutdown().await;
        }
    }
}

/// Builder for [`AcdEngine`]
pub struct AcdEngineBuilder {
    config: AcdConfig,
    legs: Option<Arc<dyn LegProvider>>,
    lines: Option<Arc<dyn LinePool>>,
    bridges: Option<Arc<dyn BridgeService>>,
    cdr_sink: Option<Arc<dyn CdrSink>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    side_effects: HashMap<String, Arc<dyn BusySideEffect>>,
    operators: Vec<Arc<dyn Operator>>,
}

impl AcdEngineBuilder {
    /// Builder for the topology described by `config`
    pub fn from_config(config: AcdConfig) -> Self {
        Self::new().with_config(config)
    }

    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: AcdConfig::default(),
            legs: None,
            lines: None,
            bridges: None,
            cdr_sink: None,
            executor: None,
            side_effects: HashMap::new(),
            operators: Vec::new(),
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: AcdConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_leg_provider(mut self, legs: Arc<dyn LegProvider>) -> Self {
        self.legs = Some(legs);
        self
    }

    pub fn with_line_pool(mut self, lines: Arc<dyn LinePool>) -> Self {
        self.lines = Some(lines);
        self
    }

    pub fn with_bridge_service(mut self, bridges: Arc<dyn BridgeService>) -> Self {
        self.bridges = Some(bridges);
        self
    }

    /// Defaults to [`TracingCdrSink`]
    pub fn with_cdr_sink(mut self, sink: Arc<dyn CdrSink>) -> Self {
        self.cdr_sink = Some(sink);
        self
    }

    /// Defaults to a [`TokioExecutor`] on the current runtime
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Register a sink that emit steps can name
    pub fn with_side_effect(mut self, name: impl Into<String>, effect: Arc<dyn BusySideEffect>) -> Self {
        self.side_effects.insert(name.into(), effect);
        self
    }

    /// Add an operator not described by the configuration; selectors find it by id
    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operators.push(operator);
        self
    }

    /// Build the engine and start its queues on the current runtime
    pub async fn build(self) -> Result<Arc<AcdEngine>> {
        let config = self.config;
        let services = HostServices {
            legs: self.legs.ok_or_else(|| AcdError::config("Leg provider not provided"))?,
            lines: self.lines.ok_or_else(|| AcdError::config("Line pool not provided"))?,
            bridges: self.bridges.ok_or_else(|| AcdError::config("Bridge service not provided"))?,
            cdr_sink: self.cdr_sink.unwrap_or_else(|| Arc::new(TracingCdrSink)),
            executor: self.executor.unwrap_or_else(|| Arc::new(TokioExecutor::current())),
        };

        let operators: DashMap<String, Arc<dyn Operator>> = DashMap::new();
        for operator in self.operators {
            operators.insert(operator.id().to_string(), operator);
        }
        validate_with_custom_operators(&config, &operators)?;

        let (events, _) = broadcast::channel(config.general.event_channel_capacity);
        let publisher = EventPublisher::new(events, Arc::clone(&services.cdr_sink));
        let ctx = Arc::new(DialContext { services, settings: DialSettings::from(&config.dial) });

        let dial_operators = DashMap::new();
        for operator_config in &config.operators {
            let operator = DialOperator::new(operator_config.clone(), Arc::clone(&ctx));
            operators.insert(operator_config.id.clone(), operator.clone() as Arc<dyn Operator>);
            dial_operators.insert(operator_config.id.clone(), operator);
        }

        let engine = Arc::new(AcdEngine {
            config: config.clone(),
            ctx,
            publisher,
            queues: QueueRegistry::new(),
            operators,
            dial_operators,
            side_effects: self.side_effects,
            next_request_id: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
        });

        for queue in &config.queues {
            engine.create_queue(queue)?;
        }

        info!(
            "🎯 ACD engine ready: {} queue(s), {} operator(s)",
            engine.queues.len(),
            engine.operators.len()
        );
        Ok(engine)
    }
}

impl Default for AcdEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate `config` with the custom operators standing in as configured ones
fn validate_with_custom_operators(
    config: &AcdConfig,
    custom: &DashMap<String, Arc<dyn Operator>>,
) -> Result<()> {
    let mut config = config.clone();
    for entry in custom.iter() {
        let id = entry.key().clone();
        config.operators.push(OperatorConfig::new(id.clone(), vec![id]));
    }
    config.validate()
}
