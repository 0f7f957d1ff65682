//! Scripted host collaborators for engine tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rvoip_acd_engine::prelude::*;
use rvoip_acd_engine::policy::BusySideEffect;

/// Conversation leg driven by the test
pub struct MockLeg {
    id: String,
    valid: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn LegListener>>>,
    pub ready_calls: AtomicUsize,
}

impl MockLeg {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            valid: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
            ready_calls: AtomicUsize::new(0),
        })
    }

    /// Far end hangs up
    pub fn hang_up(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                listener.on_leg_stopped(&self.id);
            }
        }
    }

    pub fn transfer(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                listener.on_leg_transferred(&self.id);
            }
        }
    }
}

#[async_trait]
impl ConversationLeg for MockLeg {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn add_listener(&self, listener: Arc<dyn LegListener>) {
        self.listeners.lock().push(listener);
    }

    async fn ready_to_commutate(&self) -> Result<()> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.hang_up();
    }
}

/// How an invited number behaves
#[derive(Debug, Clone, Copy)]
pub enum InviteScript {
    AnswerAfter(Duration),
    NeverAnswer,
    Fail,
}

/// Leg provider answering numbers according to a script
#[derive(Default)]
pub struct ScriptedLegProvider {
    scripts: Mutex<HashMap<String, InviteScript>>,
    invites: Mutex<Vec<(InviteRequest, Instant)>>,
    answered: Arc<Mutex<HashMap<String, Arc<MockLeg>>>>,
}

impl ScriptedLegProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, number: &str, script: InviteScript) {
        self.scripts.lock().insert(number.to_string(), script);
    }

    pub fn invited_numbers(&self) -> Vec<String> {
        self.invites.lock().iter().map(|(request, _)| request.number.clone()).collect()
    }

    pub fn invite_time(&self, number: &str) -> Option<Instant> {
        self.invites.lock().iter().find(|(request, _)| request.number == number).map(|(_, at)| *at)
    }

    pub fn invites(&self) -> Vec<InviteRequest> {
        self.invites.lock().iter().map(|(request, _)| request.clone()).collect()
    }

    /// Operator leg created when `number` answered
    pub fn answered_leg(&self, number: &str) -> Option<Arc<MockLeg>> {
        self.answered.lock().get(number).cloned()
    }
}

#[async_trait]
impl LegProvider for ScriptedLegProvider {
    async fn invite(&self, request: InviteRequest, listener: Arc<dyn LegListener>) -> Result<()> {
        let script = self
            .scripts
            .lock()
            .get(&request.number)
            .copied()
            .unwrap_or(InviteScript::AnswerAfter(Duration::ZERO));
        self.invites.lock().push((request.clone(), Instant::now()));

        match script {
            InviteScript::Fail => Err(AcdError::leg(format!("{} unreachable", request.number))),
            InviteScript::NeverAnswer => Ok(()),
            InviteScript::AnswerAfter(delay) => {
                let answered = Arc::clone(&self.answered);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let leg = MockLeg::new(format!("operator-{}", request.number));
                    leg.add_listener(listener.clone());
                    answered.lock().insert(request.number.clone(), leg.clone());
                    listener.on_leg_ready(leg);
                });
                Ok(())
            }
        }
    }
}

struct MockLine(String);

impl OperatorLine for MockLine {
    fn id(&self) -> &str {
        &self.0
    }
}

/// Line pool that either always or never has a free line
pub struct MockLinePool {
    free: bool,
    pub requested: AtomicUsize,
    pub granted: AtomicUsize,
    pub released: AtomicUsize,
}

impl MockLinePool {
    pub fn free() -> Arc<Self> {
        Arc::new(Self::with(true))
    }

    pub fn exhausted() -> Arc<Self> {
        Arc::new(Self::with(false))
    }

    fn with(free: bool) -> Self {
        Self {
            free,
            requested: AtomicUsize::new(0),
            granted: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Lines handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.granted.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinePool for MockLinePool {
    async fn request_line(&self, _priority: i32, owner: &str) -> Option<LineHandle> {
        let n = self.requested.fetch_add(1, Ordering::SeqCst);
        if !self.free {
            return None;
        }
        self.granted.fetch_add(1, Ordering::SeqCst);
        Some(Arc::new(MockLine(format!("line-{}-{}", n, owner))))
    }

    fn release_line(&self, _line: LineHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Bridge service that activates every bridge right away
#[derive(Default)]
pub struct AutoBridgeService {
    pub created: AtomicUsize,
    pub refused: AtomicUsize,
    refuse_next: AtomicBool,
}

impl AutoBridgeService {
    /// Fail the next bridge request
    pub fn refuse_next(&self) {
        self.refuse_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BridgeService for AutoBridgeService {
    async fn create_bridge(
        &self,
        leg_a: LegHandle,
        leg_b: LegHandle,
        listener: Arc<dyn BridgeListener>,
    ) -> Result<String> {
        if self.refuse_next.swap(false, Ordering::SeqCst) {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(AcdError::bridge("media server busy"));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let bridge_id = format!("bridge-{}-{}-{}", n, leg_a.id(), leg_b.id());
        let activated = bridge_id.clone();
        tokio::spawn(async move { listener.on_bridge_activated(&activated) });
        Ok(bridge_id)
    }
}

/// CDR sink keeping every snapshot
#[derive(Default)]
pub struct CollectingCdrSink {
    snapshots: Mutex<Vec<CdrSnapshot>>,
}

impl CollectingCdrSink {
    pub fn for_request(&self, id: RequestId) -> Vec<CdrSnapshot> {
        self.snapshots.lock().iter().filter(|s| s.record.request_id == id).cloned().collect()
    }

    pub fn checkpoints(&self, id: RequestId) -> Vec<CdrCheckpoint> {
        self.for_request(id).iter().map(|s| s.checkpoint).collect()
    }

    pub fn terminal(&self, id: RequestId) -> Vec<CdrSnapshot> {
        self.for_request(id).into_iter().filter(|s| s.checkpoint.is_terminal()).collect()
    }
}

impl CdrSink for CollectingCdrSink {
    fn accept(&self, cdr: CdrSnapshot) {
        self.snapshots.lock().push(cdr);
    }
}

/// Side effect counting deliveries
#[derive(Default)]
pub struct CountingSideEffect {
    pub delivered: Mutex<Vec<RequestId>>,
}

#[async_trait]
impl BusySideEffect for CountingSideEffect {
    async fn deliver(&self, record: Arc<RequestRecord>) {
        self.delivered.lock().push(record.id());
    }
}

/// Engine wired to scripted collaborators
pub struct Harness {
    pub engine: Arc<AcdEngine>,
    pub legs: Arc<ScriptedLegProvider>,
    pub lines: Arc<MockLinePool>,
    pub bridges: Arc<AutoBridgeService>,
    pub cdrs: Arc<CollectingCdrSink>,
}

impl Harness {
    pub async fn new(config: AcdConfig, lines: Arc<MockLinePool>) -> Self {
        Self::with_builder(config, lines, |builder| builder).await
    }

    pub async fn with_builder<F>(config: AcdConfig, lines: Arc<MockLinePool>, customize: F) -> Self
    where
        F: FnOnce(AcdEngineBuilder) -> AcdEngineBuilder,
    {
        let legs = ScriptedLegProvider::new();
        let bridges = Arc::new(AutoBridgeService::default());
        let cdrs = Arc::new(CollectingCdrSink::default());

        let builder = AcdEngine::builder()
            .with_config(config)
            .with_leg_provider(legs.clone())
            .with_line_pool(lines.clone())
            .with_bridge_service(bridges.clone())
            .with_cdr_sink(cdrs.clone());
        let engine = customize(builder).build().await.expect("engine should build");

        Self { engine, legs, lines, bridges, cdrs }
    }

    pub fn enqueue(&self, priority: i32, queue_id: &str) -> (RequestHandle, Arc<MockLeg>) {
        let caller = MockLeg::new(format!("caller-{}", priority));
        let handle = self
            .engine
            .enqueue(priority, queue_id, vec![], caller.clone())
            .expect("enqueue should succeed");
        (handle, caller)
    }
}

/// Config with fast ticks and one queue served by the given operators
pub fn single_queue_config(operators: Vec<OperatorConfig>, busy_policy: Vec<BusyStepConfig>) -> AcdConfig {
    let mut config = AcdConfig::default();
    config.general.tick_interval_ms = 20;
    config.dial.invite_timeout_ms = 2_000;
    config.dial.line_wait_timeout_ms = 500;
    config.queues.push(QueueConfig {
        id: "support".into(),
        max_size: None,
        selectors: vec![SelectorConfig {
            name: "everyone".into(),
            priority: 0,
            operators: operators.iter().map(|op| op.id.clone()).collect(),
            busy_policy,
        }],
    });
    config.operators = operators;
    config
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
