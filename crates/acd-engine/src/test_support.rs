//! Fixtures shared by unit tests

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::DialConfig;
use crate::dial::{DialContext, DialSettings};
use crate::integration::{
    BridgeListener, BridgeService, CdrSink, ConversationLeg, HostServices, InviteRequest, LegHandle, LegListener,
    LegProvider, LineHandle, LinePool, TokioExecutor,
};
use crate::request::{CdrSnapshot, EventPublisher, RequestId, RequestRecord};

pub(crate) struct StaticLeg;

#[async_trait]
impl ConversationLeg for StaticLeg {
    fn id(&self) -> &str {
        "caller"
    }
    fn is_valid(&self) -> bool {
        true
    }
    fn add_listener(&self, _listener: Arc<dyn LegListener>) {}
    async fn stop(&self) {}
}

#[derive(Default)]
pub(crate) struct CollectingSink(pub Mutex<Vec<CdrSnapshot>>);

impl CdrSink for CollectingSink {
    fn accept(&self, cdr: CdrSnapshot) {
        self.0.lock().push(cdr);
    }
}

pub(crate) fn test_publisher() -> EventPublisher {
    let (tx, _) = broadcast::channel(64);
    EventPublisher::new(tx, Arc::new(CollectingSink::default()))
}

pub(crate) fn test_record(id: u64, priority: i32) -> Arc<RequestRecord> {
    RequestRecord::new(RequestId(id), priority, "support", Arc::new(StaticLeg), vec![], test_publisher())
}

/// Pool that never has a line
pub(crate) struct NoLines;

#[async_trait]
impl LinePool for NoLines {
    async fn request_line(&self, _priority: i32, _owner: &str) -> Option<LineHandle> {
        None
    }
    fn release_line(&self, _line: LineHandle) {}
}

/// Leg provider and bridge service that always fail
pub(crate) struct Unreachable;

#[async_trait]
impl LegProvider for Unreachable {
    async fn invite(&self, request: InviteRequest, _listener: Arc<dyn LegListener>) -> crate::Result<()> {
        Err(crate::AcdError::leg(format!("cannot reach {}", request.number)))
    }
}

#[async_trait]
impl BridgeService for Unreachable {
    async fn create_bridge(
        &self,
        _a: LegHandle,
        _b: LegHandle,
        _listener: Arc<dyn BridgeListener>,
    ) -> crate::Result<String> {
        Err(crate::AcdError::bridge("no bridges"))
    }
}

/// Dial context on the current runtime where nothing can be reached
pub(crate) fn dead_end_context() -> Arc<DialContext> {
    Arc::new(DialContext {
        services: HostServices {
            legs: Arc::new(Unreachable),
            lines: Arc::new(NoLines),
            bridges: Arc::new(Unreachable),
            cdr_sink: Arc::new(CollectingSink::default()),
            executor: Arc::new(TokioExecutor::current()),
        },
        settings: DialSettings::from(&DialConfig::default()),
    })
}
