use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::cdr::{CallDetailRecord, CdrCheckpoint, CdrSnapshot};
use super::events::{AcdEvent, RequestEventKind, RequestId, RequestStatus};
use crate::dial::AttemptId;
use crate::integration::{CdrSink, LegHandle, LegListener};
use crate::operator::OperatorIdentity;
use crate::policy::BusyPolicyChain;
use crate::queue::QueueHandle;

/// Notified when a request stops being handled
pub trait RecordListener: Send + Sync {
    fn on_request_invalidated(&self, request_id: RequestId);
}

/// Where request events and CDR snapshots go
#[derive(Clone)]
pub struct EventPublisher {
    events: broadcast::Sender<AcdEvent>,
    cdr_sink: Arc<dyn CdrSink>,
    totals: Arc<TerminalTotals>,
}

#[derive(Default)]
struct TerminalTotals {
    rejected: AtomicU64,
    disconnected: AtomicU64,
}

impl EventPublisher {
    pub fn new(events: broadcast::Sender<AcdEvent>, cdr_sink: Arc<dyn CdrSink>) -> Self {
        Self { events, cdr_sink, totals: Arc::default() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AcdEvent> {
        self.events.subscribe()
    }

    /// Requests closed so far as (rejected, disconnected)
    pub fn terminal_totals(&self) -> (u64, u64) {
        (
            self.totals.rejected.load(Ordering::Relaxed),
            self.totals.disconnected.load(Ordering::Relaxed),
        )
    }

    fn publish(&self, event: AcdEvent, snapshot: Option<CdrSnapshot>) {
        // No receivers is fine
        let _ = self.events.send(event);
        if let Some(snapshot) = snapshot {
            match snapshot.checkpoint {
                CdrCheckpoint::Rejected => self.totals.rejected.fetch_add(1, Ordering::Relaxed),
                CdrCheckpoint::Disconnected => self.totals.disconnected.fetch_add(1, Ordering::Relaxed),
                _ => 0,
            };
            self.cdr_sink.accept(snapshot);
        }
    }
}

/// One call queueing request
///
/// Shared between the queue that holds it, the operator handling it and the dial
/// attempts bridging it. `valid` is a one-way latch; once it drops, the request is
/// torn down and never queued again. The terminal CDR is guarded by a second latch so
/// that racing disconnect and reject paths produce exactly one terminal record.
pub struct RequestRecord {
    id: RequestId,
    caller_leg: LegHandle,
    operator_numbers: Vec<String>,
    created_at: Instant,
    valid: AtomicBool,
    terminal: AtomicBool,
    state: Mutex<RecordState>,
    listeners: Mutex<Vec<(String, Arc<dyn RecordListener>)>>,
    publisher: EventPublisher,
}

struct RecordState {
    priority: i32,
    target_queue_id: String,
    queue: Option<QueueHandle>,
    position: Option<usize>,
    busy_cursor: usize,
    busy_policy: Option<Arc<BusyPolicyChain>>,
    operator_index: Option<usize>,
    operator_hops: u32,
    operator: Option<OperatorIdentity>,
    last_queued_at: Option<Instant>,
    attached_at: Option<Instant>,
    /// Operators that passed the request back and decline its next offer
    declined_by: Vec<String>,
    claimed_by: Option<AttemptId>,
    status: RequestStatus,
    cdr: CallDetailRecord,
    log: Vec<String>,
}

impl RequestRecord {
    pub fn new(
        id: RequestId,
        priority: i32,
        target_queue_id: impl Into<String>,
        caller_leg: LegHandle,
        operator_numbers: Vec<String>,
        publisher: EventPublisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            caller_leg,
            operator_numbers,
            created_at: Instant::now(),
            valid: AtomicBool::new(true),
            terminal: AtomicBool::new(false),
            state: Mutex::new(RecordState {
                priority,
                target_queue_id: target_queue_id.into(),
                queue: None,
                position: None,
                busy_cursor: 0,
                busy_policy: None,
                operator_index: None,
                operator_hops: 0,
                operator: None,
                last_queued_at: None,
                attached_at: None,
                declined_by: Vec::new(),
                claimed_by: None,
                status: RequestStatus::Queueing,
                cdr: CallDetailRecord::new(id, priority),
                log: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            publisher,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn caller_leg(&self) -> &LegHandle {
        &self.caller_leg
    }

    /// Numbers supplied with the request; empty when operators dial their own
    pub fn operator_numbers(&self) -> &[String] {
        &self.operator_numbers
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    pub fn priority(&self) -> i32 {
        self.state.lock().priority
    }

    pub fn set_priority(&self, priority: i32) {
        let changed = {
            let mut state = self.state.lock();
            if state.priority == priority {
                false
            } else {
                state.priority = priority;
                true
            }
        };
        if changed {
            self.fire(RequestEventKind::PriorityChanged { priority });
            if let Some(queue) = self.queue() {
                queue.request_resort();
            }
        }
    }

    pub fn target_queue_id(&self) -> String {
        self.state.lock().target_queue_id.clone()
    }

    /// Redirect the request; used by move-to-target-queue steps
    pub fn set_target_queue_id(&self, queue_id: impl Into<String>) {
        self.state.lock().target_queue_id = queue_id.into();
    }

    /// The queue currently holding the request
    pub fn queue(&self) -> Option<QueueHandle> {
        self.state.lock().queue.clone()
    }

    pub fn queue_id(&self) -> Option<String> {
        self.state.lock().queue.as_ref().map(|queue| queue.id().to_string())
    }

    pub fn position(&self) -> Option<usize> {
        self.state.lock().position
    }

    /// Update the 1-based position; `None` once the request left the visible window
    pub(crate) fn set_position(&self, position: Option<usize>) {
        let changed = {
            let mut state = self.state.lock();
            if state.position == position {
                None
            } else {
                state.position = position;
                position
            }
        };
        if let Some(position) = changed {
            self.fire(RequestEventKind::PositionChanged { position });
        }
    }

    /// Bind the request to `queue`. Changing queues resets operator and busy-policy progress.
    pub(crate) fn attach_to_queue(&self, queue: QueueHandle) {
        let moved = {
            let mut state = self.state.lock();
            let previous = state.queue.as_ref().map(|q| q.id().to_string());
            if previous.as_deref() == Some(queue.id()) {
                None
            } else {
                let to = queue.id().to_string();
                state.queue = Some(queue);
                state.attached_at = Some(Instant::now());
                state.declined_by.clear();
                state.position = None;
                state.busy_cursor = 0;
                state.busy_policy = None;
                state.operator_index = None;
                state.operator_hops = 0;
                Some((previous, to))
            }
        };
        // First admission is reported by the Queued event alone
        if let Some((Some(from), to)) = moved {
            self.add_to_log(format!("moved from queue {} to queue {}", from, to));
            self.fire(RequestEventKind::Requeued { from: Some(from), to });
        }
    }

    /// Record that the request entered its queue. `fresh` restarts the busy-policy wait clock.
    pub(crate) fn mark_queued(&self, fresh: bool) {
        {
            let mut state = self.state.lock();
            if fresh || state.last_queued_at.is_none() {
                state.last_queued_at = Some(Instant::now());
            }
        }
        self.fire(RequestEventKind::Queued);
    }

    /// Time since the request was last queued afresh
    pub fn since_last_queued(&self) -> Duration {
        self.state
            .lock()
            .last_queued_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Time spent in the current queue, moves restart it
    pub fn time_in_queue(&self) -> Duration {
        self.state
            .lock()
            .attached_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn busy_cursor(&self) -> usize {
        self.state.lock().busy_cursor
    }

    pub(crate) fn advance_busy_cursor(&self) -> usize {
        let mut state = self.state.lock();
        state.busy_cursor += 1;
        state.busy_cursor
    }

    /// The chain bound to this request, binding `default` if none is yet
    pub(crate) fn bind_busy_policy(&self, default: &Arc<BusyPolicyChain>) -> Arc<BusyPolicyChain> {
        let mut state = self.state.lock();
        state.busy_policy.get_or_insert_with(|| Arc::clone(default)).clone()
    }

    pub fn operator_hops(&self) -> u32 {
        self.state.lock().operator_hops
    }

    pub(crate) fn record_operator_hop(&self) {
        self.state.lock().operator_hops += 1;
    }

    pub fn operator_index(&self) -> Option<usize> {
        self.state.lock().operator_index
    }

    pub(crate) fn set_operator_index(&self, index: usize) {
        self.state.lock().operator_index = Some(index);
    }

    /// `operator_id` gave the request back unhandled and passes on its next offer
    pub(crate) fn decline_next_offer(&self, operator_id: &str) {
        let mut state = self.state.lock();
        if !state.declined_by.iter().any(|id| id == operator_id) {
            state.declined_by.push(operator_id.to_string());
        }
    }

    /// Consume a pending decline of `operator_id`
    pub(crate) fn take_declined(&self, operator_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.declined_by.iter().position(|id| id == operator_id) {
            Some(index) => {
                state.declined_by.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn operator(&self) -> Option<OperatorIdentity> {
        self.state.lock().operator.clone()
    }

    /// Record which operator took the request
    pub(crate) fn set_operator(&self, identity: OperatorIdentity) {
        {
            let mut state = self.state.lock();
            state.cdr.operator_id = Some(identity.id.clone());
            state.cdr.operator_person_id = identity.person_id.clone();
            state.cdr.operator_person_description = identity.person_description.clone();
            state.operator = Some(identity.clone());
        }
        self.add_to_log(format!("accepted by operator {}", identity.id));
    }

    pub(crate) fn operator_number_assigned(&self, number: &str) {
        let operator_id = self.state.lock().operator.as_ref().map(|op| op.id.clone());
        self.add_to_log(format!("inviting operator number {}", number));
        self.fire(RequestEventKind::OperatorAssigned { operator_id, number: number.to_string() });
    }

    /// An answering attempt asks whether it may bridge this request
    ///
    /// Only the first attempt wins; the others must abandon.
    pub(crate) fn try_claim(&self, attempt: &AttemptId) -> bool {
        if !self.is_valid() {
            return false;
        }
        {
            let mut state = self.state.lock();
            match &state.claimed_by {
                Some(owner) if owner != attempt => return false,
                Some(_) => return true,
                None => state.claimed_by = Some(attempt.clone()),
            }
        }
        self.fire(RequestEventKind::ReadyToCommutate);
        true
    }

    /// Give up a claim taken by `attempt`
    pub(crate) fn release_claim(&self, attempt: &AttemptId) {
        let mut state = self.state.lock();
        if state.claimed_by.as_ref() == Some(attempt) {
            state.claimed_by = None;
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.state.lock().claimed_by.is_some()
    }

    pub(crate) fn abonent_ready(&self) {
        self.fire(RequestEventKind::AbonentReady);
    }

    pub(crate) fn commutated(&self) {
        self.add_to_log("commutated");
        self.fire(RequestEventKind::Commutated);
    }

    pub(crate) fn mark_transferred(&self) {
        self.fire(RequestEventKind::Transferred);
    }

    /// Successful end of a bridged conversation
    pub(crate) fn disconnected(&self) {
        self.add_to_log("conversation finished");
        self.close(RequestEventKind::Disconnected);
        self.drop_validity();
    }

    /// The caller leg became unusable. Only the first call has any effect.
    pub fn invalidate(&self, reason: &str) {
        if self
            .valid
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("📴 Request {} invalidated: {}", self.id, reason);
        self.add_to_log(format!("invalidated: {}", reason));
        self.close(RequestEventKind::Disconnected);
        self.notify_invalidated();
    }

    /// Terminal rejection
    pub fn reject(&self, reason: &str) {
        info!("🚫 Request {} rejected: {}", self.id, reason);
        self.add_to_log(format!("rejected: {}", reason));
        self.close(RequestEventKind::Rejected { reason: reason.to_string() });
        self.drop_validity();
    }

    /// Append a timestamped line to the request's text log
    pub fn add_to_log(&self, message: impl AsRef<str>) {
        let line = format!("{} {}", Utc::now().format("%H:%M:%S%.3f"), message.as_ref());
        debug!("📝 {} {}", self.id, message.as_ref());
        self.state.lock().log.push(line);
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Current CDR contents
    pub fn cdr(&self) -> CallDetailRecord {
        self.state.lock().cdr.clone()
    }

    pub(crate) fn add_listener(&self, key: impl Into<String>, listener: Arc<dyn RecordListener>) {
        self.listeners.lock().push((key.into(), listener));
    }

    pub(crate) fn remove_listener(&self, key: &str) {
        self.listeners.lock().retain(|(k, _)| k != key);
    }

    /// Follow the caller leg: hangup or transfer invalidates the request
    pub(crate) fn watch_caller_leg(self: &Arc<Self>) {
        self.caller_leg.add_listener(Arc::new(CallerLegWatcher { record: Arc::downgrade(self) }));
        if !self.caller_leg.is_valid() {
            self.invalidate("caller conversation already invalid");
        }
    }

    fn close(&self, kind: RequestEventKind) {
        if self
            .terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Request {} already closed, ignoring {:?}", self.id, kind);
            return;
        }
        self.fire(kind);
    }

    fn drop_validity(&self) {
        if self
            .valid
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify_invalidated();
        }
    }

    fn notify_invalidated(&self) {
        let listeners: Vec<Arc<dyn RecordListener>> =
            self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener.on_request_invalidated(self.id);
        }
    }

    fn fire(&self, kind: RequestEventKind) {
        let now = Utc::now();
        let (event, snapshot) = {
            let mut state = self.state.lock();
            state.status = state.status.after(&kind);
            let was_closed = state.cdr.is_closed();
            let checkpoint = state.cdr.apply(&kind, now);
            if checkpoint.map(|c| c.is_terminal()).unwrap_or(false) {
                state.cdr.log = Some(state.log.join("\n"));
            }
            let queue_id = state.queue.as_ref().map(|q| q.id().to_string());
            if state.cdr.queue_id.is_none() {
                state.cdr.queue_id = queue_id.clone();
            }
            // Checkpoints after the terminal one are not published
            let snapshot = checkpoint
                .filter(|_| !was_closed)
                .map(|checkpoint| CdrSnapshot { checkpoint, record: state.cdr.clone() });
            (AcdEvent { request_id: self.id, queue_id, timestamp: now, kind }, snapshot)
        };
        self.publisher.publish(event, snapshot);
    }
}

impl std::fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .field("caller_leg", &self.caller_leg.id())
            .finish()
    }
}

struct CallerLegWatcher {
    record: Weak<RequestRecord>,
}

impl LegListener for CallerLegWatcher {
    fn on_leg_ready(&self, _leg: LegHandle) {}

    fn on_leg_stopped(&self, leg_id: &str) {
        if let Some(record) = self.record.upgrade() {
            record.invalidate(&format!("caller leg {} stopped", leg_id));
        }
    }

    fn on_leg_transferred(&self, leg_id: &str) {
        if let Some(record) = self.record.upgrade() {
            warn!("↪️ Caller leg {} of request {} transferred", leg_id, record.id());
            record.mark_transferred();
            record.invalidate(&format!("caller leg {} transferred", leg_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CollectingSink, StaticLeg};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    impl RecordListener for CountingListener {
        fn on_request_invalidated(&self, _request_id: RequestId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(sink: Arc<CollectingSink>) -> Arc<RequestRecord> {
        let (tx, _) = broadcast::channel(16);
        RequestRecord::new(RequestId(1), 5, "support", Arc::new(StaticLeg), vec![], EventPublisher::new(tx, sink))
    }

    fn terminal_count(sink: &CollectingSink) -> usize {
        sink.0.lock().iter().filter(|s| s.checkpoint.is_terminal()).count()
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let sink = Arc::new(CollectingSink::default());
        let record = record(sink.clone());
        let listener = Arc::new(CountingListener::default());
        record.add_listener("l", listener.clone());

        record.invalidate("hangup");
        record.invalidate("hangup again");

        assert!(!record.is_valid());
        assert_eq!(record.status(), RequestStatus::Disconnected);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert_eq!(terminal_count(&sink), 1);
    }

    #[test]
    fn test_reject_after_invalidate_keeps_single_terminal_cdr() {
        let sink = Arc::new(CollectingSink::default());
        let record = record(sink.clone());

        record.invalidate("hangup");
        record.reject("queue is full");

        assert_eq!(terminal_count(&sink), 1);
        let cdr = record.cdr();
        assert!(cdr.disconnected_time.is_some());
        assert!(cdr.rejected_time.is_none());
        assert_eq!(record.status(), RequestStatus::Disconnected);
        assert_eq!(record.publisher.terminal_totals(), (0, 1));
    }

    #[test]
    fn test_concurrent_terminal_paths_emit_once() {
        let sink = Arc::new(CollectingSink::default());
        let record = record(sink.clone());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let record = Arc::clone(&record);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        record.invalidate("hangup");
                    } else {
                        record.reject("busy");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(terminal_count(&sink), 1);
        let cdr = record.cdr();
        assert!(cdr.disconnected_time.is_some() ^ cdr.rejected_time.is_some());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let sink = Arc::new(CollectingSink::default());
        let record = record(sink.clone());
        let first = AttemptId::new();
        let second = AttemptId::new();

        assert!(record.try_claim(&first));
        assert!(!record.try_claim(&second));
        assert!(record.try_claim(&first));
        assert_eq!(record.status(), RequestStatus::ReadyToCommutate);

        record.release_claim(&first);
        assert!(record.try_claim(&second));

        let ready = sink
            .0
            .lock()
            .iter()
            .filter(|s| s.checkpoint == CdrCheckpoint::ReadyToCommutate)
            .count();
        assert_eq!(ready, 2);
    }

    #[test]
    fn test_terminal_cdr_carries_log() {
        let sink = Arc::new(CollectingSink::default());
        let record = record(sink.clone());

        record.add_to_log("first line");
        record.reject("no priority selector");

        let snapshots = sink.0.lock();
        let terminal = snapshots.iter().find(|s| s.checkpoint.is_terminal()).unwrap();
        let log = terminal.record.log.as_deref().unwrap();
        assert!(log.contains("first line"));
        assert!(log.contains("rejected: no priority selector"));
        assert_eq!(terminal.record.reject_reason.as_deref(), Some("no priority selector"));
    }

    #[test]
    fn test_priority_change_emits_only_on_change() {
        let sink = Arc::new(CollectingSink::default());
        let (tx, mut rx) = broadcast::channel(16);
        let record = RequestRecord::new(
            RequestId(9), 1, "q", Arc::new(StaticLeg), vec![], EventPublisher::new(tx, sink),
        );

        record.set_priority(1);
        record.set_priority(4);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, RequestEventKind::PriorityChanged { priority: 4 });
        assert!(rx.try_recv().is_err());
        assert_eq!(record.cdr().priority, 4);
    }

    #[test]
    fn test_declined_offer_is_consumed_once() {
        let record = record(Arc::new(CollectingSink::default()));

        record.decline_next_offer("op-1");
        record.decline_next_offer("op-1");

        assert!(!record.take_declined("op-2"));
        assert!(record.take_declined("op-1"));
        assert!(!record.take_declined("op-1"));
    }
}
