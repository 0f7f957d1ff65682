use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::attempt::{AttemptObserver, DialAttempt};
use super::state::{AttemptId, AttemptOutcome};
use super::DialContext;
use crate::config::DialMode;
use crate::integration::TaskExecutorExt;
use crate::request::{RecordListener, RequestId, RequestRecord};

/// Summary handed to the operator when a manager is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialReport {
    pub handled: bool,
    /// Outcome per dialled number, in completion order
    pub outcomes: Vec<(String, AttemptOutcome)>,
}

/// The party that started a dial manager
pub trait DialOwner: Send + Sync {
    fn dial_finished(&self, record: &Arc<RequestRecord>, report: DialReport);
}

struct ManagerState {
    live: HashMap<AttemptId, Arc<DialAttempt>>,
    next_index: usize,
    finished: bool,
    outcomes: Vec<(String, AttemptOutcome)>,
}

/// Walks one request's operator numbers until one of them handles it
///
/// In sequential mode the next number is dialled only after the previous attempt
/// failed. In parallel mode the first number is dialled at once and the rest after
/// the configured delay, unless an operator has answered by then; an early failure
/// of the first attempt launches the rest immediately.
///
/// When the last attempt ends without handling the request and the request is
/// still valid, it goes back to the queue it came from.
pub struct DialManager {
    key: String,
    record: Arc<RequestRecord>,
    numbers: Vec<String>,
    mode: DialMode,
    owner: Arc<dyn DialOwner>,
    ctx: Arc<DialContext>,
    handled: AtomicBool,
    state: Mutex<ManagerState>,
    self_ref: Weak<DialManager>,
}

impl DialManager {
    pub fn new(
        record: Arc<RequestRecord>,
        numbers: Vec<String>,
        mode: DialMode,
        owner: Arc<dyn DialOwner>,
        ctx: Arc<DialContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            key: format!("dial-manager-{}", uuid::Uuid::new_v4()),
            record,
            numbers,
            mode,
            owner,
            ctx,
            handled: AtomicBool::new(false),
            state: Mutex::new(ManagerState {
                live: HashMap::new(),
                next_index: 0,
                finished: false,
                outcomes: Vec::new(),
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub fn record(&self) -> &Arc<RequestRecord> {
        &self.record
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Attempts still running
    pub fn live_attempts(&self) -> Vec<Arc<DialAttempt>> {
        self.state.lock().live.values().cloned().collect()
    }

    /// Start dialling
    pub fn commutate(&self) {
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        self.record.add_listener(self.key.clone(), me);

        info!(
            "📞 Dialling {} number(s) for request {} ({:?})",
            self.numbers.len(),
            self.record.id(),
            self.mode
        );

        let first = {
            let mut state = self.state.lock();
            self.create_attempt(&mut state)
        };
        match first {
            Some(attempt) => attempt.start(),
            None => {
                self.finish_if_idle();
                return;
            }
        }

        if let Some(delay) = self.mode.parallel_delay() {
            if self.numbers.len() > 1 {
                let weak = self.self_ref.clone();
                self.ctx.services.executor.spawn_delayed(delay, async move {
                    if let Some(me) = weak.upgrade() {
                        me.launch_remaining();
                    }
                });
            }
        }
    }

    fn create_attempt(&self, state: &mut ManagerState) -> Option<Arc<DialAttempt>> {
        let number = self.numbers.get(state.next_index)?;
        state.next_index += 1;
        let observer: Weak<dyn AttemptObserver> = self.self_ref.clone();
        let attempt = DialAttempt::new(number.clone(), Arc::clone(&self.record), observer, Arc::clone(&self.ctx));
        state.live.insert(attempt.id().clone(), Arc::clone(&attempt));
        Some(attempt)
    }

    fn may_dial_more(&self, state: &ManagerState) -> bool {
        !state.finished && !self.is_handled() && self.record.is_valid()
    }

    /// Parallel fan-out once the delay elapsed
    fn launch_remaining(&self) {
        let attempts = {
            let mut state = self.state.lock();
            if !self.may_dial_more(&state) || self.record.is_claimed() {
                debug!("Request {} needs no parallel fan-out", self.record.id());
                Vec::new()
            } else {
                std::iter::from_fn(|| self.create_attempt(&mut state)).collect::<Vec<_>>()
            }
        };
        for attempt in attempts {
            attempt.start();
        }
    }

    fn finish_if_idle(&self) {
        let done = {
            let mut state = self.state.lock();
            if state.finished || !state.live.is_empty() {
                false
            } else {
                state.finished = true;
                true
            }
        };
        if done {
            self.complete();
        }
    }

    fn complete(&self) {
        self.record.remove_listener(&self.key);

        let handled = self.is_handled();
        let outcomes = self.state.lock().outcomes.clone();
        info!("🏁 Dialling for request {} done (handled: {})", self.record.id(), handled);
        self.owner.dial_finished(&self.record, DialReport { handled, outcomes });

        if handled || !self.record.is_valid() {
            return;
        }

        self.record.add_to_log("no operator number answered, returning to queue");
        match self.record.queue() {
            Some(queue) => {
                if let Err(e) = queue.requeue(Arc::clone(&self.record)) {
                    warn!("⚠️ Cannot return request {} to its queue: {}", self.record.id(), e);
                    self.record.reject("queue stopped");
                }
            }
            None => self.record.reject("no queue to return to"),
        }
    }
}

impl AttemptObserver for DialManager {
    fn attempt_finished(&self, attempt_id: &AttemptId, outcome: AttemptOutcome) {
        if outcome.is_handled() {
            self.handled.store(true, Ordering::Release);
        }

        let (next, done) = {
            let mut state = self.state.lock();
            let number = state
                .live
                .remove(attempt_id)
                .map(|attempt| attempt.number().to_string())
                .unwrap_or_default();
            debug!("Attempt {} on {} for request {} ended: {:?}", attempt_id, number, self.record.id(), outcome);
            state.outcomes.push((number, outcome));

            let mut next = Vec::new();
            if self.may_dial_more(&state) {
                match self.mode {
                    DialMode::Sequential => {
                        if state.live.is_empty() {
                            next.extend(self.create_attempt(&mut state));
                        }
                    }
                    DialMode::ParallelAfterDelay { .. } => {
                        next.extend(std::iter::from_fn(|| self.create_attempt(&mut state)));
                    }
                }
            }

            let done = !state.finished && state.live.is_empty();
            if done {
                state.finished = true;
            }
            (next, done)
        };

        for attempt in next {
            attempt.start();
        }
        if done {
            self.complete();
        }
    }
}

impl RecordListener for DialManager {
    fn on_request_invalidated(&self, request_id: RequestId) {
        let attempts = self.live_attempts();
        debug!("Request {} invalidated, notifying {} attempt(s)", request_id, attempts.len());
        for attempt in attempts {
            attempt.request_invalidated();
        }
    }
}
