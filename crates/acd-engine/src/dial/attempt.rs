use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::state::{AttemptId, AttemptOutcome, AttemptState};
use super::DialContext;
use crate::integration::{
    BridgeListener, InviteRequest, LegHandle, LegListener, LineHandle, TaskExecutorExt,
};
use crate::request::RequestRecord;

/// Told once when an attempt reaches its terminal state
pub trait AttemptObserver: Send + Sync {
    fn attempt_finished(&self, attempt_id: &AttemptId, outcome: AttemptOutcome);
}

/// Work to run once the state lock is released
enum Effect {
    AnnounceNumber,
    Invite,
    ArmInviteTimeout,
    /// Take the request; standing down when another attempt holds it
    Claim,
    AbonentReady,
    CreateBridge(LegHandle),
    Commutated,
    Disconnect,
    ReleaseClaim,
    Release { line: Option<LineHandle>, leg: Option<LegHandle> },
    Report(AttemptOutcome),
}

/// State to move on to right away, with its cause
type Cascade = Option<(AttemptState, Option<AttemptOutcome>)>;

struct AttemptInner {
    state: AttemptState,
    /// Every state entered, `>`-separated
    status: String,
    outcome: Option<AttemptOutcome>,
    line: Option<LineHandle>,
    operator_leg: Option<LegHandle>,
    bridge_id: Option<String>,
}

/// Dials one operator number for one request
///
/// All state changes go through a single mutex-guarded gate. Events that arrive
/// for a state the attempt already left are dropped, and a transition the state
/// table does not allow forces the attempt into `Invalid`, which is never left.
/// Request notifications, collaborator calls and timers run after the gate is
/// released; `serial` keeps them in transition order.
pub struct DialAttempt {
    id: AttemptId,
    number: String,
    record: Arc<RequestRecord>,
    observer: Weak<dyn AttemptObserver>,
    ctx: Arc<DialContext>,
    serial: Mutex<()>,
    inner: Mutex<AttemptInner>,
    self_ref: Weak<DialAttempt>,
}

impl DialAttempt {
    pub fn new(
        number: impl Into<String>,
        record: Arc<RequestRecord>,
        observer: Weak<dyn AttemptObserver>,
        ctx: Arc<DialContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: AttemptId::new(),
            number: number.into(),
            record,
            observer,
            ctx,
            serial: Mutex::new(()),
            inner: Mutex::new(AttemptInner {
                state: AttemptState::Init,
                status: AttemptState::Init.to_string(),
                outcome: None,
                line: None,
                operator_leg: None,
                bridge_id: None,
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> &AttemptId {
        &self.id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn state(&self) -> AttemptState {
        self.inner.lock().state
    }

    /// Trace of every state entered so far
    pub fn status(&self) -> String {
        self.inner.lock().status.clone()
    }

    pub fn outcome(&self) -> Option<AttemptOutcome> {
        self.inner.lock().outcome
    }

    pub fn bridge_id(&self) -> Option<String> {
        self.inner.lock().bridge_id.clone()
    }

    /// Begin by waiting for an operator line
    pub fn start(&self) {
        if !self.record.is_valid() {
            self.transition(&[AttemptState::Init], AttemptState::Invalid, Some(AttemptOutcome::Aborted));
            return;
        }

        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        let lines = Arc::clone(&self.ctx.services.lines);
        let wait = self.ctx.settings.line_wait_timeout;
        let priority = self.record.priority();
        let owner = format!("{}:{}", self.record.id(), self.number);
        self.ctx.services.executor.spawn(async move {
            let line = tokio::time::timeout(wait, lines.request_line(priority, &owner))
                .await
                .ok()
                .flatten();
            me.line_acquired(line);
        });
    }

    /// The request stopped being valid
    pub fn request_invalidated(&self) {
        self.spawn_with_self(|me| async move { me.leg_gone(AttemptOutcome::Aborted, AttemptOutcome::Aborted) });
    }

    fn line_acquired(&self, line: Option<LineHandle>) {
        let Some(line) = line else {
            self.transition(&[AttemptState::Init], AttemptState::NoFreeLine, None);
            return;
        };

        {
            let mut inner = self.inner.lock();
            if inner.state != AttemptState::Init {
                drop(inner);
                debug!("Line {} arrived after attempt {} moved on, releasing", line.id(), self.id);
                self.ctx.services.lines.release_line(line);
                return;
            }
            inner.line = Some(line);
        }
        self.transition(&[AttemptState::Init], AttemptState::Inviting, None);
    }

    fn operator_answered(&self, leg: LegHandle) {
        {
            let mut inner = self.inner.lock();
            if inner.state != AttemptState::Inviting {
                drop(inner);
                debug!("Late answer on {} for attempt {}, hanging up", leg.id(), self.id);
                self.ctx.services.executor.spawn(async move { leg.stop().await });
                return;
            }
            inner.operator_leg = Some(leg);
        }
        self.transition(&[AttemptState::Inviting], AttemptState::OperatorReady, None);
    }

    /// A leg or the bridge went away: a bridged call is finished, anything else failed
    fn leg_gone(&self, while_inviting: AttemptOutcome, otherwise: AttemptOutcome) {
        loop {
            let state = self.state();
            let (to, cause) = match state {
                AttemptState::Invalid => return,
                AttemptState::Commutated => (AttemptState::Handled, None),
                AttemptState::Inviting => (AttemptState::Invalid, Some(while_inviting)),
                _ => (AttemptState::Invalid, Some(otherwise)),
            };
            if self.transition(std::slice::from_ref(&state), to, cause) {
                return;
            }
        }
    }

    /// Move from one of `expected` to `to`
    ///
    /// Returns `false` when the attempt was not in an expected state, in which case
    /// nothing happens.
    fn transition(&self, expected: &[AttemptState], to: AttemptState, cause: Option<AttemptOutcome>) -> bool {
        let _serial = self.serial.lock();
        let mut expected = Some(expected);
        let mut target = to;
        let mut cause = cause;

        loop {
            let (effects, cascade) = {
                let mut inner = self.inner.lock();
                let from = inner.state;
                if from == AttemptState::Invalid {
                    return expected.is_none();
                }
                if let Some(expected) = expected.take() {
                    if !expected.contains(&from) {
                        debug!("Attempt {} ignoring stale {} -> {} event", self.id, from, target);
                        return false;
                    }
                }

                let next = if from.can_transition(target) {
                    target
                } else {
                    error!("❌ Attempt {} illegal transition {} -> {}", self.id, from, target);
                    inner.outcome.get_or_insert(AttemptOutcome::Failed);
                    AttemptState::Invalid
                };
                if let Some(cause) = cause.take() {
                    inner.outcome.get_or_insert(cause);
                }

                inner.state = next;
                inner.status.push('>');
                inner.status.push_str(&next.to_string());
                debug!("Attempt {} for {} ({}): {} -> {}", self.id, self.record.id(), self.number, from, next);

                Self::enter(&mut inner, next)
            };

            let stand_down = self.run(effects);
            match stand_down.or(cascade) {
                Some((next, outcome)) => {
                    target = next;
                    cause = outcome;
                }
                None => return true,
            }
        }
    }

    /// Entry actions; returns deferred effects and an immediate follow-up state
    fn enter(inner: &mut AttemptInner, state: AttemptState) -> (Vec<Effect>, Cascade) {
        match state {
            AttemptState::Init => (vec![], None),
            AttemptState::Inviting => (vec![Effect::AnnounceNumber, Effect::Invite, Effect::ArmInviteTimeout], None),
            AttemptState::NoFreeLine => (vec![], Some((AttemptState::Invalid, Some(AttemptOutcome::NoFreeLine)))),
            AttemptState::OperatorReady => (vec![Effect::Claim], None),
            AttemptState::AbonentReady => match inner.operator_leg.clone() {
                Some(leg) => (vec![Effect::AbonentReady, Effect::CreateBridge(leg)], None),
                None => (vec![], Some((AttemptState::Invalid, Some(AttemptOutcome::Failed)))),
            },
            AttemptState::Commutated => (vec![Effect::Commutated], None),
            AttemptState::Handled => {
                inner.outcome.get_or_insert(AttemptOutcome::Handled);
                (vec![Effect::Disconnect], Some((AttemptState::Invalid, None)))
            }
            AttemptState::Invalid => {
                let outcome = *inner.outcome.get_or_insert(AttemptOutcome::Failed);
                let mut effects = Vec::with_capacity(3);
                if !outcome.is_handled() {
                    effects.push(Effect::ReleaseClaim);
                }
                effects.push(Effect::Release { line: inner.line.take(), leg: inner.operator_leg.take() });
                effects.push(Effect::Report(outcome));
                (effects, None)
            }
        }
    }

    /// Run deferred effects; a lost claim returns the state to cascade into
    fn run(&self, effects: Vec<Effect>) -> Cascade {
        for effect in effects {
            match effect {
                Effect::AnnounceNumber => self.record.operator_number_assigned(&self.number),
                Effect::Invite => self.send_invite(),
                Effect::ArmInviteTimeout => {
                    let weak = self.self_ref.clone();
                    self.ctx.services.executor.spawn_delayed(self.ctx.settings.invite_timeout, async move {
                        if let Some(me) = weak.upgrade() {
                            if me.transition(
                                &[AttemptState::Inviting],
                                AttemptState::Invalid,
                                Some(AttemptOutcome::NoAnswer),
                            ) {
                                warn!("⏰ Operator number {} did not answer in time", me.number);
                            }
                        }
                    });
                }
                Effect::Claim => {
                    if !self.record.try_claim(&self.id) {
                        debug!("Request {} already taken, attempt {} stands down", self.record.id(), self.id);
                        return Some((AttemptState::Invalid, Some(AttemptOutcome::Aborted)));
                    }
                    info!("✅ Operator number {} answered request {}", self.number, self.record.id());
                    self.prepare_caller();
                }
                Effect::AbonentReady => self.record.abonent_ready(),
                Effect::CreateBridge(operator_leg) => {
                    let caller = Arc::clone(self.record.caller_leg());
                    let bridges = Arc::clone(&self.ctx.services.bridges);
                    self.spawn_with_self(move |me| async move {
                        let listener: Arc<dyn BridgeListener> = me.clone();
                        match bridges.create_bridge(caller, operator_leg, listener).await {
                            Ok(bridge_id) => {
                                debug!("🌉 Bridge {} created for request {}", bridge_id, me.record.id());
                                me.inner.lock().bridge_id = Some(bridge_id);
                            }
                            Err(e) => {
                                error!("❌ Failed to bridge request {}: {}", me.record.id(), e);
                                me.transition(
                                    &[AttemptState::AbonentReady],
                                    AttemptState::Invalid,
                                    Some(AttemptOutcome::Failed),
                                );
                            }
                        }
                    });
                }
                Effect::Commutated => self.record.commutated(),
                Effect::Disconnect => self.record.disconnected(),
                Effect::ReleaseClaim => self.record.release_claim(&self.id),
                Effect::Release { line, leg } => {
                    if let Some(line) = line {
                        self.ctx.services.lines.release_line(line);
                    }
                    if let Some(leg) = leg {
                        self.ctx.services.executor.spawn(async move { leg.stop().await });
                    }
                }
                Effect::Report(outcome) => {
                    if let Some(observer) = self.observer.upgrade() {
                        observer.attempt_finished(&self.id, outcome);
                    }
                }
            }
        }
        None
    }

    fn prepare_caller(&self) {
        let caller = Arc::clone(self.record.caller_leg());
        self.spawn_with_self(move |me| async move {
            match caller.ready_to_commutate().await {
                Ok(()) => {
                    me.transition(&[AttemptState::OperatorReady], AttemptState::AbonentReady, None);
                }
                Err(e) => {
                    warn!("⚠️ Caller leg of {} not ready: {}", me.record.id(), e);
                    me.transition(&[AttemptState::OperatorReady], AttemptState::Invalid, Some(AttemptOutcome::Aborted));
                }
            }
        });
    }

    fn send_invite(&self) {
        let mut bindings = HashMap::new();
        bindings.insert("request_id".to_string(), self.record.id().to_string());
        bindings.insert("caller_leg".to_string(), self.record.caller_leg().id().to_string());
        if let Some(queue_id) = self.record.queue_id() {
            bindings.insert("queue_id".to_string(), queue_id);
        }
        let request = InviteRequest {
            number: self.number.clone(),
            timeout_secs: self.ctx.settings.invite_timeout.as_secs().max(1),
            scenario: self.ctx.settings.scenario.clone(),
            bindings,
        };

        let legs = Arc::clone(&self.ctx.services.legs);
        self.spawn_with_self(move |me| async move {
            let listener: Arc<dyn LegListener> = me.clone();
            if let Err(e) = legs.invite(request, listener).await {
                warn!("⚠️ Invite to {} failed: {}", me.number, e);
                me.transition(&[AttemptState::Inviting], AttemptState::Invalid, Some(AttemptOutcome::NoAnswer));
            }
        });
    }

    /// Run `task` on the executor with a strong reference to this attempt
    fn spawn_with_self<F, Fut>(&self, task: F)
    where
        F: FnOnce(Arc<DialAttempt>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(me) = self.self_ref.upgrade() {
            self.ctx.services.executor.spawn(task(me));
        }
    }
}

impl LegListener for DialAttempt {
    fn on_leg_ready(&self, leg: LegHandle) {
        self.spawn_with_self(move |me| async move { me.operator_answered(leg) });
    }

    fn on_leg_stopped(&self, leg_id: &str) {
        debug!("Operator leg {} of attempt {} stopped", leg_id, self.id);
        self.spawn_with_self(|me| async move { me.leg_gone(AttemptOutcome::NoAnswer, AttemptOutcome::Aborted) });
    }

    fn on_leg_transferred(&self, leg_id: &str) {
        debug!("Operator leg {} of attempt {} transferred", leg_id, self.id);
        self.spawn_with_self(|me| async move { me.leg_gone(AttemptOutcome::Aborted, AttemptOutcome::Aborted) });
    }
}

impl BridgeListener for DialAttempt {
    fn on_bridge_activated(&self, bridge_id: &str) {
        debug!("🌉 Bridge {} active for attempt {}", bridge_id, self.id);
        self.spawn_with_self(|me| async move {
            me.transition(&[AttemptState::AbonentReady], AttemptState::Commutated, None);
        });
    }

    fn on_bridge_deactivated(&self, bridge_id: &str) {
        debug!("🌉 Bridge {} inactive for attempt {}", bridge_id, self.id);
        self.spawn_with_self(|me| async move { me.leg_gone(AttemptOutcome::Failed, AttemptOutcome::Failed) });
    }
}

impl std::fmt::Debug for DialAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialAttempt")
            .field("id", &self.id)
            .field("number", &self.number)
            .field("status", &self.status())
            .finish()
    }
}
