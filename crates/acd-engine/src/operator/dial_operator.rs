use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Operator, OperatorIdentity};
use crate::config::{DialMode, OperatorConfig};
use crate::dial::{AttemptOutcome, DialContext, DialManager, DialOwner, DialReport};
use crate::integration::TaskExecutorExt;
use crate::monitoring::OperatorStats;
use crate::request::RequestRecord;

#[derive(Debug)]
struct Availability {
    enabled: bool,
    active: usize,
    /// Set after a finished request for the retry delay or wrap-up period
    unavailable_until: Option<Instant>,
}

/// Operator that handles a request by dialling phone numbers
///
/// Numbers supplied with the request take precedence over the operator's own.
/// After a request it stays unavailable for the wrap-up period if the request was
/// handled, or for the retry delay if it was not. A request it gave back is
/// declined on its next offer, so the queue's busy policy sees it in between.
pub struct DialOperator {
    config: OperatorConfig,
    mode: DialMode,
    ctx: Arc<DialContext>,
    availability: Mutex<Availability>,
    stats: Mutex<OperatorStats>,
    self_ref: Weak<DialOperator>,
}

impl DialOperator {
    pub fn new(config: OperatorConfig, ctx: Arc<DialContext>) -> Arc<Self> {
        let mode = config.mode.unwrap_or(ctx.settings.default_mode);
        Arc::new_cyclic(|self_ref| Self {
            availability: Mutex::new(Availability {
                enabled: config.enabled,
                active: 0,
                unavailable_until: None,
            }),
            stats: Mutex::new(OperatorStats { operator_id: config.id.clone(), ..Default::default() }),
            config,
            mode,
            ctx,
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn mode(&self) -> DialMode {
        self.mode
    }

    pub fn identity(&self) -> OperatorIdentity {
        OperatorIdentity {
            id: self.config.id.clone(),
            person_id: self.config.person_id.clone(),
            person_description: self.config.person_description.clone(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        info!("👤 Operator {} {}", self.config.id, if enabled { "enabled" } else { "disabled" });
        self.availability.lock().enabled = enabled;
    }

    pub fn is_available(&self) -> bool {
        Self::can_take(&self.availability.lock(), self.config.max_concurrent_requests)
    }

    pub fn active_requests(&self) -> usize {
        self.availability.lock().active
    }

    fn can_take(availability: &Availability, max_concurrent: usize) -> bool {
        availability.enabled
            && availability.active < max_concurrent
            && availability
                .unavailable_until
                .map(|until| Instant::now() >= until)
                .unwrap_or(true)
    }

    /// Numbers to dial for `record`
    fn numbers_for(&self, record: &RequestRecord) -> Vec<String> {
        if record.operator_numbers().is_empty() {
            self.config.numbers.clone()
        } else {
            record.operator_numbers().to_vec()
        }
    }
}

impl Operator for DialOperator {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn try_accept(&self, record: &Arc<RequestRecord>) -> bool {
        let Some(me) = self.self_ref.upgrade() else {
            return false;
        };
        if record.take_declined(&self.config.id) {
            debug!("Operator {} passes on request {} it just gave back", self.config.id, record.id());
            return false;
        }
        {
            let mut availability = self.availability.lock();
            if !Self::can_take(&availability, self.config.max_concurrent_requests) {
                return false;
            }
            availability.active += 1;
            availability.unavailable_until = None;
        }
        self.stats.lock().accepted += 1;

        record.set_operator(self.identity());
        let numbers = self.numbers_for(record);
        debug!("Operator {} takes request {} ({} numbers)", self.config.id, record.id(), numbers.len());

        let owner: Arc<dyn DialOwner> = me;
        let manager = DialManager::new(Arc::clone(record), numbers, self.mode, owner, Arc::clone(&self.ctx));
        self.ctx.services.executor.spawn(async move {
            manager.commutate();
        });
        true
    }

    fn stats(&self) -> OperatorStats {
        let mut stats = self.stats.lock().clone();
        let availability = self.availability.lock();
        stats.enabled = availability.enabled;
        stats.active_requests = availability.active;
        stats.available = Self::can_take(&availability, self.config.max_concurrent_requests);
        stats
    }
}

impl DialOwner for DialOperator {
    fn dial_finished(&self, record: &Arc<RequestRecord>, report: DialReport) {
        if !report.handled && record.is_valid() {
            record.decline_next_offer(&self.config.id);
        }
        let pause = if report.handled {
            Duration::from_millis(self.config.wrap_up_ms)
        } else {
            Duration::from_millis(self.config.retry_delay_ms)
        };

        {
            let mut availability = self.availability.lock();
            availability.active = availability.active.saturating_sub(1);
            if !pause.is_zero() {
                availability.unavailable_until = Some(Instant::now() + pause);
            }
        }

        {
            let mut stats = self.stats.lock();
            if report.handled {
                stats.handled += 1;
            } else {
                stats.not_handled += 1;
            }
            for (_, outcome) in &report.outcomes {
                stats.attempts += 1;
                match outcome {
                    AttemptOutcome::NoFreeLine => stats.no_free_line += 1,
                    AttemptOutcome::NoAnswer => stats.no_answer += 1,
                    AttemptOutcome::Aborted => stats.aborted += 1,
                    AttemptOutcome::Handled | AttemptOutcome::Failed => {}
                }
            }
        }

        info!(
            "👤 Operator {} finished request {} (handled: {}, unavailable for {:?})",
            self.config.id,
            record.id(),
            report.handled,
            pause
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{dead_end_context as context, test_record};

    #[tokio::test]
    async fn test_capacity_and_disable() {
        let mut config = OperatorConfig::new("op-1", vec!["1001".into()]);
        config.max_concurrent_requests = 2;
        let operator = DialOperator::new(config, context());

        assert!(operator.try_accept(&test_record(1, 0)));
        assert!(operator.try_accept(&test_record(2, 0)));
        assert!(!operator.try_accept(&test_record(3, 0)));
        assert_eq!(operator.stats().accepted, 2);

        let idle = DialOperator::new(OperatorConfig::new("op-2", vec!["1002".into()]), context());
        idle.set_enabled(false);
        assert!(!idle.try_accept(&test_record(4, 0)));
        assert!(!idle.stats().available);
    }

    #[tokio::test]
    async fn test_acceptance_stamps_operator_identity() {
        let mut config = OperatorConfig::new("op-1", vec!["1001".into()]);
        config.person_id = Some("p-42".into());
        config.person_description = Some("Night shift".into());
        let operator = DialOperator::new(config, context());
        let record = test_record(1, 0);

        assert!(operator.try_accept(&record));
        let cdr = record.cdr();
        assert_eq!(cdr.operator_id.as_deref(), Some("op-1"));
        assert_eq!(cdr.operator_person_id.as_deref(), Some("p-42"));
        assert_eq!(cdr.operator_person_description.as_deref(), Some("Night shift"));
    }

    #[tokio::test]
    async fn test_retry_delay_after_failure() {
        let mut config = OperatorConfig::new("op-1", vec!["1001".into()]);
        config.retry_delay_ms = 60_000;
        let operator = DialOperator::new(config, context());
        let record = test_record(1, 0);

        operator.dial_finished(
            &record,
            DialReport { handled: false, outcomes: vec![("1001".into(), AttemptOutcome::NoFreeLine)] },
        );

        assert!(!operator.is_available());
        let stats = operator.stats();
        assert_eq!(stats.not_handled, 1);
        assert_eq!(stats.no_free_line, 1);
        assert_eq!(stats.attempts, 1);
    }

    #[tokio::test]
    async fn test_returned_request_is_declined_once() {
        let mut config = OperatorConfig::new("op-1", vec!["1001".into()]);
        config.max_concurrent_requests = 3;
        let operator = DialOperator::new(config, context());
        let record = test_record(1, 0);
        assert!(operator.try_accept(&record));

        operator.dial_finished(
            &record,
            DialReport { handled: false, outcomes: vec![("1001".into(), AttemptOutcome::NoFreeLine)] },
        );

        // No retry delay, yet the returned request is passed on once
        assert!(operator.is_available());
        assert!(!operator.try_accept(&record));
        assert!(operator.try_accept(&test_record(2, 0)));
        assert!(operator.try_accept(&record));
        assert_eq!(operator.stats().accepted, 3);
    }

    #[test]
    fn test_request_numbers_take_precedence() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = runtime.enter();
        let operator = DialOperator::new(OperatorConfig::new("op-1", vec!["1001".into()]), context());

        let own = test_record(1, 0);
        assert_eq!(operator.numbers_for(&own), vec!["1001".to_string()]);

        let supplied = RequestRecord::new(
            crate::request::RequestId(2),
            0,
            "support",
            Arc::new(crate::test_support::StaticLeg),
            vec!["2001".into(), "2002".into()],
            crate::test_support::test_publisher(),
        );
        assert_eq!(operator.numbers_for(&supplied), vec!["2001".to_string(), "2002".to_string()]);
    }
}
