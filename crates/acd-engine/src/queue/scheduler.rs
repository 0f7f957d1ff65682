use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::ordering::OrderedQueue;
use crate::error::{AcdError, Result};
use crate::monitoring::{QueueSnapshot, QueueStats, QueuedRequestInfo};
use crate::operator::{DispatchResult, OperatorDispatcher};
use crate::policy::BusyPolicyContext;
use crate::request::RequestRecord;

/// Messages understood by a queue scheduler
pub enum QueueCommand {
    /// Admit a request. `fresh` restarts its busy-policy wait clock.
    Enqueue { record: Arc<RequestRecord>, fresh: bool },
    /// A queued request changed priority
    Resort,
    Snapshot(oneshot::Sender<QueueSnapshot>),
    /// Reject everything still queued and stop
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Mailbox of a running queue scheduler
#[derive(Clone)]
pub struct QueueHandle {
    id: Arc<str>,
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle").field("id", &self.id).finish()
    }
}

impl QueueHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Admit a new or moved request
    pub fn enqueue(&self, record: Arc<RequestRecord>) -> Result<()> {
        self.send(QueueCommand::Enqueue { record, fresh: true })
    }

    /// Return a request after a failed dial; its wait clock keeps running
    pub fn requeue(&self, record: Arc<RequestRecord>) -> Result<()> {
        self.send(QueueCommand::Enqueue { record, fresh: false })
    }

    /// Ask the scheduler to restore order and positions
    pub(crate) fn request_resort(&self) {
        if self.send(QueueCommand::Resort).is_err() {
            debug!("Queue {} stopped, no resort", self.id);
        }
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueCommand::Snapshot(tx))?;
        rx.await
            .map_err(|_| AcdError::queue(format!("queue {} stopped", self.id)))
    }

    /// Stop the scheduler and wait until it has rejected its remaining requests
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(QueueCommand::Shutdown(Some(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, command: QueueCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| AcdError::queue(format!("queue {} stopped", self.id)))
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    dispatched: u64,
    moved: u64,
    rejected: u64,
}

/// Single-threaded owner of one queue
///
/// All mutations of the ordered list happen on the scheduler's task, driven by its
/// mailbox and a periodic tick. Each tick hands requests from the head to the
/// dispatcher until one has to stay.
pub struct QueueScheduler {
    handle: QueueHandle,
    queue: OrderedQueue<Arc<RequestRecord>>,
    dispatcher: OperatorDispatcher,
    policy_ctx: BusyPolicyContext,
    tick_interval: Duration,
    counters: QueueCounters,
}

impl QueueScheduler {
    /// Start a scheduler on the current runtime and return its handle
    pub fn spawn(
        id: impl Into<String>,
        max_size: usize,
        tick_interval: Duration,
        dispatcher: OperatorDispatcher,
        policy_ctx: BusyPolicyContext,
    ) -> QueueHandle {
        let id: String = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = QueueHandle { id: Arc::from(id.as_str()), tx };
        let scheduler = QueueScheduler {
            handle: handle.clone(),
            queue: OrderedQueue::new(max_size),
            dispatcher,
            policy_ctx,
            tick_interval,
            counters: QueueCounters::default(),
        };
        info!("📋 Starting queue scheduler {} (max size {})", id, max_size);
        tokio::spawn(scheduler.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueueCommand>) {
        let start = tokio::time::Instant::now() + self.tick_interval;
        let mut ticker = tokio::time::interval_at(start, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(QueueCommand::Enqueue { record, fresh }) => self.admit(record, fresh),
                    Some(QueueCommand::Resort) => self.resort(),
                    Some(QueueCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(QueueCommand::Shutdown(done)) => {
                        rx.close();
                        self.reject_all("shutdown");
                        while let Ok(command) = rx.try_recv() {
                            if let QueueCommand::Enqueue { record, .. } = command {
                                self.counters.rejected += 1;
                                record.reject("shutdown");
                            }
                        }
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick() => self.drain(),
            }
        }

        info!("🛑 Queue scheduler {} stopped", self.handle.id());
    }

    fn admit(&mut self, record: Arc<RequestRecord>, fresh: bool) {
        if !record.is_valid() {
            debug!("Dropping invalid request {} before queueing in {}", record.id(), self.handle.id());
            return;
        }
        if self.queue.contains(record.id()) {
            warn!("📞 Request {} already in queue {}, not re-queuing", record.id(), self.handle.id());
            return;
        }
        self.purge_invalid();

        record.attach_to_queue(self.handle.clone());
        let admitted_id = record.id();
        let evicted = self.queue.insert(Arc::clone(&record));

        match evicted {
            Some(evicted) if evicted.id() == admitted_id => {
                self.counters.rejected += 1;
                evicted.reject("queue is full");
            }
            Some(evicted) => {
                record.mark_queued(fresh);
                self.counters.rejected += 1;
                evicted.set_position(None);
                evicted.reject("queue is full");
            }
            None => record.mark_queued(fresh),
        }

        debug!("📊 Queue {} size: {} requests", self.handle.id(), self.queue.len());
        self.renumber();
    }

    /// Hand requests from the head to the dispatcher until one has to stay
    fn drain(&mut self) {
        let mut changed = self.queue.resort();
        changed |= self.purge_invalid();

        while let Some(head) = self.queue.head().cloned() {
            if !head.is_valid() {
                self.queue.pop_head();
                changed = true;
                continue;
            }

            match self.dispatcher.dispatch(&head, &self.policy_ctx) {
                DispatchResult::Accepted { operator_id } => {
                    self.queue.pop_head();
                    head.set_position(None);
                    self.counters.dispatched += 1;
                    info!("📤 Request {} from queue {} accepted by operator {}", head.id(), self.handle.id(), operator_id);
                }
                DispatchResult::Moved => {
                    self.queue.pop_head();
                    self.counters.moved += 1;
                }
                DispatchResult::Rejected(reason) => {
                    self.queue.pop_head();
                    head.set_position(None);
                    self.counters.rejected += 1;
                    head.reject(&reason);
                }
                DispatchResult::LeaveInQueue => break,
            }
            changed = true;
        }

        if changed {
            self.renumber();
        }
    }

    fn resort(&mut self) {
        if self.queue.resort() {
            debug!("Queue {} reordered after a priority change", self.handle.id());
            self.renumber();
        }
    }

    fn purge_invalid(&mut self) -> bool {
        let removed = self.queue.remove_where(|record| !record.is_valid());
        for record in &removed {
            debug!("Removed invalid request {} from queue {}", record.id(), self.handle.id());
        }
        !removed.is_empty()
    }

    fn renumber(&self) {
        for (index, record) in self.queue.iter().enumerate() {
            record.set_position(Some(index + 1));
        }
    }

    fn reject_all(&mut self, reason: &str) {
        let remaining = self.queue.drain_all();
        if !remaining.is_empty() {
            info!("🧹 Rejecting {} requests left in queue {}", remaining.len(), self.handle.id());
        }
        for record in remaining {
            self.counters.rejected += 1;
            record.reject(reason);
        }
    }

    fn snapshot(&mut self) -> QueueSnapshot {
        self.resort();
        let entries: Vec<QueuedRequestInfo> = self
            .queue
            .iter()
            .map(|record| QueuedRequestInfo {
                request_id: record.id(),
                priority: record.priority(),
                position: record.position(),
                status: record.status(),
                waiting_ms: record.time_in_queue().as_millis() as u64,
            })
            .collect();

        let total_requests = entries.len();
        let (average_wait_ms, longest_wait_ms) = if total_requests > 0 {
            let total: u64 = entries.iter().map(|e| e.waiting_ms).sum();
            let longest = entries.iter().map(|e| e.waiting_ms).max().unwrap_or(0);
            (total / total_requests as u64, longest)
        } else {
            (0, 0)
        };

        QueueSnapshot {
            queue_id: self.handle.id().to_string(),
            max_size: self.queue.max_size(),
            stats: QueueStats {
                queue_id: self.handle.id().to_string(),
                total_requests,
                average_wait_ms,
                longest_wait_ms,
                dispatched: self.counters.dispatched,
                moved: self.counters.moved,
                rejected: self.counters.rejected,
            },
            entries,
        }
    }
}
