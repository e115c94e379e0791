use crate::core::engine::EngineCore;
use crate::core::events::{ErrorContext, SyncEvent};
use crate::core::lock;
use crate::core::model::{BatchResults, ExecuteAck, TaskOrder};
use crate::core::reconciler::PriorState;
use crate::core::scheduler::PollingScheduler;
use crate::remote::RemoteError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Message shown on a task between the click and the first confirming poll.
pub const EXECUTING_MESSAGE: &str = "executing...";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("engine has been disposed")]
    Disposed,

    #[error("no task selected")]
    EmptyBatch,

    #[error("task {0} is not in the local mirror")]
    UnknownTask(TaskOrder),

    #[error("{context} failed: {source}")]
    Remote {
        context: ErrorContext,
        #[source]
        source: RemoteError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPollingHint {
    Engage,
    Release,
    Keep,
}

/// Decides when the status cadence runs fast.
///
/// Fast polling stays on while any task is observed running (each for at
/// most `ceiling` since it was first seen) or while the dwell window opened
/// by the last accepted command is still open. It is released only when
/// both have lapsed.
#[derive(Debug)]
pub struct FastPollingPolicy {
    active: bool,
    dwell_until: Option<Instant>,
    engaged: HashMap<TaskOrder, Instant>,
    expired: HashSet<TaskOrder>,
    ceiling: Duration,
}

impl FastPollingPolicy {
    pub fn new(ceiling: Duration) -> Self {
        Self { active: false, dwell_until: None, engaged: HashMap::new(), expired: HashSet::new(), ceiling }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn dwell_remaining(&self, now: Instant) -> Option<Duration> {
        self.dwell_until.and_then(|u| u.checked_duration_since(now)).filter(|d| !d.is_zero())
    }

    pub fn on_command(&mut self, orders: &[TaskOrder], cooldown: Duration, now: Instant) -> FastPollingHint {
        let until = now + cooldown;
        self.dwell_until = Some(self.dwell_until.map_or(until, |u| u.max(until)));
        for o in orders {
            self.expired.remove(o);
            self.engaged.insert(*o, now);
        }
        self.decide(now)
    }

    pub fn observe(&mut self, running: &BTreeSet<TaskOrder>, now: Instant) -> FastPollingHint {
        self.engaged.retain(|o, _| running.contains(o));
        self.expired.retain(|o| running.contains(o));
        for o in running {
            if !self.expired.contains(o) {
                self.engaged.entry(*o).or_insert(now);
            }
        }
        self.reevaluate(now)
    }

    pub fn reevaluate(&mut self, now: Instant) -> FastPollingHint {
        let ceiling = self.ceiling;
        let stuck: Vec<TaskOrder> = self
            .engaged
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= ceiling)
            .map(|(o, _)| *o)
            .collect();
        for o in stuck {
            warn!(order = o, ?ceiling, "task still running past the fast-polling ceiling, no longer tracking it");
            self.engaged.remove(&o);
            self.expired.insert(o);
        }
        self.decide(now)
    }

    fn decide(&mut self, now: Instant) -> FastPollingHint {
        let dwelling = self.dwell_until.is_some_and(|u| now < u);
        let wanted = dwelling || !self.engaged.is_empty();
        match (wanted, self.active) {
            (true, false) => {
                self.active = true;
                FastPollingHint::Engage
            }
            (false, true) => {
                self.active = false;
                self.dwell_until = None;
                FastPollingHint::Release
            }
            _ => FastPollingHint::Keep,
        }
    }
}

/// Bridges operator commands to their observation through polling: marks
/// tasks optimistically, fires the remote call, and raises the status
/// cadence until the effect has been seen.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    core: Arc<EngineCore>,
    scheduler: PollingScheduler,
}

impl ExecutionCoordinator {
    pub(crate) fn new(core: Arc<EngineCore>, scheduler: PollingScheduler) -> Self {
        Self { core, scheduler }
    }

    pub async fn execute_task(&self, order: TaskOrder) -> Result<ExecuteAck, CommandError> {
        self.core.ensure_live()?;
        let priors = self.mark_running(&[order]);
        info!(order, "executing task");

        match self.core.backend().execute_task(order).await {
            Ok(ack) => {
                self.core.accept_optimistic(&[order], Instant::now());
                self.engage(&[order], self.core.polling().execute_cooldown());
                Ok(ack)
            }
            Err(source) => Err(self.reject(ErrorContext::Execute, &priors, source)),
        }
    }

    /// Per-task outcomes only arrive in the acceptance response, so a full
    /// refresh follows to bring the mirror in line with them.
    pub async fn execute_batch(&self, orders: &[TaskOrder]) -> Result<BatchResults, CommandError> {
        self.core.ensure_live()?;
        if orders.is_empty() {
            return Err(CommandError::EmptyBatch);
        }
        let priors = self.mark_running(orders);
        info!(count = orders.len(), "executing batch");

        match self.core.backend().execute_batch(orders).await {
            Ok(results) => {
                info!(
                    success = results.success.len(),
                    skipped = results.skipped.len(),
                    failed = results.failed.len(),
                    "batch accepted"
                );
                self.core.accept_optimistic(orders, Instant::now());
                self.engage(orders, self.core.polling().batch_cooldown());
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "refresh after batch failed");
                }
                Ok(results)
            }
            Err(source) => Err(self.reject(ErrorContext::BatchExecute, &priors, source)),
        }
    }

    /// Full snapshot fetch outside the polling cadence. Failures are
    /// reported but never feed the backoff counter.
    pub async fn refresh(&self) -> Result<(), CommandError> {
        self.core.ensure_live()?;
        let sent_at = Instant::now();
        match self.core.backend().fetch_task_snapshot().await {
            Ok(tasks) => {
                let (_, hint) = self.core.apply_snapshot(tasks, sent_at);
                self.scheduler.apply_hint(hint);
                Ok(())
            }
            Err(source) => {
                self.core.bus().emit(SyncEvent::Error { context: ErrorContext::Refresh, message: source.to_string() });
                Err(CommandError::Remote { context: ErrorContext::Refresh, source })
            }
        }
    }

    fn mark_running(&self, orders: &[TaskOrder]) -> Vec<PriorState> {
        let priors: Vec<PriorState> = {
            let mut mirror = lock(self.core.mirror());
            orders.iter().filter_map(|o| mirror.mark_running(*o, EXECUTING_MESSAGE)).collect()
        };
        if !priors.is_empty() {
            let marked: Vec<TaskOrder> = priors.iter().map(|p| p.order).collect();
            self.core.hold_optimistic(&marked);
            self.core.emit_mirror();
        }
        priors
    }

    fn engage(&self, orders: &[TaskOrder], cooldown: Duration) {
        let hint = lock(self.core.policy()).on_command(orders, cooldown, Instant::now());
        self.scheduler.apply_hint(hint);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if this.core.ensure_live().is_err() {
                return;
            }
            let hint = lock(this.core.policy()).reevaluate(Instant::now());
            this.scheduler.apply_hint(hint);
        });
    }

    fn reject(&self, context: ErrorContext, priors: &[PriorState], source: RemoteError) -> CommandError {
        let marked: Vec<TaskOrder> = priors.iter().map(|p| p.order).collect();
        self.core.release_optimistic(&marked);
        let restored = {
            let mut mirror = lock(self.core.mirror());
            priors.iter().filter(|p| mirror.restore(p)).count()
        };
        if restored > 0 {
            self.core.emit_mirror();
        }
        let message = source.to_string();
        error!(%context, error = %message, "command rejected");
        self.core.bus().emit(SyncEvent::Error { context, message });
        CommandError::Remote { context, source }
    }
}
