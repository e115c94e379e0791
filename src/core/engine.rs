use crate::core::config::{PollingConfig, PollingConfigPatch, SyncConfig};
use crate::core::coordinator::{CommandError, ExecutionCoordinator, FastPollingHint, FastPollingPolicy};
use crate::core::events::{ErrorContext, EventBus, EventKind, SubscriptionId, SyncEvent};
use crate::core::lock;
use crate::core::model::*;
use crate::core::reconciler::Reconciler;
use crate::core::scheduler::{PollSink, PollingScheduler};
use crate::core::store::{spawn_writer, CacheUpdate, SqliteStore};
use crate::remote::{RemoteError, TaskBackend};
use anyhow::Context;
use std::cmp::Ordering as Chronology;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Newest delivered log timestamp plus the messages already delivered at
/// it. `at_cursor` is `None` for a cursor resumed from the cache; every entry
/// at that timestamp then counts as seen.
#[derive(Debug, Default)]
struct LogCursor {
    timestamp: Option<String>,
    at_cursor: Option<HashSet<String>>,
}

impl LogCursor {
    fn resumed(timestamp: Option<String>) -> Self {
        Self { timestamp, at_cursor: None }
    }

    fn is_new(&self, entry: &LogEntry) -> bool {
        let Some(seen) = self.timestamp.as_deref() else {
            return true;
        };
        match entry.timestamp.as_str().cmp(seen) {
            Chronology::Greater => true,
            Chronology::Equal => self.at_cursor.as_ref().is_some_and(|m| !m.contains(&entry.message)),
            Chronology::Less => false,
        }
    }

    /// Entries must be fed oldest first.
    fn advance(&mut self, entry: &LogEntry) {
        if self.timestamp.as_deref() == Some(entry.timestamp.as_str()) {
            self.at_cursor.get_or_insert_with(HashSet::new).insert(entry.message.clone());
        } else {
            self.timestamp = Some(entry.timestamp.clone());
            self.at_cursor = Some(HashSet::from([entry.message.clone()]));
        }
    }
}

/// Whether a snapshot sent at `sent_at` predates the command behind an
/// optimistic mark. `None` means the command has not been accepted yet.
fn predates(accepted: Option<Instant>, sent_at: Instant) -> bool {
    accepted.map_or(true, |at| sent_at < at)
}

/// State shared by the polling loops and the command paths.
pub(crate) struct EngineCore {
    backend: Arc<dyn TaskBackend>,
    bus: EventBus,
    polling: PollingConfig,
    mirror: Mutex<Reconciler>,
    policy: Mutex<FastPollingPolicy>,
    /// Orders under an optimistic running mark, with the instant the server
    /// accepted the command.
    optimistic: Mutex<HashMap<TaskOrder, Option<Instant>>>,
    log_cursor: Mutex<LogCursor>,
    cache: Option<mpsc::UnboundedSender<CacheUpdate>>,
    disposed: AtomicBool,
}

impl EngineCore {
    pub(crate) fn backend(&self) -> &dyn TaskBackend {
        &*self.backend
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    pub(crate) fn mirror(&self) -> &Mutex<Reconciler> {
        &self.mirror
    }

    pub(crate) fn policy(&self) -> &Mutex<FastPollingPolicy> {
        &self.policy
    }

    /// Shields freshly marked orders from snapshots until acceptance.
    pub(crate) fn hold_optimistic(&self, orders: &[TaskOrder]) {
        let mut guards = lock(&self.optimistic);
        for o in orders {
            guards.insert(*o, None);
        }
    }

    /// From now on only snapshots sent after `at` may overwrite the marks.
    pub(crate) fn accept_optimistic(&self, orders: &[TaskOrder], at: Instant) {
        let mut guards = lock(&self.optimistic);
        for o in orders {
            if let Some(accepted) = guards.get_mut(o) {
                *accepted = Some(at);
            }
        }
    }

    pub(crate) fn release_optimistic(&self, orders: &[TaskOrder]) {
        let mut guards = lock(&self.optimistic);
        for o in orders {
            guards.remove(o);
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<(), CommandError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(CommandError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Publishes the mirror after a local (optimistic) mutation.
    pub(crate) fn emit_mirror(&self) {
        let tasks = lock(&self.mirror).tasks().to_vec();
        self.bus.emit(SyncEvent::TaskUpdate { tasks });
    }

    /// Reconciles a snapshot into the mirror. Returns whether the mirror was
    /// replaced and what the fast-polling policy wants next. A disposed
    /// engine absorbs the call without touching anything.
    ///
    /// A task under an optimistic mark keeps its local copy when the
    /// snapshot was requested before the command was accepted.
    pub(crate) fn apply_snapshot(&self, mut tasks: Vec<Task>, sent_at: Instant) -> (bool, FastPollingHint) {
        if self.ensure_live().is_err() {
            return (false, FastPollingHint::Keep);
        }
        let (report, replaced) = {
            let mut mirror = lock(&self.mirror);
            {
                let mut guards = lock(&self.optimistic);
                if !guards.is_empty() {
                    for t in tasks.iter_mut() {
                        let stale = guards.get(&t.order).is_some_and(|at| predates(*at, sent_at));
                        if let Some(current) = mirror.get(t.order).filter(|_| stale) {
                            debug!(order = t.order, "keeping optimistic mark over an older snapshot");
                            *t = current.clone();
                        }
                    }
                    guards.retain(|_, at| predates(*at, sent_at));
                }
            }
            let report = mirror.reconcile(tasks);
            let replaced = report.changed.then(|| mirror.tasks().to_vec());
            (report, replaced)
        };

        if !report.dropped_selection.is_empty() {
            debug!(orders = ?report.dropped_selection, "selection pruned");
        }
        let changed = replaced.is_some();
        if let Some(tasks) = replaced {
            debug!(tasks = tasks.len(), "mirror replaced");
            self.send_cache(CacheUpdate::Tasks(tasks.clone()));
            self.bus.emit(SyncEvent::TaskUpdate { tasks });
        }
        for t in report.transitions {
            info!(order = t.order, from = %t.from, to = %t.to, "task status changed");
            self.bus.emit(SyncEvent::TaskStatusChanged { order: t.order, from: t.from, to: t.to, message: t.message });
        }

        let hint = lock(&self.policy).observe(&report.running, Instant::now());
        (changed, hint)
    }

    /// Emits only entries not delivered before, oldest first. An entry is
    /// identified by its timestamp and message.
    fn apply_logs(&self, mut logs: Vec<LogEntry>) {
        if self.ensure_live().is_err() {
            return;
        }
        logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let fresh: Vec<LogEntry> = {
            let mut cursor = lock(&self.log_cursor);
            logs.into_iter()
                .filter(|l| {
                    let new = cursor.is_new(l);
                    if new {
                        cursor.advance(l);
                    }
                    new
                })
                .collect()
        };
        let Some(newest) = fresh.last() else {
            return;
        };
        self.send_cache(CacheUpdate::LogCursor(newest.timestamp.clone()));
        self.bus.emit(SyncEvent::LogsUpdate { logs: fresh });
    }

    fn send_cache(&self, update: CacheUpdate) {
        if let Some(tx) = &self.cache {
            if tx.send(update).is_err() {
                warn!("mirror cache writer is gone");
            }
        }
    }
}

impl PollSink for EngineCore {
    fn on_task_snapshot(&self, tasks: Vec<Task>, sent_at: Instant) -> FastPollingHint {
        self.apply_snapshot(tasks, sent_at).1
    }

    fn on_logs(&self, logs: Vec<LogEntry>) {
        self.apply_logs(logs);
    }
}

/// One dashboard session: polls the remote scheduler, keeps the local task
/// mirror, and turns operator commands into remote calls.
///
/// Cheap to clone; every clone drives the same session. Must be used from
/// inside a tokio runtime.
#[derive(Clone)]
pub struct SyncEngine {
    core: Arc<EngineCore>,
    scheduler: PollingScheduler,
    coordinator: ExecutionCoordinator,
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn TaskBackend>, config: &SyncConfig) -> Self {
        Self::assemble(backend, config, Reconciler::new(), None, None)
    }

    /// Like `new`, but seeds the mirror and log cursor from the cache and
    /// keeps the cache current from then on.
    pub async fn with_cache(backend: Arc<dyn TaskBackend>, config: &SyncConfig, store: SqliteStore) -> anyhow::Result<Self> {
        let cached = store.load_mirror().await.context("load cached mirror")?;
        info!(tasks = cached.tasks.len(), saved_at = ?cached.saved_at, "seeded mirror from cache");

        let mut mirror = Reconciler::new();
        mirror.reconcile(cached.tasks);
        Ok(Self::assemble(backend, config, mirror, cached.log_cursor, Some(spawn_writer(store))))
    }

    fn assemble(
        backend: Arc<dyn TaskBackend>,
        config: &SyncConfig,
        mirror: Reconciler,
        log_cursor: Option<String>,
        cache: Option<mpsc::UnboundedSender<CacheUpdate>>,
    ) -> Self {
        let bus = EventBus::new(256);
        let core = Arc::new(EngineCore {
            backend: backend.clone(),
            bus: bus.clone(),
            polling: config.polling.clone(),
            mirror: Mutex::new(mirror),
            policy: Mutex::new(FastPollingPolicy::new(config.polling.running_ceiling())),
            optimistic: Mutex::new(HashMap::new()),
            log_cursor: Mutex::new(LogCursor::resumed(log_cursor)),
            cache,
            disposed: AtomicBool::new(false),
        });
        let sink: Arc<dyn PollSink> = core.clone();
        let scheduler = PollingScheduler::new(backend, sink, bus, config.polling.clone(), config.server.log_limit);
        let coordinator = ExecutionCoordinator::new(core.clone(), scheduler.clone());
        Self { core, scheduler, coordinator }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.core.bus.subscribe()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.core.bus.on(kind, callback)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.core.bus.off(id)
    }

    pub fn off_kind(&self, kind: EventKind) -> usize {
        self.core.bus.off_kind(kind)
    }

    // ---- lifecycle ----------------------------------------------------------

    pub fn start(&self) {
        if self.core.ensure_live().is_err() {
            warn!("start ignored: engine disposed");
            return;
        }
        self.scheduler.start();
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Stops polling for good and drops every callback. Idempotent.
    pub fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.dispose();
        self.core.bus.clear();
        info!("engine disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.core.ensure_live().is_err()
    }

    pub fn set_fast_polling(&self, enabled: bool) {
        self.scheduler.set_fast_polling(enabled);
    }

    pub fn update_config(&self, patch: &PollingConfigPatch) {
        self.scheduler.update_config(patch);
    }

    pub fn polling_state(&self) -> PollingState {
        self.scheduler.polling_state()
    }

    pub fn current_status_interval(&self) -> Duration {
        self.scheduler.current_status_interval()
    }

    // ---- mirror -------------------------------------------------------------

    /// Feeds a snapshot obtained elsewhere through the same path as a poll.
    pub fn reconcile(&self, tasks: Vec<Task>) -> bool {
        let (changed, hint) = self.core.apply_snapshot(tasks, Instant::now());
        self.scheduler.apply_hint(hint);
        changed
    }

    pub fn tasks(&self) -> Vec<Task> {
        lock(&self.core.mirror).tasks().to_vec()
    }

    pub fn task(&self, order: TaskOrder) -> Option<Task> {
        lock(&self.core.mirror).get(order).cloned()
    }

    pub fn task_stats(&self) -> TaskStats {
        TaskStats::of(lock(&self.core.mirror).tasks())
    }

    pub fn categories(&self) -> Vec<String> {
        lock(&self.core.mirror).categories()
    }

    pub fn is_fast_polling(&self) -> bool {
        lock(&self.core.policy).is_active()
    }

    // ---- selection ----------------------------------------------------------

    pub fn select(&self, order: TaskOrder) -> bool {
        lock(&self.core.mirror).select(order)
    }

    pub fn unselect(&self, order: TaskOrder) -> bool {
        lock(&self.core.mirror).unselect(order)
    }

    pub fn toggle_selection(&self, order: TaskOrder) -> bool {
        lock(&self.core.mirror).toggle(order)
    }

    pub fn select_all(&self) {
        lock(&self.core.mirror).select_all();
    }

    pub fn clear_selection(&self) {
        lock(&self.core.mirror).clear_selection();
    }

    pub fn selection(&self) -> Vec<TaskOrder> {
        lock(&self.core.mirror).selection()
    }

    pub fn selected_tasks(&self) -> Vec<Task> {
        lock(&self.core.mirror).selected_tasks()
    }

    // ---- commands -----------------------------------------------------------

    pub async fn execute_task(&self, order: TaskOrder) -> Result<ExecuteAck, CommandError> {
        self.require_known(&[order])?;
        self.coordinator.execute_task(order).await
    }

    pub async fn execute_batch(&self, orders: &[TaskOrder]) -> Result<BatchResults, CommandError> {
        self.require_known(orders)?;
        self.coordinator.execute_batch(orders).await
    }

    /// Runs the current selection as one batch and clears it once accepted.
    pub async fn execute_selected(&self) -> Result<BatchResults, CommandError> {
        let orders = self.selection();
        let results = self.execute_batch(&orders).await?;
        self.clear_selection();
        Ok(results)
    }

    pub async fn refresh(&self) -> Result<(), CommandError> {
        self.coordinator.refresh().await
    }

    /// Returns the order the server assigned, as seen by the follow-up
    /// refresh. Falls back to the local placeholder's order when the refresh
    /// does not show the new task.
    pub async fn add_task(&self, draft: TaskDraft) -> Result<TaskOrder, CommandError> {
        self.core.ensure_live()?;
        self.command(self.core.backend().add_task(&draft).await)?;

        let (url, save_dir) = (draft.url.clone(), draft.save_dir.clone());
        let mut placeholder = Task::new(0, TaskStatus::Normal);
        placeholder.url = Some(draft.url);
        placeholder.save_dir = Some(draft.save_dir);
        placeholder.name = draft.name;
        placeholder.category = draft.category;
        placeholder.cron = draft.cron;
        let provisional = lock(&self.core.mirror).insert_optimistic(placeholder);
        self.core.emit_mirror();

        self.refresh_after_command().await;
        let order = lock(&self.core.mirror)
            .tasks()
            .iter()
            .rev()
            .find(|t| t.url.as_deref() == Some(url.as_str()) && t.save_dir.as_deref() == Some(save_dir.as_str()))
            .map_or(provisional, |t| t.order);
        info!(order, provisional, "task added");
        Ok(order)
    }

    pub async fn update_task(&self, order: TaskOrder, patch: TaskPatch) -> Result<(), CommandError> {
        self.require_known(&[order])?;
        self.command(self.core.backend().update_task(order, &patch).await)?;
        info!(order, "task updated");
        self.refresh_after_command().await;
        Ok(())
    }

    pub async fn delete_task(&self, order: TaskOrder) -> Result<(), CommandError> {
        self.require_known(&[order])?;
        self.command(self.core.backend().delete_task(order).await)?;
        lock(&self.core.mirror).unselect(order);
        info!(order, "task deleted");
        self.refresh_after_command().await;
        Ok(())
    }

    pub async fn delete_batch(&self, orders: &[TaskOrder]) -> Result<(), CommandError> {
        if orders.is_empty() {
            return Err(CommandError::EmptyBatch);
        }
        self.require_known(orders)?;
        self.command(self.core.backend().delete_batch(orders).await)?;
        {
            let mut mirror = lock(&self.core.mirror);
            for o in orders {
                mirror.unselect(*o);
            }
        }
        info!(count = orders.len(), "tasks deleted");
        self.refresh_after_command().await;
        Ok(())
    }

    pub async fn move_task(&self, order: TaskOrder, new_index: u32) -> Result<(), CommandError> {
        self.require_known(&[order])?;
        self.command(self.core.backend().move_task(order, new_index).await)?;
        info!(order, new_index, "task moved");
        self.refresh_after_command().await;
        Ok(())
    }

    fn require_known(&self, orders: &[TaskOrder]) -> Result<(), CommandError> {
        self.core.ensure_live()?;
        let mirror = lock(&self.core.mirror);
        match orders.iter().find(|o| mirror.get(**o).is_none()) {
            Some(o) => Err(CommandError::UnknownTask(*o)),
            None => Ok(()),
        }
    }

    fn command(&self, result: Result<(), RemoteError>) -> Result<(), CommandError> {
        result.map_err(|source| {
            let message = source.to_string();
            error!(error = %message, "command rejected");
            self.core.bus.emit(SyncEvent::Error { context: ErrorContext::Command, message });
            CommandError::Remote { context: ErrorContext::Command, source }
        })
    }

    /// The command already succeeded; a failed follow-up refresh is reported
    /// as an error event and otherwise left to the next poll.
    async fn refresh_after_command(&self) {
        if let Err(e) = self.coordinator.refresh().await {
            warn!(error = %e, "refresh after command failed");
        }
    }
}
