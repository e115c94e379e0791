use crate::core::config::{PollingConfig, PollingConfigPatch};
use crate::core::coordinator::FastPollingHint;
use crate::core::events::{ErrorContext, EventBus, SyncEvent};
use crate::core::lock;
use crate::core::model::{LogEntry, PollingMode, PollingState, Task};
use crate::remote::{RemoteError, TaskBackend};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Receives whatever the polling loops fetched. `sent_at` is when the
/// snapshot request went out. The returned hint tells the scheduler whether
/// the status cadence should change speed.
pub trait PollSink: Send + Sync {
    fn on_task_snapshot(&self, tasks: Vec<Task>, sent_at: Instant) -> FastPollingHint;
    fn on_logs(&self, logs: Vec<LogEntry>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
    TaskStatus,
    Logs,
}

impl Cadence {
    fn context(self) -> ErrorContext {
        match self {
            Self::TaskStatus => ErrorContext::TaskStatus,
            Self::Logs => ErrorContext::Logs,
        }
    }
}

struct SchedulerState {
    config: PollingConfig,
    polling: PollingState,
    /// Bumped on every start and stop; loops and in-flight results from an
    /// older generation are dropped.
    generation: u64,
    /// Generation whose backoff sleeper may still restart polling.
    resume_token: Option<u64>,
    disposed: bool,
}

struct Inner {
    backend: Arc<dyn TaskBackend>,
    sink: Arc<dyn PollSink>,
    bus: EventBus,
    log_limit: u32,
    state: Mutex<SchedulerState>,
    status_gate: tokio::sync::Mutex<()>,
    logs_gate: tokio::sync::Mutex<()>,
    status_rearm: Notify,
    logs_rearm: Notify,
}

/// Two independent cadences, task status and logs, each with at most one
/// request in flight. Consecutive failures across both are counted; past the
/// threshold polling suspends itself and comes back after the retry delay.
#[derive(Clone)]
pub struct PollingScheduler {
    inner: Arc<Inner>,
}

impl PollingScheduler {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        sink: Arc<dyn PollSink>,
        bus: EventBus,
        config: PollingConfig,
        log_limit: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                sink,
                bus,
                log_limit,
                state: Mutex::new(SchedulerState {
                    config,
                    polling: PollingState::default(),
                    generation: 0,
                    resume_token: None,
                    disposed: false,
                }),
                status_gate: tokio::sync::Mutex::new(()),
                logs_gate: tokio::sync::Mutex::new(()),
                status_rearm: Notify::new(),
                logs_rearm: Notify::new(),
            }),
        }
    }

    /// Fetches both streams right away, then keeps polling. A no-op while
    /// already running. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let generation = {
            let mut st = lock(&self.inner.state);
            if st.disposed || st.polling.running {
                return;
            }
            st.polling.running = true;
            st.generation += 1;
            st.resume_token = None;
            st.generation
        };
        info!(generation, backend = self.inner.backend.name(), "polling started");
        self.spawn_cadence(Cadence::TaskStatus, generation);
        self.spawn_cadence(Cadence::Logs, generation);
        self.inner.bus.emit(SyncEvent::Started);
    }

    /// Stops both cadences and cancels a pending backoff resume.
    pub fn stop(&self) {
        lock(&self.inner.state).resume_token = None;
        if self.halt() {
            info!("polling stopped");
            self.inner.bus.emit(SyncEvent::Stopped);
        }
    }

    pub(crate) fn dispose(&self) {
        lock(&self.inner.state).disposed = true;
        self.stop();
    }

    pub fn set_fast_polling(&self, enabled: bool) {
        let mode = if enabled { PollingMode::Fast } else { PollingMode::Normal };
        let interval = {
            let mut st = lock(&self.inner.state);
            if st.polling.mode == mode {
                return;
            }
            st.polling.mode = mode;
            status_interval(&st)
        };
        debug!(?mode, ?interval, "status cadence changed");
        self.inner.status_rearm.notify_waiters();
    }

    pub(crate) fn apply_hint(&self, hint: FastPollingHint) {
        match hint {
            FastPollingHint::Engage => self.set_fast_polling(true),
            FastPollingHint::Release => self.set_fast_polling(false),
            FastPollingHint::Keep => {}
        }
    }

    /// Merges the patch; when running, restarts so the new intervals apply
    /// from a clean slate.
    pub fn update_config(&self, patch: &PollingConfigPatch) {
        let running = {
            let mut st = lock(&self.inner.state);
            st.config.merge(patch);
            st.polling.running
        };
        debug!(?patch, "polling config updated");
        if running {
            self.stop();
            self.start();
        }
    }

    pub fn polling_state(&self) -> PollingState {
        lock(&self.inner.state).polling.clone()
    }

    pub fn config(&self) -> PollingConfig {
        lock(&self.inner.state).config.clone()
    }

    pub fn current_status_interval(&self) -> Duration {
        status_interval(&lock(&self.inner.state))
    }

    fn halt(&self) -> bool {
        {
            let mut st = lock(&self.inner.state);
            if !st.polling.running {
                return false;
            }
            st.polling.running = false;
            st.generation += 1;
        }
        self.inner.status_rearm.notify_waiters();
        self.inner.logs_rearm.notify_waiters();
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        let st = lock(&self.inner.state);
        st.polling.running && st.generation == generation
    }

    fn gate(&self, cadence: Cadence) -> &tokio::sync::Mutex<()> {
        match cadence {
            Cadence::TaskStatus => &self.inner.status_gate,
            Cadence::Logs => &self.inner.logs_gate,
        }
    }

    fn rearm(&self, cadence: Cadence) -> &Notify {
        match cadence {
            Cadence::TaskStatus => &self.inner.status_rearm,
            Cadence::Logs => &self.inner.logs_rearm,
        }
    }

    fn spawn_cadence(&self, cadence: Cadence, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move { this.run_cadence(cadence, generation).await });
    }

    async fn run_cadence(&self, cadence: Cadence, generation: u64) {
        loop {
            {
                let _in_flight = self.gate(cadence).lock().await;
                if !self.is_current(generation) {
                    return;
                }
                self.tick(cadence, generation).await;
            }
            if !self.wait_next(cadence, generation).await {
                debug!(?cadence, generation, "cadence loop exited");
                return;
            }
        }
    }

    /// Sleeps one interval, restarting the countdown whenever the cadence is
    /// re-armed. Returns false once the generation is over.
    async fn wait_next(&self, cadence: Cadence, generation: u64) -> bool {
        loop {
            let rearmed = self.rearm(cadence).notified();
            tokio::pin!(rearmed);
            let interval = {
                let st = lock(&self.inner.state);
                if !st.polling.running || st.generation != generation {
                    return false;
                }
                match cadence {
                    Cadence::TaskStatus => status_interval(&st),
                    Cadence::Logs => st.config.logs_interval(),
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => return self.is_current(generation),
                _ = &mut rearmed => {}
            }
        }
    }

    async fn tick(&self, cadence: Cadence, generation: u64) {
        match cadence {
            Cadence::TaskStatus => {
                let sent_at = Instant::now();
                let result = self.inner.backend.fetch_task_snapshot().await;
                if !self.is_current(generation) {
                    debug!("dropping task snapshot that arrived after stop");
                    return;
                }
                match result {
                    Ok(tasks) => {
                        self.record_success();
                        let hint = self.inner.sink.on_task_snapshot(tasks, sent_at);
                        self.apply_hint(hint);
                    }
                    Err(e) => self.record_failure(cadence, e),
                }
            }
            Cadence::Logs => {
                let result = self.inner.backend.fetch_recent_logs(self.inner.log_limit).await;
                if !self.is_current(generation) {
                    debug!("dropping logs that arrived after stop");
                    return;
                }
                match result {
                    Ok(logs) => {
                        self.record_success();
                        self.inner.sink.on_logs(logs);
                    }
                    Err(e) => self.record_failure(cadence, e),
                }
            }
        }
    }

    fn record_success(&self) {
        let mut st = lock(&self.inner.state);
        st.polling.failure_count = 0;
        st.polling.last_success = Some(Instant::now());
    }

    fn record_failure(&self, cadence: Cadence, err: RemoteError) {
        let context = cadence.context();
        let message = err.to_string();
        let failures = {
            let mut st = lock(&self.inner.state);
            st.polling.failure_count += 1;
            st.polling.failure_count
        };
        warn!(%context, failures, error = %message, "fetch failed");
        self.inner.bus.emit(SyncEvent::Error { context, message });

        let over = {
            let st = lock(&self.inner.state);
            st.polling.running && st.polling.failure_count > st.config.failure_threshold
        };
        if over {
            self.suspend();
        }
    }

    fn suspend(&self) {
        let (token, delay, failures) = {
            let mut st = lock(&self.inner.state);
            if !st.polling.running {
                return;
            }
            st.polling.running = false;
            st.generation += 1;
            st.resume_token = Some(st.generation);
            (st.generation, st.config.retry_delay(), st.polling.failure_count)
        };
        self.inner.status_rearm.notify_waiters();
        self.inner.logs_rearm.notify_waiters();
        warn!(failures, ?delay, "too many consecutive failures, suspending polling");
        self.inner.bus.emit(SyncEvent::Stopped);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let resume = {
                let mut st = lock(&this.inner.state);
                if st.resume_token == Some(token) && !st.disposed {
                    st.resume_token = None;
                    st.polling.failure_count = 0;
                    true
                } else {
                    false
                }
            };
            if resume {
                info!("resuming polling after backoff");
                this.start();
            }
        });
    }
}

fn status_interval(st: &SchedulerState) -> Duration {
    match st.polling.mode {
        PollingMode::Normal => st.config.task_status_interval(),
        PollingMode::Fast => st.config.fast_interval(),
    }
}
