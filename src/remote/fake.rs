//! Scripted in-memory backend shared by the engine tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::lock;
use crate::core::model::{BatchResults, ExecuteAck, LogEntry, Task, TaskDraft, TaskOrder, TaskPatch, TaskStatus};
use crate::remote::{RemoteError, TaskBackend};

pub type Scripted<T> = Result<T, String>;

#[derive(Default)]
struct FakeState {
    snapshot: Vec<Task>,
    snapshot_script: VecDeque<Scripted<Vec<Task>>>,
    snapshot_errors: VecDeque<RemoteError>,
    snapshot_delay: Duration,
    logs: Vec<LogEntry>,
    log_script: VecDeque<Scripted<Vec<LogEntry>>>,
    execute_script: VecDeque<Scripted<ExecuteAck>>,
    batch_script: VecDeque<Scripted<BatchResults>>,
    reject_commands: Option<String>,
    executed: Vec<TaskOrder>,
    batches: Vec<Vec<TaskOrder>>,
    added: Vec<TaskDraft>,
    updated: Vec<(TaskOrder, TaskPatch)>,
    deleted: Vec<TaskOrder>,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    snapshot_calls: AtomicUsize,
    log_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub fn task(order: TaskOrder, status: TaskStatus) -> Task {
    Task::new(order, status)
}

pub fn log(timestamp: &str, message: &str) -> LogEntry {
    LogEntry {
        timestamp: timestamp.to_string(),
        level: "INFO".to_string(),
        message: message.to_string(),
        module: None,
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer served whenever the snapshot script is empty.
    pub fn set_snapshot(&self, tasks: Vec<Task>) {
        lock(&self.state).snapshot = tasks;
    }

    pub fn push_snapshot(&self, reply: Scripted<Vec<Task>>) {
        lock(&self.state).snapshot_script.push_back(reply);
    }

    /// Fails the next snapshot fetch with exactly this error.
    pub fn fail_next_snapshot(&self, err: RemoteError) {
        lock(&self.state).snapshot_errors.push_back(err);
    }

    pub fn set_snapshot_delay(&self, delay: Duration) {
        lock(&self.state).snapshot_delay = delay;
    }

    pub fn set_logs(&self, logs: Vec<LogEntry>) {
        lock(&self.state).logs = logs;
    }

    pub fn push_logs(&self, reply: Scripted<Vec<LogEntry>>) {
        lock(&self.state).log_script.push_back(reply);
    }

    pub fn push_execute(&self, reply: Scripted<ExecuteAck>) {
        lock(&self.state).execute_script.push_back(reply);
    }

    pub fn push_batch(&self, reply: Scripted<BatchResults>) {
        lock(&self.state).batch_script.push_back(reply);
    }

    pub fn reject_commands(&self, message: &str) {
        lock(&self.state).reject_commands = Some(message.to_string());
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_snapshots(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<TaskOrder> {
        lock(&self.state).executed.clone()
    }

    pub fn batches(&self) -> Vec<Vec<TaskOrder>> {
        lock(&self.state).batches.clone()
    }

    pub fn added(&self) -> Vec<TaskDraft> {
        lock(&self.state).added.clone()
    }

    pub fn updated(&self) -> Vec<(TaskOrder, TaskPatch)> {
        lock(&self.state).updated.clone()
    }

    pub fn deleted(&self) -> Vec<TaskOrder> {
        lock(&self.state).deleted.clone()
    }

    fn command_result(&self) -> Result<(), RemoteError> {
        match &lock(&self.state).reject_commands {
            Some(m) => Err(RemoteError::Rejected(m.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TaskBackend for FakeBackend {
    fn name(&self) -> &'static str { "fake-backend" }

    async fn fetch_task_snapshot(&self) -> Result<Vec<Task>, RemoteError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = lock(&self.state).snapshot_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut st = lock(&self.state);
            match st.snapshot_errors.pop_front() {
                Some(err) => Err(err),
                None => st
                    .snapshot_script
                    .pop_front()
                    .unwrap_or_else(|| Ok(st.snapshot.clone()))
                    .map_err(RemoteError::Rejected),
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }

    async fn fetch_recent_logs(&self, limit: u32) -> Result<Vec<LogEntry>, RemoteError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        let mut st = lock(&self.state);
        let reply = st.log_script.pop_front().unwrap_or_else(|| Ok(st.logs.clone()));
        reply
            .map(|mut logs| {
                logs.truncate(limit as usize);
                logs
            })
            .map_err(RemoteError::Rejected)
    }

    async fn execute_task(&self, order: TaskOrder) -> Result<ExecuteAck, RemoteError> {
        let mut st = lock(&self.state);
        st.executed.push(order);
        st.execute_script
            .pop_front()
            .unwrap_or_else(|| Ok(ExecuteAck::default()))
            .map_err(RemoteError::Rejected)
    }

    async fn execute_batch(&self, orders: &[TaskOrder]) -> Result<BatchResults, RemoteError> {
        let mut st = lock(&self.state);
        st.batches.push(orders.to_vec());
        st.batch_script
            .pop_front()
            .unwrap_or_else(|| Ok(BatchResults::default()))
            .map_err(RemoteError::Rejected)
    }

    async fn add_task(&self, draft: &TaskDraft) -> Result<(), RemoteError> {
        self.command_result()?;
        lock(&self.state).added.push(draft.clone());
        Ok(())
    }

    async fn update_task(&self, order: TaskOrder, patch: &TaskPatch) -> Result<(), RemoteError> {
        self.command_result()?;
        lock(&self.state).updated.push((order, patch.clone()));
        Ok(())
    }

    async fn delete_task(&self, order: TaskOrder) -> Result<(), RemoteError> {
        self.command_result()?;
        lock(&self.state).deleted.push(order);
        Ok(())
    }

    async fn delete_batch(&self, orders: &[TaskOrder]) -> Result<(), RemoteError> {
        self.command_result()?;
        lock(&self.state).deleted.extend_from_slice(orders);
        Ok(())
    }

    async fn move_task(&self, _order: TaskOrder, _new_index: u32) -> Result<(), RemoteError> {
        self.command_result()
    }
}
