use crate::core::lock;
use crate::core::model::{LogEntry, Task, TaskOrder, TaskStatus};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorContext {
    TaskStatus,
    Logs,
    Refresh,
    Execute,
    BatchExecute,
    Command,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TaskStatus => "task_status",
            Self::Logs => "logs",
            Self::Refresh => "refresh",
            Self::Execute => "execute",
            Self::BatchExecute => "batch_execute",
            Self::Command => "command",
        })
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started,
    Stopped,
    /// Full mirror after a reconcile that actually changed something.
    TaskUpdate { tasks: Vec<Task> },
    /// Only entries newer than anything delivered before.
    LogsUpdate { logs: Vec<LogEntry> },
    TaskStatusChanged { order: TaskOrder, from: TaskStatus, to: TaskStatus, message: Option<String> },
    Error { context: ErrorContext, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Stopped,
    TaskUpdate,
    LogsUpdate,
    TaskStatusChanged,
    Error,
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started => EventKind::Started,
            Self::Stopped => EventKind::Stopped,
            Self::TaskUpdate { .. } => EventKind::TaskUpdate,
            Self::LogsUpdate { .. } => EventKind::LogsUpdate,
            Self::TaskStatusChanged { .. } => EventKind::TaskStatusChanged,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Listener {
    id: SubscriptionId,
    kind: EventKind,
    callback: Callback,
}

/// Fan-out for engine events: synchronous callbacks registered per event
/// kind, plus a broadcast channel for async consumers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, listeners: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        lock(&self.listeners).push(Listener { id, kind, callback: Arc::new(callback) });
        id
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn off_kind(&self, kind: EventKind) -> usize {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.kind != kind);
        before - listeners.len()
    }

    pub fn clear(&self) {
        lock(&self.listeners).clear();
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn emit(&self, event: SyncEvent) {
        let kind = event.kind();
        // callbacks may call back into the bus, so never run them under the lock
        let matching: Vec<Callback> = lock(&self.listeners)
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| l.callback.clone())
            .collect();
        for cb in matching {
            cb(&event);
        }
        let _ = self.tx.send(event);
    }
}
