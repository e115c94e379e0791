pub mod config;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod model;
pub mod reconciler;
pub mod scheduler;
pub mod store;

use std::sync::{Mutex, MutexGuard};

/// Poisoning is ignored: no engine lock is held across a multi-step update.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
