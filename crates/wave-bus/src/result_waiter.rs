//! Handler-notified latch for task results.
//!
//! Replaces poll-and-sleep loops: a signal-bus handler calls
//! [`ResultWaiter::notify`] when a completion event arrives, and any
//! task waiting in [`ResultWaiter::wait`] wakes within one bus
//! round-trip.
//!
//! Internally a mutex-guarded map keyed by task id with a per-key
//! notifier, which works the same under any async runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::queue::TaskResult;

struct Slot {
    result: Option<TaskResult>,
    notify: Arc<Notify>,
}

/// Concurrent map of task id to pending result.
#[derive(Default)]
pub struct ResultWaiter {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ResultWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a task id before dispatching it.
    ///
    /// Calling this first guarantees a notify that races the wait is
    /// not lost.
    pub fn expect(&self, task_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(task_id.to_owned()).or_insert_with(|| Slot {
            result: None,
            notify: Arc::new(Notify::new()),
        });
    }

    /// Fulfil a task id with its result, waking any waiter.
    ///
    /// Safe to call before `expect`/`wait`; the result is retained.
    pub fn notify(&self, task_id: &str, result: TaskResult) {
        let notify = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots.entry(task_id.to_owned()).or_insert_with(|| Slot {
                result: None,
                notify: Arc::new(Notify::new()),
            });
            slot.result = Some(result);
            Arc::clone(&slot.notify)
        };
        notify.notify_waiters();
    }

    /// Number of task ids currently tracked.
    pub fn pending(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.len()
    }

    /// Block until the task id is notified or the timeout elapses.
    ///
    /// Returns `None` on timeout. The slot is removed once the result
    /// is taken.
    pub async fn wait(&self, task_id: &str, timeout: Duration) -> Option<TaskResult> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Take the result if it is already there; otherwise grab the
            // notifier while still holding the lock so a concurrent
            // notify cannot slip between check and await.
            let notify = {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                let slot = slots.entry(task_id.to_owned()).or_insert_with(|| Slot {
                    result: None,
                    notify: Arc::new(Notify::new()),
                });
                if let Some(result) = slot.result.take() {
                    slots.remove(task_id);
                    return Some(result);
                }
                Arc::clone(&slot.notify)
            };

            let notified = notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                // Re-check: the notify may have landed between the
                // timeout firing and this lock.
                if let Some(slot) = slots.get_mut(task_id) {
                    if let Some(result) = slot.result.take() {
                        slots.remove(task_id);
                        return Some(result);
                    }
                }
                slots.remove(task_id);
                return None;
            }
        }
    }
}
