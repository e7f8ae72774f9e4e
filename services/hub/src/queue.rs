//! Coalescing work queue with per-key single-flight.
//!
//! Duplicate enqueues of a key collapse into one pending entry. While a key
//! is being processed, further enqueues mark it dirty and it is redelivered
//! once the in-flight reconcile calls `done`. FIFO order holds across
//! distinct keys.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

pub struct CoalescingQueue {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    order: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
}

impl CoalescingQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key. No-op when the key is already pending; keys being
    /// processed are redelivered after `done`.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock");
        if state.in_flight.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.order.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Pop the next ready key, marking it in flight.
    pub fn try_next(&self) -> Option<String> {
        let mut state = self.state.lock().expect("queue lock");
        let key = state.order.pop_front()?;
        state.queued.remove(&key);
        state.in_flight.insert(key.clone());
        Some(key)
    }

    /// Mark a key's reconcile finished. Keys dirtied while in flight are
    /// re-enqueued.
    pub fn done(&self, key: &str) {
        let redeliver = {
            let mut state = self.state.lock().expect("queue lock");
            state.in_flight.remove(key);
            state.dirty.remove(key)
        };
        if redeliver {
            self.add(key);
        }
    }

    /// Re-enqueue a key after a delay (backoff, dwell timers).
    pub fn requeue_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Resolves when new work may be available.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().expect("queue lock").order.len()
    }
}

impl Default for CoalescingQueue {
    fn default() -> Self {
        Self::new()
    }
}
