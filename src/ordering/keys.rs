//! Per-player serialization keys
//!
//! Every key owns a FIFO of tickets. A reservation enqueues its ticket on all of
//! its keys in one critical section, so tickets are totally ordered by arrival
//! and a holder only proceeds once it is at the head of every queue it joined.
//! Two reservations can never wait on each other in a cycle: the older ticket
//! is ahead in every queue they share.

use crate::metrics::MetricsCollector;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TableState {
    queues: HashMap<String, VecDeque<u64>>,
    next_ticket: u64,
}

/// Shared table of key queues
#[derive(Default)]
pub struct KeyTable {
    state: Mutex<TableState>,
    released: Notify,
    metrics: Option<Arc<MetricsCollector>>,
}

impl KeyTable {
    pub fn new(metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            released: Notify::new(),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // Queue bookkeeping never panics mid-update, so a poisoned table is still consistent
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join the queue of every key; keys are sorted and deduplicated first
    pub fn reserve(self: &Arc<Self>, keys: impl IntoIterator<Item = String>) -> Reservation {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let ticket = {
            let mut state = self.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            for key in &keys {
                state.queues.entry(key.clone()).or_default().push_back(ticket);
            }
            self.report(&state);
            ticket
        };

        Reservation {
            table: Arc::clone(self),
            ticket,
            keys,
        }
    }

    /// Keys with at least one queued or active ticket
    pub fn pending_keys(&self) -> usize {
        self.lock().queues.len()
    }

    fn is_head(&self, ticket: u64, keys: &[String]) -> bool {
        let state = self.lock();
        keys.iter().all(|key| {
            state
                .queues
                .get(key)
                .and_then(|queue| queue.front())
                .is_some_and(|head| *head == ticket)
        })
    }

    fn release(&self, ticket: u64, keys: &[String]) {
        {
            let mut state = self.lock();
            for key in keys {
                if let Some(queue) = state.queues.get_mut(key) {
                    queue.retain(|queued| *queued != ticket);
                    if queue.is_empty() {
                        state.queues.remove(key);
                    }
                }
            }
            self.report(&state);
        }
        self.released.notify_waiters();
    }

    fn report(&self, state: &TableState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_pending_ordering_keys(state.queues.len());
        }
    }
}

/// A place in line on a set of keys; leaving the line happens on drop
pub struct Reservation {
    table: Arc<KeyTable>,
    ticket: u64,
    keys: Vec<String>,
}

impl Reservation {
    /// Wait until every earlier reservation sharing a key has been dropped
    pub async fn ready(&self) {
        loop {
            let notified = self.table.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();
            if self.table.is_head(self.ticket, &self.keys) {
                return;
            }
            notified.await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.table.is_head(self.ticket, &self.keys)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.table.release(self.ticket, &self.keys);
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("ticket", &self.ticket)
            .field("keys", &self.keys)
            .finish()
    }
}
