//! Ordering coordinator
//!
//! Bounds concurrent rating work and serializes it per player. Submission is
//! synchronous so a match takes its place in every participant's queue in
//! the order it was pulled from the source. Worker slots are only taken once
//! the keys are held, so a blocked match never occupies a slot.

use crate::error::{RatingServiceError, Result};
use crate::metrics::MetricsCollector;
use crate::ordering::keys::{KeyTable, Reservation};
use crate::types::{MatchResult, PlayerId};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct OrderingCoordinator {
    keys: Arc<KeyTable>,
    workers: Arc<Semaphore>,
    max_workers: usize,
}

impl OrderingCoordinator {
    pub fn new(max_workers: usize, metrics: Option<Arc<MetricsCollector>>) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            keys: Arc::new(KeyTable::new(metrics)),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Reserve every participant of a match
    pub fn submit(&self, result: &MatchResult) -> Ticket {
        self.reserve(result.players().cloned())
    }

    /// Reserve a single player, used by maintenance
    pub fn submit_player(&self, player_id: &PlayerId) -> Ticket {
        self.reserve(std::iter::once(player_id.clone()))
    }

    fn reserve(&self, players: impl IntoIterator<Item = PlayerId>) -> Ticket {
        Ticket {
            reservation: self.keys.reserve(players),
            workers: Arc::clone(&self.workers),
        }
    }

    /// Take a worker slot without holding any keys
    pub async fn worker(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.workers).await
    }

    pub fn pending_keys(&self) -> usize {
        self.keys.pending_keys()
    }

    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Refuse further worker slots; waiting acquisitions fail
    pub fn close(&self) {
        self.workers.close();
    }
}

/// A match's place in line; dropping it releases the keys
#[derive(Debug)]
pub struct Ticket {
    reservation: Reservation,
    workers: Arc<Semaphore>,
}

impl Ticket {
    /// Wait for every key, in submission order
    pub async fn keys_ready(&self) {
        self.reservation.ready().await;
    }

    /// Take a worker slot; the keys stay held when the slot is returned
    pub async fn worker(&self) -> Result<OwnedSemaphorePermit> {
        acquire(&self.workers).await
    }

    pub fn keys(&self) -> &[PlayerId] {
        self.reservation.keys()
    }
}

async fn acquire(workers: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
    Arc::clone(workers).acquire_owned().await.map_err(|_| {
        RatingServiceError::ServiceNotReady {
            message: "Ordering coordinator is closed".to_string(),
        }
        .into()
    })
}
