//! Per-match rating work
//!
//! A match holds its player keys from the first attempt until it is settled.
//! Priors are read under the keys, so two matches sharing a player always see
//! each other's effects in delivery order. Transient failures are retried in
//! place; the worker slot is handed back during the backoff so unrelated
//! matches keep flowing. Once a match fails for good the processor halts:
//! every match still waiting on keys is handed back untouched, so nothing
//! commits ahead of the requeued delivery.

use crate::amqp::publisher::RatingPublisher;
use crate::error::{classify, ErrorClass, RatingServiceError, Result};
use crate::ingest::delivery::{settle, AckDecision};
use crate::ingest::AdmittedMatch;
use crate::metrics::MetricsCollector;
use crate::ordering::{OrderingCoordinator, Ticket};
use crate::rating::{RatingCalculator, TeamPriors};
use crate::store::{CommitOutcome, PlayerRatingUpdate, RatingCommit, RatingStore};
use crate::types::{MatchResult, RatingHistoryEntry, RatingUpdated, RejectionReason, UpdateCause};
use crate::utils::{backoff_delay, current_timestamp, payload_preview};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a match left the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDisposition {
    /// Committed; one history entry per participant
    Committed(Vec<RatingHistoryEntry>),
    /// Already committed by an earlier delivery
    Duplicate,
    /// Refused by the rating model
    Rejected,
    /// Handed back unprocessed because an earlier match halted the processor
    Requeued,
}

/// Retry policy for transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

pub struct MatchProcessor {
    store: Arc<dyn RatingStore>,
    calculator: Arc<dyn RatingCalculator>,
    coordinator: OrderingCoordinator,
    metrics: Arc<MetricsCollector>,
    publisher: Option<Arc<dyn RatingPublisher>>,
    retry: RetryPolicy,
    halted: AtomicBool,
}

impl MatchProcessor {
    pub fn new(
        store: Arc<dyn RatingStore>,
        calculator: Arc<dyn RatingCalculator>,
        coordinator: OrderingCoordinator,
        metrics: Arc<MetricsCollector>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            calculator,
            coordinator,
            metrics,
            publisher: None,
            retry,
            halted: AtomicBool::new(false),
        }
    }

    /// Publish a rating-change notification after every commit
    pub fn with_publisher(mut self, publisher: Arc<dyn RatingPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn coordinator(&self) -> &OrderingCoordinator {
        &self.coordinator
    }

    /// Whether a match has failed in a way that stops consumption
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Take a place in every participant's queue; must be called in delivery order
    pub fn submit(&self, admitted: &AdmittedMatch) -> Ticket {
        self.coordinator.submit(&admitted.result)
    }

    /// Run one match to settlement.
    ///
    /// Returns `Err` only for failures that should stop consumption; by then
    /// the delivery has been handed back for redelivery.
    pub async fn handle(&self, admitted: AdmittedMatch, ticket: Ticket) -> Result<MatchDisposition> {
        ticket.keys_ready().await;
        let match_id = admitted.result.match_id.clone();

        if self.is_halted() {
            warn!(match_id = %match_id, "Processor halted, handing match back");
            self.finish(&admitted, AckDecision::Requeue).await;
            return Ok(MatchDisposition::Requeued);
        }

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let permit = match ticket.worker().await {
                Ok(permit) => permit,
                Err(e) => break Err(e),
            };
            let result = self.apply(&admitted.result).await;
            drop(permit);

            match result {
                Ok(disposition) => break Ok(disposition),
                Err(e) if classify(&e) == ErrorClass::Transient && attempt < self.retry.max_attempts => {
                    let delay = backoff_delay(attempt, self.retry.base_delay, self.retry.max_delay);
                    warn!(
                        match_id = %match_id,
                        attempt,
                        "Rating update failed, retrying in {:?}: {}", delay, e
                    );
                    self.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        let settled = match outcome {
            Ok(MatchDisposition::Committed(entries)) => {
                self.finish(&admitted, AckDecision::Ack).await;
                self.metrics.record_processed(admitted.received_at.elapsed());
                info!(
                    match_id = %match_id,
                    leaderboard = %admitted.result.leaderboard,
                    players = entries.len(),
                    "Committed rating update"
                );
                Ok(MatchDisposition::Committed(entries))
            }
            Ok(MatchDisposition::Duplicate) => {
                self.finish(&admitted, AckDecision::Ack).await;
                self.metrics.record_duplicate();
                debug!(match_id = %match_id, "Match was already committed");
                Ok(MatchDisposition::Duplicate)
            }
            Ok(disposition @ (MatchDisposition::Rejected | MatchDisposition::Requeued)) => {
                Ok(disposition)
            }
            Err(e) => match classify(&e) {
                ErrorClass::Malformed => {
                    error!(
                        match_id = %match_id,
                        delivery_tag = admitted.delivery_tag,
                        payload = %payload_preview(&admitted.payload, usize::MAX),
                        "Rating model refused match: {}", e
                    );
                    self.metrics.record_rejected(RejectionReason::RatingInput);
                    self.finish(&admitted, AckDecision::Reject).await;
                    Ok(MatchDisposition::Rejected)
                }
                ErrorClass::Transient => {
                    self.halted.store(true, Ordering::Release);
                    self.finish(&admitted, AckDecision::Requeue).await;
                    Err(RatingServiceError::RetryBudgetExhausted {
                        match_id: match_id.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    }
                    .into())
                }
                ErrorClass::Fatal => {
                    self.halted.store(true, Ordering::Release);
                    self.finish(&admitted, AckDecision::Requeue).await;
                    Err(e)
                }
            },
        };

        // Keys are released only after the delivery is settled
        drop(ticket);

        if let Ok(MatchDisposition::Committed(entries)) = &settled {
            self.notify(entries).await;
        }
        settled
    }

    /// One attempt: duplicate check, priors, calculation, commit
    async fn apply(&self, result: &MatchResult) -> Result<MatchDisposition> {
        if self.store.has_processed(&result.match_id).await? {
            return Ok(MatchDisposition::Duplicate);
        }

        let mut records = Vec::with_capacity(result.teams.len());
        let mut priors: Vec<TeamPriors> = Vec::with_capacity(result.teams.len());
        for team in &result.teams {
            let mut team_records = Vec::with_capacity(team.players.len());
            let mut team_priors = TeamPriors::with_capacity(team.players.len());
            for player_id in &team.players {
                let record = self
                    .store
                    .current_rating(player_id, &result.leaderboard)
                    .await?;
                team_priors.push((player_id.clone(), record.rating));
                team_records.push(record);
            }
            records.push(team_records);
            priors.push(team_priors);
        }

        let ranks: Vec<u32> = result.teams.iter().map(|team| team.rank).collect();
        let calculation = self
            .calculator
            .update(&result.leaderboard, &priors, &ranks)?;

        let k = self.calculator.config().conservative_k;
        let timestamp = current_timestamp();
        let mut updates = Vec::with_capacity(result.player_count());
        for (team_index, team_records) in records.into_iter().enumerate() {
            let won = result.team_won(team_index);
            for record in team_records {
                let posterior = calculation
                    .posteriors
                    .get(&record.player_id)
                    .copied()
                    .ok_or_else(|| RatingServiceError::InternalError {
                        message: format!("no posterior for player {}", record.player_id),
                    })?;
                updates.push(PlayerRatingUpdate {
                    entry: RatingHistoryEntry {
                        player_id: record.player_id,
                        leaderboard: result.leaderboard.clone(),
                        match_id: Some(result.match_id.clone()),
                        previous: record.rating,
                        new: posterior,
                        timestamp,
                    },
                    expected_version: record.version,
                    won: Some(won),
                    score: posterior.conservative_estimate(k),
                });
            }
        }

        let entries: Vec<RatingHistoryEntry> = updates.iter().map(|u| u.entry.clone()).collect();
        let timer = self.metrics.start_timer();
        let outcome = self
            .store
            .commit(RatingCommit {
                cause: UpdateCause::Match(result.match_id.clone()),
                leaderboard: result.leaderboard.clone(),
                updates,
            })
            .await?;
        self.metrics.record_commit(timer.stop());

        Ok(match outcome {
            CommitOutcome::Committed => MatchDisposition::Committed(entries),
            CommitOutcome::AlreadyProcessed => MatchDisposition::Duplicate,
        })
    }

    async fn finish(&self, admitted: &AdmittedMatch, decision: AckDecision) {
        if let Err(e) = settle(admitted.acker.as_ref(), decision).await {
            error!(
                match_id = %admitted.result.match_id,
                delivery_tag = admitted.delivery_tag,
                "Failed to settle delivery as {:?}: {}", decision, e
            );
        }
    }

    /// Best effort; the commit stands whether or not anyone hears about it
    async fn notify(&self, entries: &[RatingHistoryEntry]) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        for entry in entries {
            let event = RatingUpdated::from(entry);
            match publisher.publish_rating_updated(event).await {
                Ok(()) => self.metrics.record_notification(true),
                Err(e) => {
                    self.metrics.record_notification(false);
                    warn!(player_id = %entry.player_id, "Failed to publish rating update: {}", e);
                }
            }
        }
    }
}
