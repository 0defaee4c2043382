//! Scheduled rating maintenance
//!
//! Decay widens the uncertainty of inactive players through the same commit
//! path as match updates. Each player is handled under its own ordering key,
//! held for exactly one read-compute-commit, so live matches are never starved
//! and never raced.

use crate::config::{MaintenanceSettings, MAX_INACTIVITY_SECONDS};
use crate::error::{classify, ErrorClass, Result};
use crate::metrics::MetricsCollector;
use crate::ordering::OrderingCoordinator;
use crate::rating::DecayPolicy;
use crate::store::{PlayerRatingUpdate, RatingCommit, RatingStore};
use crate::types::{LeaderboardId, PlayerId, RatingHistoryEntry, UpdateCause};
use crate::utils::current_timestamp;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one decay run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecayReport {
    pub leaderboards: usize,
    pub examined: usize,
    pub decayed: usize,
    pub failed: usize,
}

pub struct Maintenance {
    store: Arc<dyn RatingStore>,
    coordinator: OrderingCoordinator,
    metrics: Arc<MetricsCollector>,
    policy: DecayPolicy,
    conservative_k: f64,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn RatingStore>,
        coordinator: OrderingCoordinator,
        metrics: Arc<MetricsCollector>,
        policy: DecayPolicy,
        conservative_k: f64,
    ) -> Self {
        Self {
            store,
            coordinator,
            metrics,
            policy,
            conservative_k,
        }
    }

    /// Build the decay policy from settings and the uncertainty ceiling
    pub fn policy_from_settings(settings: &MaintenanceSettings, max_uncertainty: f64) -> DecayPolicy {
        DecayPolicy {
            inactivity: chrono::Duration::seconds(
                settings.inactivity_seconds.min(MAX_INACTIVITY_SECONDS) as i64,
            ),
            decay_per_run: settings.decay_per_run,
            max_uncertainty,
        }
    }

    /// Decay one leaderboard, or every leaderboard when `leaderboard` is `None`
    pub async fn run_decay(&self, leaderboard: Option<&LeaderboardId>) -> Result<DecayReport> {
        let leaderboards = match leaderboard {
            Some(leaderboard) => vec![leaderboard.clone()],
            None => self.store.leaderboards().await?,
        };

        let mut report = DecayReport {
            leaderboards: leaderboards.len(),
            ..DecayReport::default()
        };

        for leaderboard in &leaderboards {
            let now = current_timestamp();
            let candidates = self.store.players(leaderboard).await?;
            report.examined += candidates.len();

            for candidate in candidates {
                if !self.policy.applies_to(&candidate, now) {
                    continue;
                }
                match self.decay_player(&candidate.player_id, leaderboard).await {
                    Ok(true) => report.decayed += 1,
                    Ok(false) => {}
                    Err(e) if classify(&e) == ErrorClass::Fatal => return Err(e),
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            player_id = %candidate.player_id,
                            leaderboard = %leaderboard,
                            "Decay failed, will retry next run: {}", e
                        );
                    }
                }
            }
        }

        self.metrics.record_decay_updates(report.decayed);
        info!(
            leaderboards = report.leaderboards,
            examined = report.examined,
            decayed = report.decayed,
            failed = report.failed,
            "Decay run finished"
        );
        Ok(report)
    }

    /// Re-read and decay one player under their ordering key
    async fn decay_player(&self, player_id: &PlayerId, leaderboard: &LeaderboardId) -> Result<bool> {
        let ticket = self.coordinator.submit_player(player_id);
        ticket.keys_ready().await;
        let _permit = ticket.worker().await?;

        // A match may have landed since the scan
        let record = self.store.current_rating(player_id, leaderboard).await?;
        let now = current_timestamp();
        if !self.policy.applies_to(&record, now) {
            debug!(player_id = %player_id, "Player no longer eligible for decay");
            return Ok(false);
        }

        let decayed = self.policy.apply(record.rating);
        self.store
            .commit(RatingCommit {
                cause: UpdateCause::Decay,
                leaderboard: leaderboard.clone(),
                updates: vec![PlayerRatingUpdate {
                    entry: RatingHistoryEntry {
                        player_id: player_id.clone(),
                        leaderboard: leaderboard.clone(),
                        match_id: None,
                        previous: record.rating,
                        new: decayed,
                        timestamp: now,
                    },
                    expected_version: record.version,
                    won: None,
                    score: decayed.conservative_estimate(self.conservative_k),
                }],
            })
            .await?;
        Ok(true)
    }

    /// Rewrite every leaderboard's ordering from current ratings
    pub async fn recompute_leaderboards(&self) -> Result<usize> {
        let mut rows = 0;
        for leaderboard in self.store.leaderboards().await? {
            let updated = self
                .store
                .recompute_leaderboard(&leaderboard, self.conservative_k)
                .await?;
            debug!(leaderboard = %leaderboard, rows = updated, "Recomputed leaderboard");
            rows += updated;
        }
        Ok(rows)
    }
}
