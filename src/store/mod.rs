//! Rating persistence
//!
//! The store exclusively owns durable rating state. Every mutation, whether
//! from a match or from maintenance decay, goes through [`RatingStore::commit`],
//! which applies all player rows, their history entries and the leaderboard
//! ordering effect as one atomic unit or not at all.

pub mod faulty;
pub mod memory;
pub mod sqlite;

use crate::error::Result;
use crate::types::{
    LeaderboardEntry, LeaderboardId, MatchId, PlayerId, PlayerRatingRecord, RatingHistoryEntry,
    UpdateCause,
};
use async_trait::async_trait;

pub use faulty::FaultyRatingStore;
pub use memory::InMemoryRatingStore;
pub use sqlite::SqliteRatingStore;

/// New state for one player, checked against the version it was computed from
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRatingUpdate {
    pub entry: RatingHistoryEntry,
    /// Version of the record the posterior was computed from
    pub expected_version: u64,
    /// `Some` tallies a game (`true` for a win); `None` for decay
    pub won: Option<bool>,
    /// Leaderboard ordering key for the new rating
    pub score: f64,
}

/// One atomic unit of rating changes
#[derive(Debug, Clone, PartialEq)]
pub struct RatingCommit {
    pub cause: UpdateCause,
    pub leaderboard: LeaderboardId,
    pub updates: Vec<PlayerRatingUpdate>,
}

impl RatingCommit {
    pub fn match_id(&self) -> Option<&MatchId> {
        self.cause.match_id()
    }
}

/// Result of a commit that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The match was already committed earlier; nothing was written
    AlreadyProcessed,
}

/// Trait for rating storage operations
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Current record, or an unrated record with the configured prior and version 0
    async fn current_rating(
        &self,
        player_id: &PlayerId,
        leaderboard: &LeaderboardId,
    ) -> Result<PlayerRatingRecord>;

    /// Whether a match's effect has already been committed
    async fn has_processed(&self, match_id: &MatchId) -> Result<bool>;

    /// Atomically apply a set of rating changes.
    ///
    /// Fails with `StaleRating` if any player's stored version differs from the
    /// expected one; in that case nothing is written.
    async fn commit(&self, commit: RatingCommit) -> Result<CommitOutcome>;

    /// Top `limit` players ordered by conservative score
    async fn leaderboard(
        &self,
        leaderboard: &LeaderboardId,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>>;

    /// Full rating history for a player, oldest first
    async fn history(
        &self,
        player_id: &PlayerId,
        leaderboard: &LeaderboardId,
    ) -> Result<Vec<RatingHistoryEntry>>;

    /// Every leaderboard with at least one rated player
    async fn leaderboards(&self) -> Result<Vec<LeaderboardId>>;

    /// Every persisted record on a leaderboard
    async fn players(&self, leaderboard: &LeaderboardId) -> Result<Vec<PlayerRatingRecord>>;

    /// Rewrite every ordering score on a leaderboard; returns the row count
    async fn recompute_leaderboard(
        &self,
        leaderboard: &LeaderboardId,
        conservative_k: f64,
    ) -> Result<usize>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> Result<()>;
}

pub(crate) fn rank_entries(mut records: Vec<(PlayerRatingRecord, f64)>, limit: usize) -> Vec<LeaderboardEntry> {
    records.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.player_id.cmp(&b.player_id))
    });
    records
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(index, (record, score))| LeaderboardEntry {
            position: index as u32 + 1,
            player_id: record.player_id,
            rating: record.rating,
            score,
            total_games: record.total_games,
        })
        .collect()
}
