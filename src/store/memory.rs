//! In-memory rating store
//!
//! All state sits behind a single lock, so a commit is trivially atomic. Used
//! for dry runs and tests; nothing survives a restart.

use crate::error::{RatingServiceError, Result};
use crate::store::{rank_entries, CommitOutcome, RatingCommit, RatingStore};
use crate::types::{
    LeaderboardEntry, LeaderboardId, MatchId, PlayerId, PlayerRatingRecord, RatingHistoryEntry,
    SkillRating,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Most recent commits kept for inspection; older ones are dropped
pub const COMMIT_LOG_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct StoreState {
    ratings: HashMap<(LeaderboardId, PlayerId), (PlayerRatingRecord, f64)>,
    history: Vec<RatingHistoryEntry>,
    processed: HashSet<MatchId>,
    commit_log: VecDeque<RatingCommit>,
}

#[derive(Debug)]
pub struct InMemoryRatingStore {
    state: RwLock<StoreState>,
    initial_rating: SkillRating,
}

impl InMemoryRatingStore {
    pub fn new(initial_rating: SkillRating) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            initial_rating,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|_| {
            RatingServiceError::InternalError {
                message: "Failed to acquire rating store read lock".to_string(),
            }
            .into()
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state.write().map_err(|_| {
            RatingServiceError::InternalError {
                message: "Failed to acquire rating store write lock".to_string(),
            }
            .into()
        })
    }

    /// The last [`COMMIT_LOG_CAPACITY`] successful commits, oldest first
    pub fn commit_log(&self) -> Vec<RatingCommit> {
        self.state
            .read()
            .map(|state| state.commit_log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of history rows across all players
    pub fn history_len(&self) -> usize {
        self.state
            .read()
            .map(|state| state.history.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RatingStore for InMemoryRatingStore {
    async fn current_rating(
        &self,
        player_id: &PlayerId,
        leaderboard: &LeaderboardId,
    ) -> Result<PlayerRatingRecord> {
        let state = self.read()?;
        Ok(state
            .ratings
            .get(&(leaderboard.clone(), player_id.clone()))
            .map(|(record, _)| record.clone())
            .unwrap_or_else(|| {
                PlayerRatingRecord::unrated(player_id.clone(), leaderboard.clone(), self.initial_rating)
            }))
    }

    async fn has_processed(&self, match_id: &MatchId) -> Result<bool> {
        Ok(self.read()?.processed.contains(match_id))
    }

    async fn commit(&self, commit: RatingCommit) -> Result<CommitOutcome> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        if let Some(match_id) = commit.match_id() {
            if state.processed.contains(match_id) {
                return Ok(CommitOutcome::AlreadyProcessed);
            }
        }

        // Check every version before touching anything
        for update in &commit.updates {
            let key = (commit.leaderboard.clone(), update.entry.player_id.clone());
            let stored = state.ratings.get(&key).map(|(record, _)| record.version).unwrap_or(0);
            if stored != update.expected_version {
                return Err(RatingServiceError::StaleRating {
                    player_id: update.entry.player_id.clone(),
                    leaderboard: commit.leaderboard.clone(),
                }
                .into());
            }
        }

        for update in &commit.updates {
            let entry = &update.entry;
            let key = (commit.leaderboard.clone(), entry.player_id.clone());
            let (record, score) = state.ratings.entry(key).or_insert_with(|| {
                (
                    PlayerRatingRecord::unrated(
                        entry.player_id.clone(),
                        commit.leaderboard.clone(),
                        entry.previous,
                    ),
                    0.0,
                )
            });
            record.rating = entry.new;
            record.version += 1;
            if let Some(won) = update.won {
                record.total_games += 1;
                if won {
                    record.won_games += 1;
                }
                record.last_played_at = Some(entry.timestamp);
            }
            *score = update.score;
            state.history.push(entry.clone());
        }

        if let Some(match_id) = commit.match_id() {
            state.processed.insert(match_id.clone());
        }
        if state.commit_log.len() == COMMIT_LOG_CAPACITY {
            state.commit_log.pop_front();
        }
        state.commit_log.push_back(commit);

        Ok(CommitOutcome::Committed)
    }

    async fn leaderboard(
        &self,
        leaderboard: &LeaderboardId,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>> {
        let state = self.read()?;
        let rows = state
            .ratings
            .iter()
            .filter(|((board, _), _)| board == leaderboard)
            .map(|(_, (record, score))| (record.clone(), *score))
            .collect();
        Ok(rank_entries(rows, limit))
    }

    async fn history(
        &self,
        player_id: &PlayerId,
        leaderboard: &LeaderboardId,
    ) -> Result<Vec<RatingHistoryEntry>> {
        Ok(self
            .read()?
            .history
            .iter()
            .filter(|entry| &entry.player_id == player_id && &entry.leaderboard == leaderboard)
            .cloned()
            .collect())
    }

    async fn leaderboards(&self) -> Result<Vec<LeaderboardId>> {
        let state = self.read()?;
        let boards: BTreeSet<&LeaderboardId> = state.ratings.keys().map(|(board, _)| board).collect();
        Ok(boards.into_iter().cloned().collect())
    }

    async fn players(&self, leaderboard: &LeaderboardId) -> Result<Vec<PlayerRatingRecord>> {
        let state = self.read()?;
        let mut records: Vec<PlayerRatingRecord> = state
            .ratings
            .iter()
            .filter(|((board, _), _)| board == leaderboard)
            .map(|(_, (record, _))| record.clone())
            .collect();
        records.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        Ok(records)
    }

    async fn recompute_leaderboard(
        &self,
        leaderboard: &LeaderboardId,
        conservative_k: f64,
    ) -> Result<usize> {
        let mut state = self.write()?;
        let mut rows = 0;
        for ((board, _), (record, score)) in state.ratings.iter_mut() {
            if board == leaderboard {
                *score = record.rating.conservative_estimate(conservative_k);
                rows += 1;
            }
        }
        Ok(rows)
    }

    async fn ping(&self) -> Result<()> {
        self.read().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorClass};
    use crate::store::PlayerRatingUpdate;
    use crate::types::UpdateCause;
    use chrono::Utc;

    fn prior() -> SkillRating {
        SkillRating::new(1500.0, 500.0)
    }

    fn update(player: &str, expected_version: u64, mean: f64, won: Option<bool>) -> PlayerRatingUpdate {
        let new = SkillRating::new(mean, 400.0);
        PlayerRatingUpdate {
            entry: RatingHistoryEntry {
                player_id: player.to_string(),
                leaderboard: "global".to_string(),
                match_id: Some("m1".to_string()),
                previous: prior(),
                new,
                timestamp: Utc::now(),
            },
            expected_version,
            won,
            score: new.conservative_estimate(3.0),
        }
    }

    fn match_commit(match_id: &str, updates: Vec<PlayerRatingUpdate>) -> RatingCommit {
        RatingCommit {
            cause: UpdateCause::Match(match_id.to_string()),
            leaderboard: "global".to_string(),
            updates,
        }
    }

    #[tokio::test]
    async fn test_unseen_player_gets_prior() {
        let store = InMemoryRatingStore::new(prior());
        let record = store
            .current_rating(&"p1".to_string(), &"global".to_string())
            .await
            .unwrap();
        assert_eq!(record.rating, prior());
        assert_eq!(record.version, 0);
    }

    #[tokio::test]
    async fn test_commit_applies_all_rows() {
        let store = InMemoryRatingStore::new(prior());
        let outcome = store
            .commit(match_commit(
                "m1",
                vec![update("a", 0, 1600.0, Some(true)), update("b", 0, 1400.0, Some(false))],
            ))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        assert!(store.has_processed(&"m1".to_string()).await.unwrap());

        let a = store
            .current_rating(&"a".to_string(), &"global".to_string())
            .await
            .unwrap();
        assert_eq!(a.rating.mean, 1600.0);
        assert_eq!(a.version, 1);
        assert_eq!(a.total_games, 1);
        assert_eq!(a.won_games, 1);

        let board = store.leaderboard(&"global".to_string(), 10).await.unwrap();
        assert_eq!(board[0].player_id, "a");
        assert_eq!(board[0].position, 1);
        assert_eq!(board[1].player_id, "b");
        assert_eq!(store.history_len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_match_is_noop() {
        let store = InMemoryRatingStore::new(prior());
        store
            .commit(match_commit("m1", vec![update("a", 0, 1600.0, Some(true))]))
            .await
            .unwrap();
        let outcome = store
            .commit(match_commit("m1", vec![update("a", 1, 1700.0, Some(true))]))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::AlreadyProcessed);
        assert_eq!(store.history_len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_writes_nothing() {
        let store = InMemoryRatingStore::new(prior());
        store
            .commit(match_commit("m1", vec![update("a", 0, 1600.0, Some(true))]))
            .await
            .unwrap();

        let err = store
            .commit(match_commit(
                "m2",
                vec![update("b", 0, 1450.0, Some(false)), update("a", 0, 1650.0, Some(true))],
            ))
            .await
            .unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Transient);

        assert!(!store.has_processed(&"m2".to_string()).await.unwrap());
        let b = store
            .current_rating(&"b".to_string(), &"global".to_string())
            .await
            .unwrap();
        assert_eq!(b.version, 0);
        assert_eq!(store.history_len(), 1);
    }

    #[tokio::test]
    async fn test_commit_log_keeps_only_recent_commits() {
        let store = InMemoryRatingStore::new(prior());
        let total = COMMIT_LOG_CAPACITY + 10;
        for i in 0..total {
            let outcome = store
                .commit(match_commit(&format!("m{}", i), Vec::new()))
                .await
                .unwrap();
            assert_eq!(outcome, CommitOutcome::Committed);
        }

        let log = store.commit_log();
        assert_eq!(log.len(), COMMIT_LOG_CAPACITY);
        assert_eq!(log[0].cause, UpdateCause::Match("m10".to_string()));
        assert_eq!(
            log[COMMIT_LOG_CAPACITY - 1].cause,
            UpdateCause::Match(format!("m{}", total - 1))
        );
        // Deduplication does not depend on the log
        assert!(store.has_processed(&"m0".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_recompute_leaderboard() {
        let store = InMemoryRatingStore::new(prior());
        store
            .commit(match_commit(
                "m1",
                vec![update("a", 0, 1600.0, Some(true)), update("b", 0, 1400.0, Some(false))],
            ))
            .await
            .unwrap();

        let rows = store
            .recompute_leaderboard(&"global".to_string(), 0.0)
            .await
            .unwrap();
        assert_eq!(rows, 2);
        let board = store.leaderboard(&"global".to_string(), 1).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].score, 1600.0);
        assert_eq!(store.leaderboards().await.unwrap(), vec!["global".to_string()]);
    }
}
