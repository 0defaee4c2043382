//! Fault-injecting store wrapper
//!
//! Wraps any [`RatingStore`] and makes commits fail or stall on demand. Used
//! by the integration tests to exercise retry, atomicity and ordering paths.

use crate::error::{RatingServiceError, Result};
use crate::store::{CommitOutcome, RatingCommit, RatingStore};
use crate::types::{
    LeaderboardEntry, LeaderboardId, MatchId, PlayerId, PlayerRatingRecord, RatingHistoryEntry,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct FaultyRatingStore<S> {
    inner: Arc<S>,
    failing_commits: AtomicU32,
    commit_attempts: AtomicU32,
    unavailable: AtomicBool,
    commit_delays: Mutex<HashMap<MatchId, Duration>>,
}

impl<S: RatingStore> FaultyRatingStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            failing_commits: AtomicU32::new(0),
            commit_attempts: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            commit_delays: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Fail the next `count` commits after their input was fully computed
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Stall commits for one match before they reach the inner store
    pub fn delay_commit(&self, match_id: impl Into<MatchId>, delay: Duration) {
        if let Ok(mut delays) = self.commit_delays.lock() {
            delays.insert(match_id.into(), delay);
        }
    }

    /// Make every operation fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Commit calls seen, including failed ones
    pub fn commit_attempts(&self) -> u32 {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RatingServiceError::store("store is unavailable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl<S: RatingStore + 'static> RatingStore for FaultyRatingStore<S> {
    async fn current_rating(
        &self,
        player_id: &PlayerId,
        leaderboard: &LeaderboardId,
    ) -> Result<PlayerRatingRecord> {
        self.check_available()?;
        self.inner.current_rating(player_id, leaderboard).await
    }

    async fn has_processed(&self, match_id: &MatchId) -> Result<bool> {
        self.check_available()?;
        self.inner.has_processed(match_id).await
    }

    async fn commit(&self, commit: RatingCommit) -> Result<CommitOutcome> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = commit.match_id().and_then(|match_id| {
            self.commit_delays
                .lock()
                .ok()
                .and_then(|delays| delays.get(match_id).copied())
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_available()?;
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RatingServiceError::store("injected commit failure").into());
        }

        self.inner.commit(commit).await
    }

    async fn leaderboard(
        &self,
        leaderboard: &LeaderboardId,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>> {
        self.check_available()?;
        self.inner.leaderboard(leaderboard, limit).await
    }

    async fn history(
        &self,
        player_id: &PlayerId,
        leaderboard: &LeaderboardId,
    ) -> Result<Vec<RatingHistoryEntry>> {
        self.check_available()?;
        self.inner.history(player_id, leaderboard).await
    }

    async fn leaderboards(&self) -> Result<Vec<LeaderboardId>> {
        self.check_available()?;
        self.inner.leaderboards().await
    }

    async fn players(&self, leaderboard: &LeaderboardId) -> Result<Vec<PlayerRatingRecord>> {
        self.check_available()?;
        self.inner.players(leaderboard).await
    }

    async fn recompute_leaderboard(
        &self,
        leaderboard: &LeaderboardId,
        conservative_k: f64,
    ) -> Result<usize> {
        self.check_available()?;
        self.inner
            .recompute_leaderboard(leaderboard, conservative_k)
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()?;
        self.inner.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRatingStore;
    use crate::types::{SkillRating, UpdateCause};

    fn empty_commit(match_id: &str) -> RatingCommit {
        RatingCommit {
            cause: UpdateCause::Match(match_id.to_string()),
            leaderboard: "global".to_string(),
            updates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let inner = Arc::new(InMemoryRatingStore::new(SkillRating::new(1500.0, 500.0)));
        let store = FaultyRatingStore::new(inner.clone());
        store.fail_next_commits(2);

        assert!(store.commit(empty_commit("m1")).await.is_err());
        assert!(store.commit(empty_commit("m1")).await.is_err());
        assert_eq!(
            store.commit(empty_commit("m1")).await.unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(store.commit_attempts(), 3);
        assert!(inner.has_processed(&"m1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_ping() {
        let inner = Arc::new(InMemoryRatingStore::new(SkillRating::new(1500.0, 500.0)));
        let store = FaultyRatingStore::new(inner);
        assert!(store.ping().await.is_ok());
        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
