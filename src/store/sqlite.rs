//! SQLite-backed rating store
//!
//! One transaction per commit: version checks, rating upserts, journal rows and
//! the processed-match marker either all land or none do.

use crate::error::{RatingServiceError, Result};
use crate::store::{CommitOutcome, RatingCommit, RatingStore};
use crate::types::{
    LeaderboardEntry, LeaderboardId, MatchId, PlayerId, PlayerRatingRecord, RatingHistoryEntry,
    SkillRating,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{query, query_as};
use std::str::FromStr;
use tracing::{debug, info};

type RatingRow = (String, String, f64, f64, i64, i64, i64, Option<String>);
type JournalRow = (String, String, Option<String>, f64, f64, f64, f64, String);

#[derive(Debug, Clone)]
pub struct SqliteRatingStore {
    pool: SqlitePool,
    initial_rating: SkillRating,
}

impl SqliteRatingStore {
    /// Open (creating if missing) a database and run pending migrations
    pub async fn connect(
        url: &str,
        max_connections: u32,
        initial_rating: SkillRating,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL {}", url))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(RatingServiceError::store)?;

        info!("Connected to rating database {}", url);
        Self::with_pool(pool, initial_rating).await
    }

    /// Private in-memory database, mostly for tests
    pub async fn memory(initial_rating: SkillRating) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to :memory: is its own database; keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(RatingServiceError::store)?;
        Self::with_pool(pool, initial_rating).await
    }

    async fn with_pool(pool: SqlitePool, initial_rating: SkillRating) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run rating database migrations")?;
        Ok(Self {
            pool,
            initial_rating,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Corrupt timestamp {} in rating database", value))?
        .with_timezone(&Utc))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn record_from_row(row: RatingRow) -> Result<PlayerRatingRecord> {
    let (player_id, leaderboard, mean, deviation, version, total_games, won_games, last_played_at) =
        row;
    Ok(PlayerRatingRecord {
        player_id,
        leaderboard,
        rating: SkillRating::new(mean, deviation),
        version: version.max(0) as u64,
        total_games: total_games.max(0) as u64,
        won_games: won_games.max(0) as u64,
        last_played_at: last_played_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait]
impl RatingStore for SqliteRatingStore {
    async fn current_rating(
        &self,
        player_id: &PlayerId,
        leaderboard: &LeaderboardId,
    ) -> Result<PlayerRatingRecord> {
        let row: Option<RatingRow> = query_as(
            "SELECT player_id, leaderboard, mean, deviation, version, total_games, won_games, last_played_at \
             FROM leaderboard_rating WHERE player_id = $1 AND leaderboard = $2",
        )
        .bind(player_id)
        .bind(leaderboard)
        .fetch_optional(&self.pool)
        .await
        .map_err(RatingServiceError::store)?;

        match row {
            Some(row) => record_from_row(row),
            None => Ok(PlayerRatingRecord::unrated(
                player_id.clone(),
                leaderboard.clone(),
                self.initial_rating,
            )),
        }
    }

    async fn has_processed(&self, match_id: &MatchId) -> Result<bool> {
        let row: Option<(i64,)> = query_as("SELECT 1 FROM processed_match WHERE match_id = $1")
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(RatingServiceError::store)?;
        Ok(row.is_some())
    }

    async fn commit(&self, commit: RatingCommit) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await.map_err(RatingServiceError::store)?;

        if let Some(match_id) = commit.match_id() {
            let seen: Option<(i64,)> = query_as("SELECT 1 FROM processed_match WHERE match_id = $1")
                .bind(match_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(RatingServiceError::store)?;
            if seen.is_some() {
                tx.rollback().await.map_err(RatingServiceError::store)?;
                return Ok(CommitOutcome::AlreadyProcessed);
            }
        }

        for update in &commit.updates {
            let entry = &update.entry;
            let stored: Option<(i64,)> = query_as(
                "SELECT version FROM leaderboard_rating WHERE player_id = $1 AND leaderboard = $2",
            )
            .bind(&entry.player_id)
            .bind(&commit.leaderboard)
            .fetch_optional(&mut *tx)
            .await
            .map_err(RatingServiceError::store)?;

            let stored_version = stored.map(|(version,)| version).unwrap_or(0);
            if stored_version != to_i64(update.expected_version) {
                // Dropping the transaction rolls it back
                return Err(RatingServiceError::StaleRating {
                    player_id: entry.player_id.clone(),
                    leaderboard: commit.leaderboard.clone(),
                }
                .into());
            }

            let timestamp = entry.timestamp.to_rfc3339();
            let played = i64::from(update.won.is_some());
            let won = i64::from(update.won == Some(true));
            let last_played_at = update.won.map(|_| timestamp.clone());

            query(
                "INSERT INTO leaderboard_rating \
                 (player_id, leaderboard, mean, deviation, conservative_score, version, \
                  total_games, won_games, last_played_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, 1, $6, $7, $8, $9) \
                 ON CONFLICT (player_id, leaderboard) DO UPDATE SET \
                  mean = excluded.mean, \
                  deviation = excluded.deviation, \
                  conservative_score = excluded.conservative_score, \
                  version = leaderboard_rating.version + 1, \
                  total_games = leaderboard_rating.total_games + excluded.total_games, \
                  won_games = leaderboard_rating.won_games + excluded.won_games, \
                  last_played_at = COALESCE(excluded.last_played_at, leaderboard_rating.last_played_at), \
                  updated_at = excluded.updated_at",
            )
            .bind(&entry.player_id)
            .bind(&commit.leaderboard)
            .bind(entry.new.mean)
            .bind(entry.new.uncertainty)
            .bind(update.score)
            .bind(played)
            .bind(won)
            .bind(last_played_at)
            .bind(&timestamp)
            .execute(&mut *tx)
            .await
            .map_err(RatingServiceError::store)?;

            query(
                "INSERT INTO leaderboard_rating_journal \
                 (player_id, leaderboard, match_id, mean_before, deviation_before, \
                  mean_after, deviation_after, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&entry.player_id)
            .bind(&commit.leaderboard)
            .bind(entry.match_id.as_deref())
            .bind(entry.previous.mean)
            .bind(entry.previous.uncertainty)
            .bind(entry.new.mean)
            .bind(entry.new.uncertainty)
            .bind(&timestamp)
            .execute(&mut *tx)
            .await
            .map_err(RatingServiceError::store)?;
        }

        if let Some(match_id) = commit.match_id() {
            query(
                "INSERT INTO processed_match (match_id, leaderboard, processed_at) VALUES ($1, $2, $3)",
            )
            .bind(match_id)
            .bind(&commit.leaderboard)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(RatingServiceError::store)?;
        }

        tx.commit().await.map_err(RatingServiceError::store)?;

        debug!(
            leaderboard = %commit.leaderboard,
            cause = ?commit.cause,
            players = commit.updates.len(),
            "Committed rating changes"
        );
        Ok(CommitOutcome::Committed)
    }

    async fn leaderboard(
        &self,
        leaderboard: &LeaderboardId,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>> {
        let rows: Vec<(String, f64, f64, f64, i64)> = query_as(
            "SELECT player_id, mean, deviation, conservative_score, total_games \
             FROM leaderboard_rating WHERE leaderboard = $1 \
             ORDER BY conservative_score DESC, player_id ASC LIMIT $2",
        )
        .bind(leaderboard)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await
        .map_err(RatingServiceError::store)?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(
                |(index, (player_id, mean, deviation, score, total_games))| LeaderboardEntry {
                    position: index as u32 + 1,
                    player_id,
                    rating: SkillRating::new(mean, deviation),
                    score,
                    total_games: total_games.max(0) as u64,
                },
            )
            .collect())
    }

    async fn history(
        &self,
        player_id: &PlayerId,
        leaderboard: &LeaderboardId,
    ) -> Result<Vec<RatingHistoryEntry>> {
        let rows: Vec<JournalRow> = query_as(
            "SELECT player_id, leaderboard, match_id, mean_before, deviation_before, \
                    mean_after, deviation_after, created_at \
             FROM leaderboard_rating_journal WHERE player_id = $1 AND leaderboard = $2 \
             ORDER BY id",
        )
        .bind(player_id)
        .bind(leaderboard)
        .fetch_all(&self.pool)
        .await
        .map_err(RatingServiceError::store)?;

        rows.into_iter()
            .map(
                |(player_id, leaderboard, match_id, mean_before, dev_before, mean_after, dev_after, created_at)| {
                    Ok(RatingHistoryEntry {
                        player_id,
                        leaderboard,
                        match_id,
                        previous: SkillRating::new(mean_before, dev_before),
                        new: SkillRating::new(mean_after, dev_after),
                        timestamp: parse_timestamp(&created_at)?,
                    })
                },
            )
            .collect()
    }

    async fn leaderboards(&self) -> Result<Vec<LeaderboardId>> {
        let rows: Vec<(String,)> =
            query_as("SELECT DISTINCT leaderboard FROM leaderboard_rating ORDER BY leaderboard")
                .fetch_all(&self.pool)
                .await
                .map_err(RatingServiceError::store)?;
        Ok(rows.into_iter().map(|(leaderboard,)| leaderboard).collect())
    }

    async fn players(&self, leaderboard: &LeaderboardId) -> Result<Vec<PlayerRatingRecord>> {
        let rows: Vec<RatingRow> = query_as(
            "SELECT player_id, leaderboard, mean, deviation, version, total_games, won_games, last_played_at \
             FROM leaderboard_rating WHERE leaderboard = $1 ORDER BY player_id",
        )
        .bind(leaderboard)
        .fetch_all(&self.pool)
        .await
        .map_err(RatingServiceError::store)?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn recompute_leaderboard(
        &self,
        leaderboard: &LeaderboardId,
        conservative_k: f64,
    ) -> Result<usize> {
        let result = query(
            "UPDATE leaderboard_rating SET conservative_score = mean - $1 * deviation \
             WHERE leaderboard = $2",
        )
        .bind(conservative_k)
        .bind(leaderboard)
        .execute(&self.pool)
        .await
        .map_err(RatingServiceError::store)?;
        Ok(result.rows_affected() as usize)
    }

    async fn ping(&self) -> Result<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(RatingServiceError::store)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorClass};
    use crate::store::PlayerRatingUpdate;
    use crate::types::UpdateCause;

    fn prior() -> SkillRating {
        SkillRating::new(1500.0, 500.0)
    }

    fn update(
        player: &str,
        match_id: Option<&str>,
        expected_version: u64,
        new: SkillRating,
        won: Option<bool>,
    ) -> PlayerRatingUpdate {
        PlayerRatingUpdate {
            entry: RatingHistoryEntry {
                player_id: player.to_string(),
                leaderboard: "global".to_string(),
                match_id: match_id.map(str::to_string),
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
    async fn test_commit_round_trip() {
        let store = SqliteRatingStore::memory(prior()).await.unwrap();
        let global = "global".to_string();

        let unseen = store.current_rating(&"a".to_string(), &global).await.unwrap();
        assert_eq!(unseen.version, 0);
        assert_eq!(unseen.rating, prior());

        let outcome = store
            .commit(match_commit(
                "m1",
                vec![
                    update("a", Some("m1"), 0, SkillRating::new(1620.0, 420.0), Some(true)),
                    update("b", Some("m1"), 0, SkillRating::new(1380.0, 420.0), Some(false)),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        assert!(store.has_processed(&"m1".to_string()).await.unwrap());

        let a = store.current_rating(&"a".to_string(), &global).await.unwrap();
        assert_eq!(a.rating, SkillRating::new(1620.0, 420.0));
        assert_eq!(a.version, 1);
        assert_eq!((a.total_games, a.won_games), (1, 1));
        assert!(a.last_played_at.is_some());

        let history = store.history(&"a".to_string(), &global).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].match_id.as_deref(), Some("m1"));
        assert_eq!(history[0].previous, prior());

        let board = store.leaderboard(&global, 10).await.unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].player_id, "a");
        assert_eq!(board[1].position, 2);
    }

    #[tokio::test]
    async fn test_replay_is_detected() {
        let store = SqliteRatingStore::memory(prior()).await.unwrap();
        let new = SkillRating::new(1600.0, 450.0);
        store
            .commit(match_commit("m1", vec![update("a", Some("m1"), 0, new, Some(true))]))
            .await
            .unwrap();

        let outcome = store
            .commit(match_commit("m1", vec![update("a", Some("m1"), 1, new, Some(true))]))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::AlreadyProcessed);
        let history = store
            .history(&"a".to_string(), &"global".to_string())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_commit_rolls_back() {
        let store = SqliteRatingStore::memory(prior()).await.unwrap();
        let global = "global".to_string();
        store
            .commit(match_commit(
                "m1",
                vec![update("a", Some("m1"), 0, SkillRating::new(1600.0, 450.0), Some(true))],
            ))
            .await
            .unwrap();

        let err = store
            .commit(match_commit(
                "m2",
                vec![
                    update("b", Some("m2"), 0, SkillRating::new(1450.0, 450.0), Some(true)),
                    update("a", Some("m2"), 0, SkillRating::new(1550.0, 450.0), Some(false)),
                ],
            ))
            .await
            .unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Transient);

        assert!(!store.has_processed(&"m2".to_string()).await.unwrap());
        let b = store.current_rating(&"b".to_string(), &global).await.unwrap();
        assert_eq!(b.version, 0);
        assert!(store.history(&"b".to_string(), &global).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decay_commit_keeps_game_tallies() {
        let store = SqliteRatingStore::memory(prior()).await.unwrap();
        let global = "global".to_string();
        store
            .commit(match_commit(
                "m1",
                vec![update("a", Some("m1"), 0, SkillRating::new(1600.0, 100.0), Some(true))],
            ))
            .await
            .unwrap();
        let before = store.current_rating(&"a".to_string(), &global).await.unwrap();

        store
            .commit(RatingCommit {
                cause: UpdateCause::Decay,
                leaderboard: global.clone(),
                updates: vec![update("a", None, 1, SkillRating::new(1600.0, 120.0), None)],
            })
            .await
            .unwrap();

        let after = store.current_rating(&"a".to_string(), &global).await.unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.total_games, 1);
        assert_eq!(after.last_played_at, before.last_played_at);
        assert_eq!(after.rating.uncertainty, 120.0);

        let history = store.history(&"a".to_string(), &global).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].match_id.is_none());
    }

    #[tokio::test]
    async fn test_recompute_and_listing() {
        let store = SqliteRatingStore::memory(prior()).await.unwrap();
        let global = "global".to_string();
        store
            .commit(match_commit(
                "m1",
                vec![
                    update("a", Some("m1"), 0, SkillRating::new(1600.0, 300.0), Some(true)),
                    update("b", Some("m1"), 0, SkillRating::new(1500.0, 50.0), Some(false)),
                ],
            ))
            .await
            .unwrap();

        // k = 3: b (1350) ahead of a (700)
        let board = store.leaderboard(&global, 10).await.unwrap();
        assert_eq!(board[0].player_id, "b");

        assert_eq!(store.recompute_leaderboard(&global, 0.0).await.unwrap(), 2);
        let board = store.leaderboard(&global, 10).await.unwrap();
        assert_eq!(board[0].player_id, "a");

        assert_eq!(store.leaderboards().await.unwrap(), vec![global.clone()]);
        assert_eq!(store.players(&global).await.unwrap().len(), 2);
        assert!(store.ping().await.is_ok());
    }
}
