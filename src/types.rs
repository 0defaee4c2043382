//! Common types used throughout the rating service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Unique identifier for players
pub type PlayerId = String;

/// Name of a rating pool, e.g. "global" or "ladder_1v1"
pub type LeaderboardId = String;

/// Unique identifier for a finished match, used for deduplication
pub type MatchId = String;

/// Skill distribution for one player on one leaderboard
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkillRating {
    pub mean: f64,
    pub uncertainty: f64,
}

impl SkillRating {
    pub fn new(mean: f64, uncertainty: f64) -> Self {
        Self { mean, uncertainty }
    }

    /// Rating that ranks a player `k` standard deviations below their mean
    pub fn conservative_estimate(&self, k: f64) -> f64 {
        self.mean - k * self.uncertainty
    }

    pub fn is_finite(&self) -> bool {
        self.mean.is_finite() && self.uncertainty.is_finite()
    }
}

impl std::fmt::Display for SkillRating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}±{:.2}", self.mean, self.uncertainty)
    }
}

/// Current stored state for a player on a leaderboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRatingRecord {
    pub player_id: PlayerId,
    pub leaderboard: LeaderboardId,
    pub rating: SkillRating,
    /// 0 means the player has never been persisted on this leaderboard
    pub version: u64,
    pub total_games: u64,
    pub won_games: u64,
    pub last_played_at: Option<DateTime<Utc>>,
}

impl PlayerRatingRecord {
    /// Record for a player seen for the first time
    pub fn unrated(player_id: PlayerId, leaderboard: LeaderboardId, prior: SkillRating) -> Self {
        Self {
            player_id,
            leaderboard,
            rating: prior,
            version: 0,
            total_games: 0,
            won_games: 0,
            last_played_at: None,
        }
    }
}

/// Per-team outcome as reported by the game server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameOutcome {
    Victory,
    Defeat,
    Draw,
    MutualDraw,
    Unknown,
    Conflicting,
}

/// One team in a finished match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub players: Vec<PlayerId>,
    /// Placement, 0 is best; equal ranks mean the teams tied
    pub rank: u32,
    /// Outcome the game server reported, when results came in that form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<GameOutcome>,
}

/// Validated, immutable match result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_id: MatchId,
    pub leaderboard: LeaderboardId,
    pub teams: Vec<Team>,
}

impl MatchResult {
    /// All participants, in team order
    pub fn players(&self) -> impl Iterator<Item = &PlayerId> {
        self.teams.iter().flat_map(|team| team.players.iter())
    }

    pub fn player_count(&self) -> usize {
        self.teams.iter().map(|team| team.players.len()).sum()
    }

    /// Check the structural invariants every match result must satisfy
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.match_id.trim().is_empty() {
            return Err("match id cannot be empty".to_string());
        }
        if self.leaderboard.trim().is_empty() {
            return Err("leaderboard cannot be empty".to_string());
        }
        if self.teams.len() < 2 {
            return Err(format!(
                "a match needs at least two teams, got {}",
                self.teams.len()
            ));
        }

        let mut seen = HashSet::new();
        for (index, team) in self.teams.iter().enumerate() {
            if team.players.is_empty() {
                return Err(format!("team {} has no players", index));
            }
            for player in &team.players {
                if player.trim().is_empty() {
                    return Err(format!("team {} contains an empty player id", index));
                }
                if !seen.insert(player.as_str()) {
                    return Err(format!("player {} appears more than once", player));
                }
            }
        }

        Ok(())
    }

    /// Whether a team's game counts as a win.
    ///
    /// A reported outcome decides directly, so several victorious teams all
    /// win. Otherwise the team must finish strictly ahead of every other team.
    pub fn team_won(&self, team_index: usize) -> bool {
        let Some(team) = self.teams.get(team_index) else {
            return false;
        };
        if let Some(outcome) = team.outcome {
            return outcome == GameOutcome::Victory;
        }
        self.teams
            .iter()
            .enumerate()
            .all(|(i, other)| i == team_index || team.rank < other.rank)
    }
}

/// Why a rating changed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "match_id", rename_all = "snake_case")]
pub enum UpdateCause {
    Match(MatchId),
    Decay,
}

impl UpdateCause {
    pub fn match_id(&self) -> Option<&MatchId> {
        match self {
            UpdateCause::Match(id) => Some(id),
            UpdateCause::Decay => None,
        }
    }
}

/// Append-only audit record of one rating change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingHistoryEntry {
    pub player_id: PlayerId,
    pub leaderboard: LeaderboardId,
    /// `None` for decay adjustments
    pub match_id: Option<MatchId>,
    pub previous: SkillRating,
    pub new: SkillRating,
    pub timestamp: DateTime<Utc>,
}

/// Derived leaderboard row, ranked by conservative estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based position
    pub position: u32,
    pub player_id: PlayerId,
    pub rating: SkillRating,
    pub score: f64,
    pub total_games: u64,
}

/// Why a delivery was refused before reaching the rating model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    /// Payload is not a match result at all
    Deserialize,
    /// Payload parsed but violates the match invariants
    Validation,
    /// Leaderboard is not served by this instance
    Leaderboard,
    /// The rating model refused the input
    RatingInput,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Deserialize => "deserialize",
            RejectionReason::Validation => "validation",
            RejectionReason::Leaderboard => "leaderboard",
            RejectionReason::RatingInput => "rating_input",
        }
    }
}

/// Notification published after a player's rating changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingUpdated {
    pub player_id: PlayerId,
    pub rating_type: LeaderboardId,
    pub new_rating_mean: f64,
    pub new_rating_deviation: f64,
    pub match_id: Option<MatchId>,
    pub timestamp: DateTime<Utc>,
}

impl From<&RatingHistoryEntry> for RatingUpdated {
    fn from(entry: &RatingHistoryEntry) -> Self {
        Self {
            player_id: entry.player_id.clone(),
            rating_type: entry.leaderboard.clone(),
            new_rating_mean: entry.new.mean,
            new_rating_deviation: entry.new.uncertainty,
            match_id: entry.match_id.clone(),
            timestamp: entry.timestamp,
        }
    }
}
