//! Inbound match-result schema and its validation
//!
//! Each team reports its result as exactly one of `rank` (lower is better),
//! `score` (higher is better) or `outcome` (`VICTORY`, `DEFEAT`, `DRAW`, ...).
//! Whatever the form, validation reduces it to a rank per team.

use crate::error::{RatingServiceError, Result};
use crate::types::{GameOutcome, MatchResult, Team};
use serde::Deserialize;

/// Identifier that may arrive as a JSON string or a non-negative integer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Text(String),
    Number(u64),
}

impl WireId {
    pub fn into_string(self) -> String {
        match self {
            WireId::Text(text) => text,
            WireId::Number(number) => number.to_string(),
        }
    }
}

/// Match result as published by the game server
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResultMessage {
    #[serde(alias = "game_id", alias = "match_id")]
    pub match_id: WireId,
    #[serde(alias = "rating_type")]
    pub leaderboard: String,
    pub teams: Vec<TeamResultMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamResultMessage {
    #[serde(alias = "player_ids")]
    pub players: Vec<WireId>,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub outcome: Option<GameOutcome>,
}

enum TeamResult {
    Rank(i64),
    Score(f64),
    Outcome(GameOutcome),
}

impl TeamResult {
    fn kind(&self) -> &'static str {
        match self {
            TeamResult::Rank(_) => "rank",
            TeamResult::Score(_) => "score",
            TeamResult::Outcome(_) => "outcome",
        }
    }
}

fn malformed(reason: impl Into<String>) -> anyhow::Error {
    RatingServiceError::MalformedMessage {
        reason: reason.into(),
    }
    .into()
}

impl MatchResultMessage {
    /// Deserialize a raw payload; the error is always `MalformedMessage`
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| malformed(format!("Failed to deserialize match result: {}", e)))
    }

    /// Reduce the wire form to a validated [`MatchResult`]
    pub fn validate(self) -> Result<MatchResult> {
        let match_id = self.match_id.into_string();

        let results = self
            .teams
            .iter()
            .enumerate()
            .map(|(index, team)| team_result(index, team))
            .collect::<Result<Vec<_>>>()?;

        if let Some(first) = results.first() {
            if let Some(other) = results.iter().find(|r| r.kind() != first.kind()) {
                return Err(malformed(format!(
                    "teams mix {} and {} results",
                    first.kind(),
                    other.kind()
                )));
            }
        }

        let ranks = ranks_from_results(&results)?;

        let teams = self
            .teams
            .into_iter()
            .zip(ranks)
            .map(|(team, rank)| Team {
                players: team.players.into_iter().map(WireId::into_string).collect(),
                rank,
                outcome: team.outcome,
            })
            .collect();

        let result = MatchResult {
            match_id,
            leaderboard: self.leaderboard,
            teams,
        };
        result.check_invariants().map_err(malformed)?;
        Ok(result)
    }
}

fn team_result(index: usize, team: &TeamResultMessage) -> Result<TeamResult> {
    match (team.rank, team.score, team.outcome) {
        (Some(rank), None, None) => Ok(TeamResult::Rank(rank)),
        (None, Some(score), None) => Ok(TeamResult::Score(score)),
        (None, None, Some(outcome)) => Ok(TeamResult::Outcome(outcome)),
        (None, None, None) => Err(malformed(format!("team {} reports no result", index))),
        _ => Err(malformed(format!(
            "team {} reports more than one of rank, score and outcome",
            index
        ))),
    }
}

fn ranks_from_results(results: &[TeamResult]) -> Result<Vec<u32>> {
    let mut ranks = Vec::with_capacity(results.len());
    for result in results {
        let rank = match result {
            TeamResult::Rank(rank) => u32::try_from(*rank)
                .map_err(|_| malformed(format!("rank {} is out of range", rank)))?,
            TeamResult::Score(score) => {
                if !score.is_finite() {
                    return Err(malformed("team score must be finite"));
                }
                // Dense ranking: number of distinct better scores
                let mut better: Vec<f64> = results
                    .iter()
                    .filter_map(|r| match r {
                        TeamResult::Score(other) if other > score => Some(*other),
                        _ => None,
                    })
                    .collect();
                better.sort_by(|a, b| a.total_cmp(b));
                better.dedup();
                better.len() as u32
            }
            TeamResult::Outcome(_) => return outcome_ranks(results),
        };
        ranks.push(rank);
    }
    Ok(ranks)
}

fn outcome_ranks(results: &[TeamResult]) -> Result<Vec<u32>> {
    let outcomes: Vec<GameOutcome> = results
        .iter()
        .filter_map(|r| match r {
            TeamResult::Outcome(outcome) => Some(*outcome),
            _ => None,
        })
        .collect();

    if let Some(bad) = outcomes
        .iter()
        .find(|o| matches!(o, GameOutcome::Unknown | GameOutcome::Conflicting))
    {
        return Err(malformed(format!("team outcome {:?} cannot be rated", bad)));
    }

    let is_draw = |o: &GameOutcome| matches!(o, GameOutcome::Draw | GameOutcome::MutualDraw);
    if outcomes.iter().all(is_draw) {
        return Ok(vec![0; outcomes.len()]);
    }
    if outcomes.iter().any(is_draw) {
        return Err(malformed("draw reported alongside a decisive outcome"));
    }

    let victories = outcomes
        .iter()
        .filter(|o| **o == GameOutcome::Victory)
        .count();
    if victories == 0 || victories == outcomes.len() {
        return Err(malformed(
            "a decisive match needs at least one victory and one defeat",
        ));
    }

    Ok(outcomes
        .iter()
        .map(|o| if *o == GameOutcome::Victory { 0 } else { 1 })
        .collect())
}
