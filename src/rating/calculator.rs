//! Rating calculator trait and the TrueSkill implementation
//!
//! The calculator is a pure function over its arguments: it validates the
//! match shape, runs the team update and applies the uncertainty guard rails.
//! It never reads or writes rating state.

use crate::config::RatingConfig;
use crate::error::RatingServiceError;
use crate::rating::trueskill;
use crate::types::{PlayerId, SkillRating};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Priors for one team, in roster order
pub type TeamPriors = Vec<(PlayerId, SkillRating)>;

/// Result of a rating calculation
#[derive(Debug, Clone)]
pub struct RatingCalculationResult {
    /// Posterior for every participant, and nobody else
    pub posteriors: HashMap<PlayerId, SkillRating>,
    /// TrueSkill match quality, reported for two-team matches only
    pub match_quality: Option<f64>,
}

/// Trait for calculating posterior ratings after a match
pub trait RatingCalculator: Send + Sync {
    /// Compute posteriors for every participant.
    ///
    /// # Arguments
    /// * `leaderboard` - Rating pool the match was played on
    /// * `teams` - Priors per team
    /// * `ranks` - Placement per team, lower is better, equal ranks tie
    fn update(
        &self,
        leaderboard: &str,
        teams: &[TeamPriors],
        ranks: &[u32],
    ) -> crate::error::Result<RatingCalculationResult>;

    /// Prior for players without a stored rating
    fn initial_rating(&self) -> SkillRating;

    fn config(&self) -> &RatingConfig;
}

/// TrueSkill rating calculator
#[derive(Debug, Clone)]
pub struct TrueSkillCalculator {
    config: RatingConfig,
}

impl TrueSkillCalculator {
    pub fn new(config: RatingConfig) -> crate::error::Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn validate_input(&self, teams: &[TeamPriors], ranks: &[u32]) -> crate::error::Result<()> {
        let invalid = |reason: String| -> anyhow::Error {
            RatingServiceError::InvalidRatingInput { reason }.into()
        };

        if teams.len() < 2 {
            return Err(invalid(format!(
                "at least two teams are required, got {}",
                teams.len()
            )));
        }
        if ranks.len() != teams.len() {
            return Err(invalid(format!(
                "{} ranks given for {} teams",
                ranks.len(),
                teams.len()
            )));
        }

        let mut seen = HashSet::new();
        for (index, team) in teams.iter().enumerate() {
            if team.is_empty() {
                return Err(invalid(format!("team {} is empty", index)));
            }
            for (player_id, prior) in team {
                if !seen.insert(player_id.as_str()) {
                    return Err(invalid(format!(
                        "player {} appears in more than one slot",
                        player_id
                    )));
                }
                if !prior.is_finite() || prior.uncertainty <= 0.0 {
                    return Err(invalid(format!(
                        "player {} has an unusable prior {:?}",
                        player_id, prior
                    )));
                }
            }
        }

        Ok(())
    }
}

impl RatingCalculator for TrueSkillCalculator {
    fn update(
        &self,
        leaderboard: &str,
        teams: &[TeamPriors],
        ranks: &[u32],
    ) -> crate::error::Result<RatingCalculationResult> {
        self.validate_input(teams, ranks)?;

        let priors: Vec<Vec<SkillRating>> = teams
            .iter()
            .map(|team| team.iter().map(|(_, rating)| *rating).collect())
            .collect();

        let computed = trueskill::rate(&priors, ranks, &self.config);

        let mut posteriors = HashMap::with_capacity(priors.iter().map(Vec::len).sum());
        for (team, team_posteriors) in teams.iter().zip(computed) {
            for ((player_id, prior), posterior) in team.iter().zip(team_posteriors) {
                if !posterior.is_finite() {
                    return Err(RatingServiceError::InvalidRatingInput {
                        reason: format!("update for player {} did not converge", player_id),
                    }
                    .into());
                }
                let uncertainty = self
                    .config
                    .clamp_uncertainty(posterior.uncertainty.min(prior.uncertainty));
                posteriors.insert(
                    player_id.clone(),
                    SkillRating::new(posterior.mean, uncertainty),
                );
            }
        }

        let match_quality = match priors.as_slice() {
            [a, b] => Some(trueskill::match_quality(a, b, &self.config)),
            _ => None,
        };

        debug!(
            leaderboard = leaderboard,
            players = posteriors.len(),
            match_quality = ?match_quality,
            "Computed rating update"
        );

        Ok(RatingCalculationResult {
            posteriors,
            match_quality,
        })
    }

    fn initial_rating(&self) -> SkillRating {
        self.config.initial_rating()
    }

    fn config(&self) -> &RatingConfig {
        &self.config
    }
}
