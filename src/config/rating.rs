//! Rating system configuration

use crate::error::RatingServiceError;
use crate::types::SkillRating;
use serde::{Deserialize, Serialize};

/// TrueSkill parameters plus the numeric guard rails applied to posteriors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingConfig {
    /// Mean assigned to a player on first appearance
    pub initial_mean: f64,
    /// Uncertainty assigned to a player on first appearance
    pub initial_uncertainty: f64,
    /// Performance noise; the skill gap giving ~76% win chance
    pub beta: f64,
    /// Dynamics added to the prior variance before every match
    pub tau: f64,
    /// Probability of a draw between two evenly matched teams
    pub draw_probability: f64,
    pub min_uncertainty: f64,
    pub max_uncertainty: f64,
    /// Leaderboard score is `mean - conservative_k * uncertainty`
    pub conservative_k: f64,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self::faf_default()
    }
}

impl RatingConfig {
    /// Parameters tuned for a 1500-centred ladder
    pub fn faf_default() -> Self {
        Self {
            initial_mean: 1500.0,
            initial_uncertainty: 500.0,
            beta: 240.0,
            tau: 10.0,
            draw_probability: 0.10,
            min_uncertainty: 30.0,
            max_uncertainty: 500.0,
            conservative_k: 3.0,
        }
    }

    /// The textbook TrueSkill environment (mu = 25, sigma = mu / 3)
    pub fn trueskill_standard() -> Self {
        let mean = 25.0;
        let uncertainty = mean / 3.0;
        Self {
            initial_mean: mean,
            initial_uncertainty: uncertainty,
            beta: uncertainty / 2.0,
            tau: uncertainty / 100.0,
            draw_probability: 0.10,
            min_uncertainty: 0.5,
            max_uncertainty: uncertainty,
            conservative_k: 3.0,
        }
    }

    /// Prior for a player without a stored rating
    pub fn initial_rating(&self) -> SkillRating {
        SkillRating::new(self.initial_mean, self.initial_uncertainty)
    }

    /// Clamp an uncertainty into the configured bounds
    pub fn clamp_uncertainty(&self, uncertainty: f64) -> f64 {
        uncertainty.clamp(self.min_uncertainty, self.max_uncertainty)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |message: &str| -> anyhow::Error {
            RatingServiceError::ConfigurationError {
                message: message.to_string(),
            }
            .into()
        };

        if !self.initial_mean.is_finite() {
            return Err(invalid("Initial mean must be finite"));
        }
        if !(self.beta > 0.0 && self.beta.is_finite()) {
            return Err(invalid("Beta must be positive"));
        }
        if !(self.tau >= 0.0 && self.tau.is_finite()) {
            return Err(invalid("Tau must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.draw_probability) {
            return Err(invalid("Draw probability must be in [0, 1)"));
        }
        if !(self.min_uncertainty > 0.0) {
            return Err(invalid("Minimum uncertainty must be positive"));
        }
        if !(self.max_uncertainty >= self.min_uncertainty && self.max_uncertainty.is_finite()) {
            return Err(invalid(
                "Maximum uncertainty must be finite and not below the minimum",
            ));
        }
        if self.initial_uncertainty < self.min_uncertainty
            || self.initial_uncertainty > self.max_uncertainty
        {
            return Err(invalid(
                "Initial uncertainty must lie within [min_uncertainty, max_uncertainty]",
            ));
        }
        if !(self.conservative_k >= 0.0 && self.conservative_k.is_finite()) {
            return Err(invalid("Conservative k must be non-negative"));
        }

        Ok(())
    }
}
