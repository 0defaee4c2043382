//! Uncertainty decay for inactive players

use crate::types::{PlayerRatingRecord, SkillRating};
use chrono::{DateTime, Duration, Utc};

/// How much doubt is added to stale ratings on each maintenance run
#[derive(Debug, Clone, PartialEq)]
pub struct DecayPolicy {
    /// Players whose last game is older than this are decayed
    pub inactivity: Duration,
    /// Standard deviation added in quadrature per run
    pub decay_per_run: f64,
    pub max_uncertainty: f64,
}

impl DecayPolicy {
    /// Whether the record is eligible for decay at `now`.
    ///
    /// Records that never played, or that are already at the ceiling, are skipped.
    pub fn applies_to(&self, record: &PlayerRatingRecord, now: DateTime<Utc>) -> bool {
        match record.last_played_at {
            Some(last_played) => {
                now - last_played > self.inactivity
                    && record.rating.uncertainty < self.max_uncertainty
            }
            None => false,
        }
    }

    /// `sigma' = min(sqrt(sigma^2 + delta^2), max)`; the mean is unchanged
    pub fn apply(&self, rating: SkillRating) -> SkillRating {
        let widened = rating.uncertainty.hypot(self.decay_per_run);
        SkillRating::new(rating.mean, widened.min(self.max_uncertainty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DecayPolicy {
        DecayPolicy {
            inactivity: Duration::days(30),
            decay_per_run: 40.0,
            max_uncertainty: 500.0,
        }
    }

    fn record(uncertainty: f64, last_played_at: Option<DateTime<Utc>>) -> PlayerRatingRecord {
        PlayerRatingRecord {
            last_played_at,
            total_games: 12,
            ..PlayerRatingRecord::unrated(
                "p1".to_string(),
                "global".to_string(),
                SkillRating::new(1700.0, uncertainty),
            )
        }
    }

    #[test]
    fn test_decay_widens_uncertainty_only() {
        let decayed = policy().apply(SkillRating::new(1700.0, 30.0));
        assert_eq!(decayed.mean, 1700.0);
        assert!((decayed.uncertainty - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_decay_respects_ceiling() {
        let decayed = policy().apply(SkillRating::new(1700.0, 499.0));
        assert_eq!(decayed.uncertainty, 500.0);
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        let policy = policy();

        assert!(policy.applies_to(&record(80.0, Some(now - Duration::days(45))), now));
        assert!(!policy.applies_to(&record(80.0, Some(now - Duration::days(3))), now));
        assert!(!policy.applies_to(&record(80.0, None), now));
        assert!(!policy.applies_to(&record(500.0, Some(now - Duration::days(45))), now));
    }
}
