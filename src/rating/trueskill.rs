//! TrueSkill team update backed by `skillratings`
//!
//! Maps our ratings and ranks into the library's multi-team update. Inputs
//! are assumed to be validated by the calculator; no clamping happens here.

use crate::config::RatingConfig;
use crate::types::SkillRating;
use skillratings::trueskill::{
    match_quality_two_teams, trueskill_multi_team, TrueSkillConfig, TrueSkillRating,
};
use skillratings::MultiTeamOutcome;

fn library_config(config: &RatingConfig) -> TrueSkillConfig {
    TrueSkillConfig {
        draw_probability: config.draw_probability,
        beta: config.beta,
        default_dynamics: config.tau,
    }
}

fn to_library(rating: &SkillRating) -> TrueSkillRating {
    TrueSkillRating {
        rating: rating.mean,
        uncertainty: rating.uncertainty,
    }
}

fn to_library_team(team: &[SkillRating]) -> Vec<TrueSkillRating> {
    team.iter().map(to_library).collect()
}

/// Compute posterior skills for every player.
///
/// `teams[i]` holds the priors for team `i` and `ranks[i]` its placement
/// (lower is better, equal ranks tie). The result mirrors the shape of `teams`.
pub fn rate(teams: &[Vec<SkillRating>], ranks: &[u32], config: &RatingConfig) -> Vec<Vec<SkillRating>> {
    let library_teams: Vec<Vec<TrueSkillRating>> =
        teams.iter().map(|team| to_library_team(team)).collect();

    let teams_and_ranks: Vec<(&[TrueSkillRating], MultiTeamOutcome)> = library_teams
        .iter()
        .zip(ranks)
        .map(|(team, &rank)| (team.as_slice(), MultiTeamOutcome::new(rank as usize)))
        .collect();

    trueskill_multi_team(&teams_and_ranks, &library_config(config))
        .into_iter()
        .map(|team| {
            team.into_iter()
                .map(|rating| SkillRating::new(rating.rating, rating.uncertainty))
                .collect()
        })
        .collect()
}

/// Probability-of-draw style quality of a two-team match, in `(0, 1]`
pub fn match_quality(team_a: &[SkillRating], team_b: &[SkillRating], config: &RatingConfig) -> f64 {
    match_quality_two_teams(
        &to_library_team(team_a),
        &to_library_team(team_b),
        &library_config(config),
    )
}
