//! Rating model: TrueSkill team updates and inactivity decay
//!
//! This module is pure computation. Priors come in, posteriors come out, and
//! nothing here touches storage or shared state.

pub mod calculator;
pub mod decay;
pub mod trueskill;

// Re-export commonly used types
pub use calculator::{RatingCalculationResult, RatingCalculator, TeamPriors, TrueSkillCalculator};
pub use decay::DecayPolicy;
