//! Rating Service - skill rating pipeline for finished matches
//!
//! This crate consumes match results from an AMQP broker, updates player
//! TrueSkill ratings per leaderboard with per-player ordering and atomic
//! commits, and keeps leaderboards, rating history and inactivity decay.

pub mod amqp;
pub mod config;
pub mod error;
pub mod ingest;
pub mod maintenance;
pub mod metrics;
pub mod ordering;
pub mod pipeline;
pub mod rating;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{RatingServiceError, Result};
pub use types::*;

// Re-export key components
pub use rating::{RatingCalculator, TrueSkillCalculator};
pub use service::RatingService;
pub use store::RatingStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
