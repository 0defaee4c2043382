//! Service layer for the rating service
//!
//! This module contains the service state, component wiring, lifecycle and
//! health checks for the production process.

pub mod app;
pub mod health;

pub use app::{RatingService, MEMORY_DATABASE_URL};
pub use health::{HealthCheck, HealthStatus, ServiceProbe};
