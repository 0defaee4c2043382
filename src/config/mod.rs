//! Configuration management for the rating service
//!
//! This module handles configuration loading from TOML files and environment
//! variables, validation, and default values.

pub mod amqp;
pub mod app;
pub mod rating;

// Re-export commonly used types
pub use amqp::AmqpConfig;
pub use app::{
    validate_config, AmqpSettings, AppConfig, DatabaseSettings, MaintenanceSettings,
    ProcessingSettings, ServiceSettings, MAX_INACTIVITY_SECONDS,
};
pub use rating::RatingConfig;
