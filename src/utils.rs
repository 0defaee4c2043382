//! Utility functions for the rating service

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique consumer tag for a broker subscription
pub fn generate_consumer_tag(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Lossy, bounded preview of a raw payload for log lines
pub fn payload_preview(payload: &[u8], limit: usize) -> String {
    let preview_len = std::cmp::min(limit, payload.len());
    let preview = String::from_utf8_lossy(&payload[..preview_len]);
    if payload.len() > limit {
        format!("{}…", preview)
    } else {
        preview.into_owned()
    }
}
