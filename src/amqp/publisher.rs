//! Rating change notifications

use crate::amqp::messages::{encode_rating_updated, CONTENT_TYPE_JSON, DELIVERY_MODE_PERSISTENT};
use crate::error::{RatingServiceError, Result};
use crate::types::RatingUpdated;
use crate::utils::backoff_delay;
use amqprs::{
    channel::{BasicPublishArguments, Channel},
    BasicProperties,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Trait for publishing rating change notifications
#[async_trait]
pub trait RatingPublisher: Send + Sync {
    async fn publish_rating_updated(&self, event: RatingUpdated) -> Result<()>;
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub routing_key: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: "faf-lobby".to_string(),
            routing_key: "success.rating.update".to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

/// AMQP-based notification publisher
pub struct AmqpRatingPublisher {
    channel: Channel,
    config: PublisherConfig,
}

impl AmqpRatingPublisher {
    pub fn new(channel: Channel, config: PublisherConfig) -> Self {
        Self { channel, config }
    }

    async fn try_publish(&self, payload: Vec<u8>, message_id: &str) -> Result<()> {
        let args = BasicPublishArguments::new(&self.config.exchange, &self.config.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(message_id)
            .with_content_type(CONTENT_TYPE_JSON)
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| RatingServiceError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl RatingPublisher for AmqpRatingPublisher {
    async fn publish_rating_updated(&self, event: RatingUpdated) -> Result<()> {
        let payload = encode_rating_updated(&event)?;
        let message_id = format!(
            "{}:{}:{}",
            event.rating_type,
            event.player_id,
            event.match_id.as_deref().unwrap_or("decay")
        );
        let base = Duration::from_millis(self.config.retry_delay_ms);
        let mut attempt = 0;

        loop {
            match self.try_publish(payload.clone(), &message_id).await {
                Ok(()) => {
                    debug!(message_id = %message_id, "Published rating update");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt, base, Duration::from_secs(5));
                    warn!(
                        "Publish attempt {} failed for {}: {}. Retrying in {:?}",
                        attempt, message_id, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// In-process publisher that records what it was given
#[derive(Debug, Default)]
pub struct MockRatingPublisher {
    published: Mutex<Vec<RatingUpdated>>,
    failing: AtomicBool,
}

impl MockRatingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<RatingUpdated> {
        self.published
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Make every publish fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.published.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl RatingPublisher for MockRatingPublisher {
    async fn publish_rating_updated(&self, event: RatingUpdated) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RatingServiceError::AmqpConnectionFailed {
                message: "publisher is failing".to_string(),
            }
            .into());
        }
        self.published
            .lock()
            .map_err(|_| RatingServiceError::InternalError {
                message: "Failed to acquire published events lock".to_string(),
            })?
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(player: &str) -> RatingUpdated {
        RatingUpdated {
            player_id: player.to_string(),
            rating_type: "global".to_string(),
            new_rating_mean: 1550.0,
            new_rating_deviation: 480.0,
            match_id: Some("m1".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_publisher_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.routing_key, "success.rating.update");
        assert_eq!(config.max_retries, 3);
    }

    #[tokio::test]
    async fn test_mock_publisher_records_and_fails_on_demand() {
        let publisher = MockRatingPublisher::new();
        publisher.publish_rating_updated(event("a")).await.unwrap();
        assert_eq!(publisher.published().len(), 1);

        publisher.set_failing(true);
        assert!(publisher.publish_rating_updated(event("b")).await.is_err());
        assert_eq!(publisher.published().len(), 1);

        publisher.clear();
        assert!(publisher.published().is_empty());
    }
}
