//! Broker topology and outbound wire format

use crate::config::AmqpSettings;
use crate::error::{RatingServiceError, Result};
use crate::types::RatingUpdated;
use amqprs::channel::{Channel, ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments};
use tracing::info;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Persistent delivery mode for published messages
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Exchange, queue and binding the service consumes from and publishes to
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
    pub notification_key: String,
}

impl Topology {
    pub fn from_settings(settings: &AmqpSettings) -> Self {
        Self {
            exchange: settings.exchange_name.clone(),
            queue: settings.queue_name.clone(),
            binding_key: settings.routing_key.clone(),
            notification_key: settings.notification_routing_key.clone(),
        }
    }

    /// Declare the durable topic exchange and queue, then bind them
    pub async fn declare(&self, channel: &Channel) -> Result<()> {
        let exchange = ExchangeDeclareArguments::new(&self.exchange, "topic")
            .durable(true)
            .finish();
        channel
            .exchange_declare(exchange)
            .await
            .map_err(|e| amqp_error(format!("Failed to declare exchange {}: {}", self.exchange, e)))?;

        let queue = QueueDeclareArguments::new(&self.queue)
            .durable(true)
            .auto_delete(false)
            .finish();
        channel
            .queue_declare(queue)
            .await
            .map_err(|e| amqp_error(format!("Failed to declare queue {}: {}", self.queue, e)))?;

        channel
            .queue_bind(QueueBindArguments::new(
                &self.queue,
                &self.exchange,
                &self.binding_key,
            ))
            .await
            .map_err(|e| amqp_error(format!("Failed to bind queue {}: {}", self.queue, e)))?;

        info!(
            exchange = %self.exchange,
            queue = %self.queue,
            binding_key = %self.binding_key,
            "Declared broker topology"
        );
        Ok(())
    }
}

fn amqp_error(message: String) -> anyhow::Error {
    RatingServiceError::AmqpConnectionFailed { message }.into()
}

/// Serialize a rating change notification
pub fn encode_rating_updated(event: &RatingUpdated) -> Result<Vec<u8>> {
    serde_json::to_vec(event).map_err(|e| {
        RatingServiceError::InternalError {
            message: format!("Failed to serialize rating update: {}", e),
        }
        .into()
    })
}
