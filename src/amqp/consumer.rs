//! AMQP consumer feeding the ingest gate
//!
//! Broker deliveries are forwarded untouched into the bounded delivery
//! channel. Settlement happens later, through [`AmqpAcknowledger`], once the
//! pipeline has decided what to do with the match.

use crate::error::{RatingServiceError, Result};
use crate::ingest::delivery::{Acknowledger, Delivery};
use crate::utils::generate_consumer_tag;
use amqprs::{
    channel::{
        BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicNackArguments,
        BasicQosArguments, BasicRejectArguments, Channel,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Settles one broker delivery on the channel it arrived on
pub struct AmqpAcknowledger {
    channel: Channel,
    delivery_tag: u64,
}

impl AmqpAcknowledger {
    pub fn new(channel: Channel, delivery_tag: u64) -> Self {
        Self {
            channel,
            delivery_tag,
        }
    }
}

fn settle_error(action: &str, delivery_tag: u64, e: impl std::fmt::Display) -> anyhow::Error {
    RatingServiceError::AmqpConnectionFailed {
        message: format!("Failed to {} delivery {}: {}", action, delivery_tag, e),
    }
    .into()
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.channel
            .basic_ack(BasicAckArguments::new(self.delivery_tag, false))
            .await
            .map_err(|e| settle_error("ack", self.delivery_tag, e))
    }

    async fn reject(&self) -> Result<()> {
        self.channel
            .basic_reject(BasicRejectArguments::new(self.delivery_tag, false))
            .await
            .map_err(|e| settle_error("reject", self.delivery_tag, e))
    }

    async fn requeue(&self) -> Result<()> {
        self.channel
            .basic_nack(BasicNackArguments::new(self.delivery_tag, false, true))
            .await
            .map_err(|e| settle_error("requeue", self.delivery_tag, e))
    }
}

/// Subscription on the match-result queue
pub struct MatchResultConsumer {
    channel: Channel,
    consumer_tag: String,
}

impl MatchResultConsumer {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            consumer_tag: generate_consumer_tag("rating-service"),
        }
    }

    /// Limit unacknowledged deliveries, then start forwarding into `deliveries`
    pub async fn start_consuming(
        &self,
        queue_name: &str,
        prefetch_count: u16,
        deliveries: mpsc::Sender<Delivery>,
    ) -> Result<()> {
        self.channel
            .basic_qos(BasicQosArguments::new(0, prefetch_count, false))
            .await
            .map_err(|e| RatingServiceError::AmqpConnectionFailed {
                message: format!("Failed to set prefetch: {}", e),
            })?;

        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);
        self.channel
            .basic_consume(DeliveryForwarder { deliveries }, args)
            .await
            .map_err(|e| RatingServiceError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!(
            queue = queue_name,
            consumer_tag = %self.consumer_tag,
            prefetch_count,
            "Started consuming match results"
        );
        Ok(())
    }

    /// Stop new deliveries; settled-later deliveries stay valid on the channel
    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);

        self.channel.basic_cancel(args).await.map_err(|e| {
            RatingServiceError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            }
        })?;

        info!(consumer_tag = %self.consumer_tag, "Stopped consuming match results");
        Ok(())
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

struct DeliveryForwarder {
    deliveries: mpsc::Sender<Delivery>,
}

#[async_trait]
impl AsyncConsumer for DeliveryForwarder {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        debug!(
            delivery_tag,
            routing_key = %deliver.routing_key(),
            size = content.len(),
            "Match result delivered"
        );

        let acker = AmqpAcknowledger::new(channel.clone(), delivery_tag);
        let mut delivery = Delivery::new(content, delivery_tag, Box::new(acker));
        delivery.redelivered = deliver.redelivered();

        // Blocks while the gate is saturated, which holds back the broker
        if let Err(mpsc::error::SendError(delivery)) = self.deliveries.send(delivery).await {
            warn!(delivery_tag, "Pipeline is gone, returning delivery to the broker");
            if let Err(e) = delivery.acker.requeue().await {
                error!(delivery_tag, "Failed to requeue delivery: {}", e);
            }
        }
    }
}
