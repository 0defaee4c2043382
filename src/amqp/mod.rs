//! AMQP integration for the rating service
//!
//! This module owns the broker side: the connection, the match-result
//! subscription feeding the ingest gate, and rating change notifications.

pub mod connection;
pub mod consumer;
pub mod messages;
pub mod publisher;

pub use connection::AmqpConnection;
pub use consumer::{AmqpAcknowledger, MatchResultConsumer};
pub use messages::Topology;
pub use publisher::{AmqpRatingPublisher, MockRatingPublisher, PublisherConfig, RatingPublisher};
