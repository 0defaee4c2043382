//! AMQP connection management with retry logic

use crate::config::AmqpConfig;
use crate::error::{RatingServiceError, Result};
use crate::utils::backoff_delay;
use amqprs::channel::Channel;
use amqprs::connection::{Connection, OpenConnectionArguments};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Wrapper around AMQP connection with additional metadata
pub struct AmqpConnection {
    connection: Connection,
    config: AmqpConfig,
}

impl AmqpConnection {
    /// Create a new AMQP connection with retry logic
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let connection = Self::connect_with_retry(&config).await?;

        Ok(Self { connection, config })
    }

    /// Attempt to connect with exponential backoff retry
    async fn connect_with_retry(config: &AmqpConfig) -> Result<Connection> {
        let base = Duration::from_millis(config.retry_delay_ms);
        let mut attempt = 0;

        loop {
            match Self::try_connect(config).await {
                Ok(connection) => {
                    info!(
                        host = %config.host,
                        port = config.port,
                        vhost = %config.vhost,
                        "Connected to AMQP broker"
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        error!(
                            "Failed to connect to AMQP after {} retries",
                            config.max_retries
                        );
                        return Err(RatingServiceError::AmqpConnectionFailed {
                            message: format!("Max retries exceeded: {}", e),
                        }
                        .into());
                    }

                    let delay = backoff_delay(attempt, base, Duration::from_secs(30));
                    warn!(
                        "AMQP connection attempt {} failed: {}. Retrying in {:?}",
                        attempt, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Single connection attempt, bounded by the connection timeout
    async fn try_connect(config: &AmqpConfig) -> Result<Connection> {
        let mut args = OpenConnectionArguments::new(
            &config.host,
            config.port,
            &config.username,
            &config.password,
        );
        args.virtual_host(&config.vhost);

        let limit = Duration::from_millis(config.connection_timeout_ms);
        match timeout(limit, Connection::open(&args)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(RatingServiceError::AmqpConnectionFailed {
                message: e.to_string(),
            }
            .into()),
            Err(_) => Err(RatingServiceError::AmqpConnectionFailed {
                message: format!("timed out after {:?}", limit),
            }
            .into()),
        }
    }

    /// Open a fresh channel on this connection
    pub async fn open_channel(&self) -> Result<Channel> {
        self.connection.open_channel(None).await.map_err(|e| {
            RatingServiceError::AmqpConnectionFailed {
                message: format!("Failed to open channel: {}", e),
            }
            .into()
        })
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.connection.clone().close().await.map_err(|e| {
            RatingServiceError::AmqpConnectionFailed {
                message: format!("Failed to close AMQP connection: {}", e),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_broker_exhausts_retries() {
        let config = AmqpConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            max_retries: 1,
            retry_delay_ms: 1,
            connection_timeout_ms: 500,
            ..AmqpConfig::default()
        };

        let err = match AmqpConnection::new(config).await {
            Ok(_) => panic!("nothing listens on port 1"),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<RatingServiceError>(),
            Some(RatingServiceError::AmqpConnectionFailed { .. })
        ));
    }
}
