//! Health check endpoints and monitoring
//!
//! This module provides health check functionality for the rating service,
//! including readiness and liveness probes.

use crate::amqp::AmqpConnection;
use crate::metrics::MetricsCollector;
use crate::ordering::OrderingCoordinator;
use crate::store::RatingStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::error;

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Value exported on the health gauge
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// The pieces of a running service that health checks look at
#[derive(Clone)]
pub struct ServiceProbe {
    pub service_name: String,
    pub store: Arc<dyn RatingStore>,
    pub coordinator: OrderingCoordinator,
    pub metrics: Arc<MetricsCollector>,
    pub is_running: Arc<RwLock<bool>>,
    /// Absent in dry-run mode
    pub broker: Option<Arc<AmqpConnection>>,
    pub started_at: Instant,
}

impl ServiceProbe {
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Optional error message if unhealthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Pipeline statistics for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub matches_processed: u64,
    pub matches_duplicate: u64,
    pub matches_retried: u64,
    pub pending_ordering_keys: usize,
    pub idle_workers: usize,
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(probe: &ServiceProbe) -> Result<Self> {
        let checks = vec![
            Self::check_service_running(probe).await,
            Self::check_store(probe).await,
            Self::check_broker(probe),
        ];

        let status = if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(HealthCheck {
            status,
            service: probe.service_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats: Self::gather_service_stats(probe),
        })
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(probe: &ServiceProbe) -> Result<HealthStatus> {
        if probe.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness check - running, store reachable, broker connected
    pub async fn readiness_check(probe: &ServiceProbe) -> Result<HealthStatus> {
        if !probe.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }
        if Self::check_store(probe).await.status != HealthStatus::Healthy {
            return Ok(HealthStatus::Unhealthy);
        }
        Ok(Self::check_broker(probe).status)
    }

    async fn check_service_running(probe: &ServiceProbe) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = if probe.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn check_store(probe: &ServiceProbe) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = match probe.store.ping().await {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!("Rating store ping failed: {}", e);
                (HealthStatus::Unhealthy, Some(e.to_string()))
            }
        };
        probe
            .metrics
            .update_component_health("rating_store", status == HealthStatus::Healthy);

        ComponentCheck {
            name: "rating_store".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_broker(probe: &ServiceProbe) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = match &probe.broker {
            Some(connection) if connection.is_open() => (HealthStatus::Healthy, None),
            Some(_) => (
                HealthStatus::Unhealthy,
                Some("AMQP connection is closed".to_string()),
            ),
            None => (
                HealthStatus::Healthy,
                Some("No broker attached (dry run)".to_string()),
            ),
        };
        if probe.broker.is_some() {
            probe
                .metrics
                .update_component_health("amqp", status == HealthStatus::Healthy);
        }

        ComponentCheck {
            name: "amqp_connection".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn gather_service_stats(probe: &ServiceProbe) -> ServiceStats {
        let pipeline = probe.metrics.pipeline();
        ServiceStats {
            matches_processed: pipeline.matches_processed_total.get(),
            matches_duplicate: pipeline.matches_duplicate_total.get(),
            matches_retried: pipeline.matches_retried_total.get(),
            pending_ordering_keys: probe.coordinator.pending_keys(),
            idle_workers: probe.coordinator.idle_workers(),
            uptime_seconds: probe.started_at.elapsed().as_secs(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FaultyRatingStore, InMemoryRatingStore};
    use crate::types::SkillRating;

    fn probe(running: bool) -> (ServiceProbe, Arc<FaultyRatingStore<InMemoryRatingStore>>) {
        let store = Arc::new(FaultyRatingStore::new(Arc::new(InMemoryRatingStore::new(
            SkillRating::new(1500.0, 500.0),
        ))));
        let probe = ServiceProbe {
            service_name: "rating-service".to_string(),
            store: store.clone(),
            coordinator: OrderingCoordinator::new(4, None),
            metrics: Arc::new(MetricsCollector::new().unwrap()),
            is_running: Arc::new(RwLock::new(running)),
            broker: None,
            started_at: Instant::now(),
        };
        (probe, store)
    }

    #[tokio::test]
    async fn test_running_service_is_ready() {
        let (probe, _) = probe(true);
        assert_eq!(
            HealthCheck::readiness_check(&probe).await.unwrap(),
            HealthStatus::Healthy
        );
        let check = HealthCheck::check(&probe).await.unwrap();
        assert_eq!(check.status, HealthStatus::Healthy);
        assert_eq!(check.stats.idle_workers, 4);
        assert!(check.to_json().unwrap().contains("rating_store"));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_not_ready() {
        let (probe, store) = probe(true);
        store.set_unavailable(true);
        assert_eq!(
            HealthCheck::readiness_check(&probe).await.unwrap(),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthCheck::liveness_check(&probe).await.unwrap(),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_stopped_service_is_not_alive() {
        let (probe, _) = probe(false);
        assert_eq!(
            HealthCheck::liveness_check(&probe).await.unwrap(),
            HealthStatus::Unhealthy
        );
    }
}
