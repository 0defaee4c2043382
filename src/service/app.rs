//! Main application state and service coordination
//!
//! [`RatingService`] owns every component of the running pipeline: the rating
//! store, the ordering coordinator, the match processor task, the optional
//! broker subscription and the background maintenance tasks.

use crate::amqp::{
    AmqpConnection, AmqpRatingPublisher, MatchResultConsumer, PublisherConfig, RatingPublisher,
    Topology,
};
use crate::config::{validate_config, AmqpConfig, AppConfig};
use crate::error::{RatingServiceError, Result};
use crate::ingest::delivery::{AckDecision, Delivery, OneshotAcknowledger};
use crate::ingest::IngestGate;
use crate::maintenance::{DecayReport, Maintenance};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::ordering::OrderingCoordinator;
use crate::pipeline::{self, MatchProcessor, PipelineSummary, RetryPolicy};
use crate::rating::{RatingCalculator, TrueSkillCalculator};
use crate::service::health::{HealthCheck, ServiceProbe};
use crate::store::{InMemoryRatingStore, RatingStore, SqliteRatingStore};
use crate::types::LeaderboardId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Database URL selecting the in-process store
pub const MEMORY_DATABASE_URL: &str = "memory";

pub struct RatingService {
    config: AppConfig,
    store: Arc<dyn RatingStore>,
    /// Kept to close the pool on shutdown
    sqlite: Option<SqliteRatingStore>,
    metrics: Arc<MetricsCollector>,
    calculator: Arc<dyn RatingCalculator>,
    coordinator: OrderingCoordinator,
    maintenance: Arc<Maintenance>,

    broker: Option<Arc<AmqpConnection>>,
    consumer: Option<MatchResultConsumer>,
    publisher: Option<Arc<dyn RatingPublisher>>,
    metrics_service: Option<MetricsService>,

    /// Producer side of the ingest channel; `None` outside start..shutdown
    deliveries: RwLock<Option<mpsc::Sender<Delivery>>>,
    pipeline: Option<JoinHandle<Result<PipelineSummary>>>,
    pipeline_done: watch::Sender<bool>,
    background_tasks: Vec<JoinHandle<()>>,

    is_running: Arc<RwLock<bool>>,
    started_at: Instant,
}

impl RatingService {
    /// Build the service and open the configured rating store
    pub async fn new(config: AppConfig) -> Result<Self> {
        validate_config(&config)?;
        info!(
            "Initializing {} (database: {})",
            config.service.name, config.database.url
        );

        let initial = config.rating.initial_rating();
        if config.database.url == MEMORY_DATABASE_URL {
            warn!("Using the in-memory rating store; ratings will not survive a restart");
            let store = Arc::new(InMemoryRatingStore::new(initial));
            return Self::assemble(config, store, None);
        }

        let sqlite = SqliteRatingStore::connect(
            &config.database.url,
            config.database.max_connections,
            initial,
        )
        .await?;
        let store: Arc<dyn RatingStore> = Arc::new(sqlite.clone());
        Self::assemble(config, store, Some(sqlite))
    }

    /// Build the service around an existing store
    pub fn with_store(config: AppConfig, store: Arc<dyn RatingStore>) -> Result<Self> {
        validate_config(&config)?;
        Self::assemble(config, store, None)
    }

    fn assemble(
        config: AppConfig,
        store: Arc<dyn RatingStore>,
        sqlite: Option<SqliteRatingStore>,
    ) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new()?);
        let calculator: Arc<dyn RatingCalculator> =
            Arc::new(TrueSkillCalculator::new(config.rating.clone())?);
        let coordinator = OrderingCoordinator::new(
            config.processing.max_concurrent_matches,
            Some(metrics.clone()),
        );
        let maintenance = Arc::new(Maintenance::new(
            store.clone(),
            coordinator.clone(),
            metrics.clone(),
            Maintenance::policy_from_settings(&config.maintenance, config.rating.max_uncertainty),
            config.rating.conservative_k,
        ));
        let (pipeline_done, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            sqlite,
            metrics,
            calculator,
            coordinator,
            maintenance,
            broker: None,
            consumer: None,
            publisher: None,
            metrics_service: None,
            deliveries: RwLock::new(None),
            pipeline: None,
            pipeline_done,
            background_tasks: Vec::new(),
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        })
    }

    /// Connect to the broker, declare the topology and prepare the subscription.
    ///
    /// Must be called before [`start`](Self::start) for broker deliveries to flow.
    pub async fn connect_broker(&mut self) -> Result<()> {
        let amqp_config = AmqpConfig::from_settings(&self.config.amqp)?;
        info!(
            "Connecting to AMQP broker at {}:{}",
            amqp_config.host, amqp_config.port
        );
        let connection = AmqpConnection::new(amqp_config).await?;

        let topology = Topology::from_settings(&self.config.amqp);
        let consumer_channel = connection.open_channel().await?;
        topology.declare(&consumer_channel).await?;

        let publisher_channel = connection.open_channel().await?;
        let publisher = AmqpRatingPublisher::new(
            publisher_channel,
            PublisherConfig {
                exchange: topology.exchange.clone(),
                routing_key: topology.notification_key.clone(),
                max_retries: self.config.amqp.max_retry_attempts,
                retry_delay_ms: self.config.amqp.retry_delay_ms,
            },
        );

        self.publisher = Some(Arc::new(publisher));
        self.consumer = Some(MatchResultConsumer::new(consumer_channel));
        self.broker = Some(Arc::new(connection));
        Ok(())
    }

    /// Publish rating notifications through `publisher` instead of the broker
    pub fn set_publisher(&mut self, publisher: Arc<dyn RatingPublisher>) {
        self.publisher = Some(publisher);
    }

    /// Start the match pipeline, broker consumption and background tasks
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running().await {
            return Ok(());
        }
        info!("Starting {}", self.config.service.name);

        let (sender, receiver) = mpsc::channel(self.config.processing.delivery_buffer.max(1));
        let gate = IngestGate::new(
            receiver,
            self.store.clone(),
            self.metrics.clone(),
            self.config.processing.allowed_leaderboards.clone(),
        );

        let mut processor = MatchProcessor::new(
            self.store.clone(),
            self.calculator.clone(),
            self.coordinator.clone(),
            self.metrics.clone(),
            RetryPolicy {
                max_attempts: self.config.processing.commit_max_retries,
                base_delay: Duration::from_millis(self.config.processing.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.config.processing.retry_max_delay_ms),
            },
        );
        if let Some(publisher) = &self.publisher {
            processor = processor.with_publisher(publisher.clone());
        }

        *self.is_running.write().await = true;
        self.pipeline_done.send_replace(false);

        let processor = Arc::new(processor);
        let done = self.pipeline_done.clone();
        let is_running = self.is_running.clone();
        self.pipeline = Some(tokio::spawn(async move {
            let result = pipeline::run(processor, gate.receive()).await;
            if let Err(e) = &result {
                error!("Match pipeline stopped on fatal error: {:#}", e);
                *is_running.write().await = false;
            }
            done.send_replace(true);
            result
        }));

        if let Some(consumer) = &self.consumer {
            consumer
                .start_consuming(
                    &self.config.amqp.queue_name,
                    self.config.prefetch_count(),
                    sender.clone(),
                )
                .await?;
        }
        *self.deliveries.write().await = Some(sender);

        self.start_background_tasks();

        info!("{} started", self.config.service.name);
        Ok(())
    }

    /// Serve `/health`, `/ready` and `/metrics` on the configured port
    pub fn serve_health(&mut self) {
        let server = HealthServer::new(
            HealthServerConfig {
                port: self.config.service.health_port,
                ..HealthServerConfig::default()
            },
            self.metrics.clone(),
        )
        .with_probe(self.probe());
        let metrics_service = MetricsService::new(self.metrics.clone(), Arc::new(server));

        let serving = metrics_service.clone();
        self.background_tasks.push(tokio::spawn(async move {
            if let Err(e) = serving.start().await {
                error!("Health server failed: {:#}", e);
            }
        }));
        self.metrics_service = Some(metrics_service);
    }

    /// Feed one raw match result into the pipeline, as the broker would.
    ///
    /// The receiver resolves with the settlement once the match leaves the pipeline.
    pub async fn enqueue(&self, payload: Vec<u8>) -> Result<oneshot::Receiver<AckDecision>> {
        let not_ready = || -> anyhow::Error {
            RatingServiceError::ServiceNotReady {
                message: "match pipeline is not accepting input".to_string(),
            }
            .into()
        };

        if !self.is_running().await {
            return Err(not_ready());
        }
        let sender = self.deliveries.read().await.clone().ok_or_else(not_ready)?;

        let (acker, settled) = OneshotAcknowledger::new();
        let delivery = Delivery::new(payload, 0, Box::new(acker));
        sender.send(delivery).await.map_err(|_| not_ready())?;
        Ok(settled)
    }

    /// Run decay, then recompute leaderboard ordering
    pub async fn run_maintenance(&self, leaderboard: Option<&LeaderboardId>) -> Result<DecayReport> {
        let report = self.maintenance.run_decay(leaderboard).await?;
        let rows = self.maintenance.recompute_leaderboards().await?;
        debug!(rows, "Leaderboards recomputed");
        Ok(report)
    }

    /// Resolves once the match pipeline has stopped, for any reason
    pub fn pipeline_stopped(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut done = self.pipeline_done.subscribe();
        async move {
            let _ = done.wait_for(|stopped| *stopped).await;
        }
    }

    /// Perform graceful shutdown.
    ///
    /// Returns the pipeline's summary, or its fatal error if it stopped on one.
    pub async fn shutdown(&mut self) -> Result<PipelineSummary> {
        info!("Starting graceful shutdown of {}", self.config.service.name);
        *self.is_running.write().await = false;

        if let Some(consumer) = &self.consumer {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop AMQP consumer: {}", e);
            }
        }

        // Closing the producer side ends the gate stream once it drains
        self.deliveries.write().await.take();

        let summary = match self.pipeline.take() {
            Some(handle) => self.drain_pipeline(handle).await,
            None => Ok(PipelineSummary::default()),
        };

        self.stop_background_tasks().await;

        if let Some(metrics_service) = self.metrics_service.take() {
            if let Err(e) = metrics_service.stop().await {
                warn!("Failed to stop metrics service: {}", e);
            }
        }
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
        if let Some(broker) = self.broker.take() {
            if let Err(e) = broker.close().await {
                warn!("Failed to close AMQP connection: {}", e);
            }
        }

        info!("{} shutdown completed", self.config.service.name);
        summary
    }

    async fn drain_pipeline(
        &self,
        mut handle: JoinHandle<Result<PipelineSummary>>,
    ) -> Result<PipelineSummary> {
        let limit = self.config.shutdown_timeout();
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RatingServiceError::InternalError {
                message: format!("match pipeline task failed: {}", e),
            }
            .into()),
            Err(_) => {
                warn!(
                    pending_keys = self.coordinator.pending_keys(),
                    "In-flight matches did not finish within {:?}; abandoning them to redelivery",
                    limit
                );
                handle.abort();
                Err(RatingServiceError::InternalError {
                    message: "shutdown timed out with matches in flight".to_string(),
                }
                .into())
            }
        }
    }

    fn start_background_tasks(&mut self) {
        if self.config.maintenance.enabled {
            let maintenance = self.maintenance.clone();
            let is_running = self.is_running.clone();
            let period = self.config.maintenance_interval();
            info!("Starting maintenance task ({}s interval)", period.as_secs());

            self.background_tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // The first tick completes immediately
                interval.tick().await;

                while *is_running.read().await {
                    interval.tick().await;

                    match maintenance.run_decay(None).await {
                        Ok(report) => debug!("Scheduled decay finished: {:?}", report),
                        Err(e) => warn!("Scheduled decay failed: {}", e),
                    }
                    if let Err(e) = maintenance.recompute_leaderboards().await {
                        warn!("Leaderboard recompute failed: {}", e);
                    }
                }
            }));
        } else {
            info!("Maintenance disabled - decay runs only on demand");
        }

        let probe = self.probe();
        self.background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));

            while probe.is_running().await {
                interval.tick().await;

                probe.metrics.update_uptime(probe.started_at.elapsed());
                match HealthCheck::check(&probe).await {
                    Ok(health) => probe.metrics.update_health_status(health.status.as_gauge()),
                    Err(e) => warn!("Health metrics update failed: {}", e),
                }
            }
        }));
    }

    async fn stop_background_tasks(&mut self) {
        for task in self.background_tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }

    /// Handles the health checks look at
    pub fn probe(&self) -> ServiceProbe {
        ServiceProbe {
            service_name: self.config.service.name.clone(),
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            metrics: self.metrics.clone(),
            is_running: self.is_running.clone(),
            broker: self.broker.clone(),
            started_at: self.started_at,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn store(&self) -> Arc<dyn RatingStore> {
        self.store.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn coordinator(&self) -> &OrderingCoordinator {
        &self.coordinator
    }
}
