//! Ingest gate: raw deliveries in, validated match results out
//!
//! The gate consumes the bounded delivery channel fed by the broker adapter.
//! Anything that cannot become a valid [`MatchResult`] is rejected (settled
//! without requeue) and counted; re-deliveries of committed matches are acked
//! and dropped. The stream ends only when the delivery channel closes.

use crate::ingest::delivery::{Acknowledger, Delivery};
use crate::ingest::messages::MatchResultMessage;
use crate::metrics::MetricsCollector;
use crate::store::RatingStore;
use crate::types::{MatchResult, RejectionReason};
use crate::utils::payload_preview;
use futures::stream::{self, Stream};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Bytes of a rejected payload written to the log
const PREVIEW_LIMIT: usize = 2048;

/// A validated match still owed a settlement
pub struct AdmittedMatch {
    pub result: MatchResult,
    pub acker: Box<dyn Acknowledger>,
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub received_at: Instant,
}

impl std::fmt::Debug for AdmittedMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmittedMatch")
            .field("match_id", &self.result.match_id)
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

pub struct IngestGate {
    deliveries: mpsc::Receiver<Delivery>,
    store: Arc<dyn RatingStore>,
    metrics: Arc<MetricsCollector>,
    allowed_leaderboards: HashSet<String>,
}

impl IngestGate {
    pub fn new(
        deliveries: mpsc::Receiver<Delivery>,
        store: Arc<dyn RatingStore>,
        metrics: Arc<MetricsCollector>,
        allowed_leaderboards: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            deliveries,
            store,
            metrics,
            allowed_leaderboards: allowed_leaderboards.into_iter().collect(),
        }
    }

    /// Lazily yield admitted matches in delivery order.
    ///
    /// Resumes wherever the source is; nothing is replayed from the start.
    pub fn receive(self) -> impl Stream<Item = AdmittedMatch> + Send {
        stream::unfold(self, |mut gate| async move {
            loop {
                let delivery = gate.deliveries.recv().await?;
                if let Some(admitted) = gate.admit(delivery).await {
                    return Some((admitted, gate));
                }
            }
        })
    }

    async fn admit(&self, delivery: Delivery) -> Option<AdmittedMatch> {
        let received_at = Instant::now();
        let Delivery {
            payload,
            delivery_tag,
            redelivered,
            acker,
        } = delivery;

        let message = match MatchResultMessage::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                self.reject(acker.as_ref(), RejectionReason::Deserialize, delivery_tag, &payload, &e)
                    .await;
                return None;
            }
        };

        let result = match message.validate() {
            Ok(result) => result,
            Err(e) => {
                self.reject(acker.as_ref(), RejectionReason::Validation, delivery_tag, &payload, &e)
                    .await;
                return None;
            }
        };

        if !self.allowed_leaderboards.is_empty()
            && !self.allowed_leaderboards.contains(&result.leaderboard)
        {
            let e = anyhow::anyhow!("leaderboard {} is not served here", result.leaderboard);
            self.reject(acker.as_ref(), RejectionReason::Leaderboard, delivery_tag, &payload, &e)
                .await;
            return None;
        }

        match self.store.has_processed(&result.match_id).await {
            Ok(true) => {
                debug!(
                    match_id = %result.match_id,
                    delivery_tag,
                    redelivered,
                    "Dropping duplicate match result"
                );
                self.metrics.record_duplicate();
                if let Err(e) = acker.ack().await {
                    error!(delivery_tag, "Failed to ack duplicate delivery: {}", e);
                }
                return None;
            }
            Ok(false) => {}
            Err(e) => {
                // The processor checks again under the player keys
                warn!(
                    match_id = %result.match_id,
                    "Duplicate check failed, admitting anyway: {}", e
                );
            }
        }

        Some(AdmittedMatch {
            result,
            acker,
            payload,
            delivery_tag,
            received_at,
        })
    }

    async fn reject(
        &self,
        acker: &dyn Acknowledger,
        reason: RejectionReason,
        delivery_tag: u64,
        payload: &[u8],
        cause: &anyhow::Error,
    ) {
        warn!(
            delivery_tag,
            reason = reason.as_str(),
            payload = %payload_preview(payload, PREVIEW_LIMIT),
            "Rejecting match result: {}", cause
        );
        self.metrics.record_rejected(reason);
        if let Err(e) = acker.reject().await {
            error!(delivery_tag, "Failed to reject delivery: {}", e);
        }
    }
}
