//! Match pipeline driver
//!
//! Pulls admitted matches in source order, hands each its ordering ticket
//! synchronously and runs it on its own task. The driver stops pulling as soon
//! as any match fails fatally, drains in-flight work and reports the failure.

pub mod processor;

use crate::error::Result;
use crate::ingest::AdmittedMatch;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub use processor::{MatchDisposition, MatchProcessor, RetryPolicy};

/// Counts of how a run's matches were settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub committed: u64,
    pub duplicates: u64,
    pub rejected: u64,
    /// Handed back unprocessed after a fatal failure
    pub requeued: u64,
}

impl PipelineSummary {
    fn record(&mut self, disposition: &MatchDisposition) {
        match disposition {
            MatchDisposition::Committed(_) => self.committed += 1,
            MatchDisposition::Duplicate => self.duplicates += 1,
            MatchDisposition::Rejected => self.rejected += 1,
            MatchDisposition::Requeued => self.requeued += 1,
        }
    }
}

/// Drive matches until the stream ends or a match fails fatally.
///
/// In-flight matches are always allowed to finish before this returns.
pub async fn run<S>(processor: Arc<MatchProcessor>, matches: S) -> Result<PipelineSummary>
where
    S: Stream<Item = AdmittedMatch> + Send,
{
    futures::pin_mut!(matches);
    let mut tasks: JoinSet<Result<MatchDisposition>> = JoinSet::new();
    let mut summary = PipelineSummary::default();
    let mut failure: Option<anyhow::Error> = None;

    info!("Match pipeline started");

    while failure.is_none() {
        tokio::select! {
            biased;

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                failure = settle_task(joined, &mut summary);
            }
            next = matches.next() => {
                let Some(admitted) = next else {
                    debug!("Match source exhausted");
                    break;
                };
                let ticket = processor.submit(&admitted);
                let processor = Arc::clone(&processor);
                tasks.spawn(async move { processor.handle(admitted, ticket).await });
            }
        }
    }

    if failure.is_some() {
        error!(in_flight = tasks.len(), "Stopping consumption after fatal match failure");
    }

    while let Some(joined) = tasks.join_next().await {
        if let Some(e) = settle_task(joined, &mut summary) {
            failure.get_or_insert(e);
        }
    }

    info!(
        committed = summary.committed,
        duplicates = summary.duplicates,
        rejected = summary.rejected,
        requeued = summary.requeued,
        "Match pipeline stopped"
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

fn settle_task(
    joined: std::result::Result<Result<MatchDisposition>, tokio::task::JoinError>,
    summary: &mut PipelineSummary,
) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(disposition)) => {
            summary.record(&disposition);
            None
        }
        Ok(Err(e)) => Some(e),
        Err(e) => Some(
            crate::error::RatingServiceError::InternalError {
                message: format!("match task failed: {}", e),
            }
            .into(),
        ),
    }
}
