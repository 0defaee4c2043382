//! Broker-neutral delivery handle
//!
//! A [`Delivery`] carries a raw payload plus the means to settle it with the
//! source. The AMQP consumer wraps broker deliveries; [`OneshotAcknowledger`]
//! lets in-process callers wait for the verdict instead.

use crate::error::{RatingServiceError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Final verdict on one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed, or a duplicate of something processed
    Ack,
    /// Permanently refused; must not be redelivered
    Reject,
    /// Not processed; hand back to the source for redelivery
    Requeue,
}

/// Settles a delivery with whatever produced it
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Refuse without requeueing
    async fn reject(&self) -> Result<()>;

    /// Refuse and ask for redelivery
    async fn requeue(&self) -> Result<()>;
}

/// One raw message waiting to be admitted
pub struct Delivery {
    pub payload: Vec<u8>,
    /// Source-assigned tag, used for log correlation
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, delivery_tag: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            delivery_tag,
            redelivered: false,
            acker,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Settle through an acknowledger according to a decision
pub async fn settle(acker: &dyn Acknowledger, decision: AckDecision) -> Result<()> {
    match decision {
        AckDecision::Ack => acker.ack().await,
        AckDecision::Reject => acker.reject().await,
        AckDecision::Requeue => acker.requeue().await,
    }
}

/// Reports the decision over a oneshot channel; settling twice is an error
pub struct OneshotAcknowledger {
    sender: Mutex<Option<oneshot::Sender<AckDecision>>>,
}

impl OneshotAcknowledger {
    pub fn new() -> (Self, oneshot::Receiver<AckDecision>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }

    fn send(&self, decision: AckDecision) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| RatingServiceError::InternalError {
                message: "Acknowledger lock poisoned".to_string(),
            })?
            .take()
            .ok_or_else(|| RatingServiceError::InternalError {
                message: "Delivery settled twice".to_string(),
            })?;
        // The caller may have stopped waiting; that is not our failure
        let _ = sender.send(decision);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for OneshotAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.send(AckDecision::Ack)
    }

    async fn reject(&self) -> Result<()> {
        self.send(AckDecision::Reject)
    }

    async fn requeue(&self) -> Result<()> {
        self.send(AckDecision::Requeue)
    }
}
