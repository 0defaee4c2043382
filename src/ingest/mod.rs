//! Match-result ingestion
//!
//! Turns raw broker deliveries into validated, deduplicated match results.

pub mod delivery;
pub mod gate;
pub mod messages;

pub use delivery::{settle, AckDecision, Acknowledger, Delivery, OneshotAcknowledger};
pub use gate::{AdmittedMatch, IngestGate};
pub use messages::MatchResultMessage;
