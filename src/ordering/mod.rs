//! Per-player ordering of rating work

pub mod coordinator;
pub mod keys;

pub use coordinator::{OrderingCoordinator, Ticket};
pub use keys::{KeyTable, Reservation};
