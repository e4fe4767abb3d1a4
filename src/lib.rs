//! HarvestPay Backend Library
//!
//! Payment consolidation and cheque lifecycle engine for grower settlements.
//! Batch items are aggregated per grower, netted against the advance ledger,
//! and paid out as one instrument per grower per run. Every instrument walks
//! a fixed lifecycle with a full audit trail, and voiding reverses a run's
//! side effects atomically.

pub mod engine;
pub mod error;
pub mod models;
pub mod store;

pub use engine::PaymentEngine;
pub use error::PayError;
pub use models::{Config, OpContext};
pub use store::PaymentStore;
