//! Engine error kinds.
//!
//! Single-entity operations surface these directly and abort; bulk operations
//! capture them per entity into result records instead of propagating, so one
//! bad cheque never aborts its siblings.

use crate::models::Amount;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PayError {
    /// Entity is not in a transition-eligible state.
    InvalidState {
        entity: String,
        id: String,
        state: String,
        operation: String,
    },

    /// A target batch already carries a non-voided distribution.
    DuplicateDistribution { batch_id: String },

    /// A consolidation run matched no pending payables; committing it would
    /// stamp batches `Processed` with nothing paid.
    EmptyDistribution { batch_ids: String },

    /// Entity id unresolved.
    NotFound { entity: String, id: String },

    /// Requested deduction exceeds the advance's remaining balance.
    InsufficientAdvanceBalance {
        advance_id: String,
        requested: Amount,
        remaining: Amount,
    },

    /// Underlying transaction aborted. Never retried automatically; the
    /// caller must explicitly resubmit.
    StoreFailure { message: String },
}

impl std::fmt::Display for PayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayError::InvalidState {
                entity,
                id,
                state,
                operation,
            } => write!(f, "{entity} {id} is {state}, cannot {operation}"),
            PayError::DuplicateDistribution { batch_id } => write!(
                f,
                "batch {batch_id} already has a non-voided distribution"
            ),
            PayError::EmptyDistribution { batch_ids } => write!(
                f,
                "no pending payables in batches [{batch_ids}], nothing to distribute"
            ),
            PayError::NotFound { entity, id } => write!(f, "{entity} {id} not found"),
            PayError::InsufficientAdvanceBalance {
                advance_id,
                requested,
                remaining,
            } => write!(
                f,
                "advance {advance_id}: deduction {requested} exceeds remaining balance {remaining}"
            ),
            PayError::StoreFailure { message } => write!(f, "store failure: {message}"),
        }
    }
}

impl std::error::Error for PayError {}

impl From<rusqlite::Error> for PayError {
    fn from(e: rusqlite::Error) -> Self {
        PayError::StoreFailure {
            message: e.to_string(),
        }
    }
}

impl PayError {
    pub fn invalid_state(
        entity: impl Into<String>,
        id: impl Into<String>,
        state: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        PayError::InvalidState {
            entity: entity.into(),
            id: id.into(),
            state: state.into(),
            operation: operation.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        PayError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}
