//! Error types for the store

use escort_model::WalkState;

/// Store operation failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Unknown record
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Record type
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// Compare-and-set lost: the walk was not in the expected state
    #[error("state conflict: expected {expected}, found {actual}")]
    StateConflict {
        /// State the caller read
        expected: WalkState,
        /// State actually stored
        actual: WalkState,
    },

    /// Location writes are only accepted while the walk is tracking
    #[error("walk is not tracking (state: {state})")]
    NotTracking {
        /// Current state
        state: WalkState,
    },

    /// Conditional update refused while alerts are unresolved
    #[error("walk has {open} unresolved alert(s)")]
    OpenAlerts {
        /// Unresolved alert count
        open: usize,
    },

    /// Walk id already exists
    #[error("walk already exists: {0}")]
    Duplicate(String),

    /// Backend unreachable or failed
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Walk not found
    #[inline]
    pub fn walk_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "walk",
            id: id.to_string(),
        }
    }

    /// Transient backend failure worth retrying on a later tick
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
