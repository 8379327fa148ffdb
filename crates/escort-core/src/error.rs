//! Error types for Escort Core
//!
//! Propagation policy:
//! - lifecycle, validation and not-found errors go back to the caller
//! - position and publish failures inside the sampling loop are logged and
//!   the loop moves on to the next tick
//! - subscribe-setup failures are surfaced, since a watcher without a
//!   subscription has no data

use escort_broadcast::TransportError;
use escort_model::{ModelError, WalkState};
use escort_store::StoreError;

use crate::position::PositionError;

/// Main escort error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EscortError {
    /// Bad input to create/start; the caller must correct and retry
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation not valid in the walk's current lifecycle state
    #[error("cannot {operation} a walk in state {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State the walk was in
        state: WalkState,
    },

    /// Unknown walk, watcher or alert
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Record type
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// A sampling tick could not acquire a position
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    /// Positioning permission revoked; needs user action
    #[error("location permission denied")]
    PermissionDenied,

    /// Publish/subscribe failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Actor is neither the owner nor a watcher of the walk
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Durable store failure
    #[error("store error: {0}")]
    Store(StoreError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl EscortError {
    /// Shorthand for [`EscortError::InvalidState`]
    #[inline]
    #[must_use]
    pub fn invalid_state(operation: &'static str, state: WalkState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Check if error is worth retrying on a later tick
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PositionUnavailable(_) | Self::Transport(_) | Self::Store(StoreError::Unavailable(_))
        )
    }

    /// Check if the user has to do something before retrying
    #[inline]
    #[must_use]
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::PermissionDenied | Self::InvalidState { .. } | Self::Unauthorized(_)
        )
    }
}

impl From<StoreError> for EscortError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::NotTracking { state } => Self::invalid_state("update location of", state),
            StoreError::StateConflict { actual, .. } => Self::invalid_state("transition", actual),
            other => Self::Store(other),
        }
    }
}

impl From<ModelError> for EscortError {
    fn from(err: ModelError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<PositionError> for EscortError {
    fn from(err: PositionError) -> Self {
        match err {
            PositionError::PermissionDenied => Self::PermissionDenied,
            PositionError::Unavailable(reason) => Self::PositionUnavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escort_error_display() {
        let err = EscortError::invalid_state("start", WalkState::Completed);
        assert_eq!(err.to_string(), "cannot start a walk in state completed");
    }

    #[test]
    fn store_errors_map_to_taxonomy() {
        let not_found: EscortError = StoreError::walk_not_found("01H").into();
        assert!(matches!(not_found, EscortError::NotFound { entity: "walk", .. }));

        let not_tracking: EscortError = StoreError::NotTracking {
            state: WalkState::Cancelled,
        }
        .into();
        assert!(matches!(
            not_tracking,
            EscortError::InvalidState { state: WalkState::Cancelled, .. }
        ));

        let down: EscortError = StoreError::Unavailable("timeout".into()).into();
        assert!(down.is_retryable());
    }

    #[test]
    fn error_classification() {
        assert!(EscortError::PermissionDenied.is_user_actionable());
        assert!(!EscortError::PermissionDenied.is_retryable());
        assert!(EscortError::PositionUnavailable("gps".into()).is_retryable());
        assert!(EscortError::Transport(TransportError::Closed).is_retryable());
        assert!(!EscortError::Validation("lat".into()).is_retryable());
    }
}
