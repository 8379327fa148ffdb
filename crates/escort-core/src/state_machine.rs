//! Walk state transitions
//!
//! ```text
//! created ──► active ◄──► alert
//!    │          │           │
//!    │          ├──► completed ◄┤
//!    └──────────┴──► cancelled ◄┘
//! ```

use crate::error::EscortError;
use escort_model::WalkState;

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: WalkState) -> &'static [WalkState] {
    match from {
        WalkState::Created => &[WalkState::Active, WalkState::Cancelled],
        WalkState::Active => &[WalkState::Alert, WalkState::Completed, WalkState::Cancelled],
        WalkState::Alert => &[WalkState::Active, WalkState::Completed, WalkState::Cancelled],
        WalkState::Completed | WalkState::Cancelled => &[],
    }
}

/// Validates a state transition.
///
/// # Errors
/// `EscortError::InvalidState` carrying `operation` and the current state.
pub fn validate_transition(
    operation: &'static str,
    from: WalkState,
    to: WalkState,
) -> Result<(), EscortError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(EscortError::invalid_state(operation, from))
    }
}
