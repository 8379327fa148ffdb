//! Broadcast payloads
//!
//! Wire shape on a walk topic, tagged by `kind`:
//!
//! ```json
//! {"kind": "location", "latitude": 51.5, "longitude": -0.12, "timestamp": "..."}
//! {"kind": "alert", "id": "...", "alert_kind": "stopped", "message": "...", ...}
//! {"kind": "state", "state": "alert"}
//! ```

use crate::alert::Alert;
use crate::location::LiveLocation;
use crate::walk::WalkState;
use serde::{Deserialize, Serialize};

/// One message on a walk's broadcast topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalkPayload {
    /// New position sample
    Location(LiveLocation),
    /// Alert raised or updated (resolution)
    Alert(Alert),
    /// Lifecycle state changed
    State {
        /// New state
        state: WalkState,
    },
}

impl WalkPayload {
    /// Short name used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Location(_) => "location",
            Self::Alert(_) => "alert",
            Self::State { .. } => "state",
        }
    }
}
