//! Append-only anomaly records

use crate::ids::{AlertId, WalkId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What tripped the alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// No movement beyond the noise threshold for too long
    Stopped,
    /// Too far from the reference path
    Deviated,
    /// Past expected arrival
    Timeout,
    /// Raised manually by the walker
    Sos,
}

impl AlertKind {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Deviated => "deviated",
            Self::Timeout => "timeout",
            Self::Sos => "sos",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly record tied to a walk
///
/// Only `resolved` / `resolved_at` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert id
    pub id: AlertId,
    /// Owning walk
    pub walk_id: WalkId,
    /// Rule that fired
    #[serde(rename = "alert_kind")]
    pub kind: AlertKind,
    /// Human-readable description
    pub message: String,
    /// Acknowledged by the walker or a watcher
    pub resolved: bool,
    /// When the alert was recorded
    pub created_at: DateTime<Utc>,
    /// When it was acknowledged
    pub resolved_at: Option<DateTime<Utc>>,
}
