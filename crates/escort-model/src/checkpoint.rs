//! Milestone markers

use crate::ids::{CheckpointId, WalkId};
use crate::location::Coordinate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milestone type; at most one checkpoint of each type per walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Walk started
    Started,
    /// Half of the estimated journey covered
    Halfway,
    /// Reached the destination radius
    Arrived,
    /// Walker confirmed they are safe
    Safe,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "started",
            Self::Halfway => "halfway",
            Self::Arrived => "arrived",
            Self::Safe => "safe",
        })
    }
}

/// Append-only milestone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id
    pub id: CheckpointId,
    /// Owning walk
    pub walk_id: WalkId,
    /// Milestone type
    pub kind: CheckpointKind,
    /// Where it was reached
    pub coordinate: Option<Coordinate>,
    /// When it was reached
    pub recorded_at: DateTime<Utc>,
}
