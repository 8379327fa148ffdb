//! Walk record and lifecycle states

use crate::ids::{UserId, WalkId};
use crate::location::{Coordinate, LiveLocation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a walk
///
/// `alert` is a flag state: tracking continues while in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkState {
    /// Created, not yet started
    Created,
    /// Tracking in progress
    Active,
    /// Tracking in progress with at least one unresolved alert
    Alert,
    /// Arrived safely (terminal)
    Completed,
    /// Abandoned (terminal)
    Cancelled,
}

impl WalkState {
    /// Completed or cancelled
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Location samples are accepted in this state
    #[inline]
    #[must_use]
    pub fn is_tracking(self) -> bool {
        matches!(self, Self::Active | Self::Alert)
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Alert => "alert",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WalkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinate with an optional human-readable address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    /// Position
    pub coordinate: Coordinate,
    /// Street address or label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Place {
    /// Place without an address
    #[inline]
    #[must_use]
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            address: None,
        }
    }

    /// With address label
    #[inline]
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// One escorted journey
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Walk {
    /// Walk id
    pub id: WalkId,
    /// The traveling user
    pub owner: UserId,
    /// Where the walk began; set at creation or on start
    pub start: Option<Place>,
    /// Where the walk is headed
    pub destination: Place,
    /// Optional route polyline used as the deviation reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Vec<Coordinate>>,
    /// Estimated duration in seconds
    pub estimated_duration_secs: Option<u64>,
    /// Estimated distance in metres
    pub estimated_distance_m: Option<f64>,
    /// Current lifecycle state
    pub state: WalkState,
    /// Current truth: overwritten in place, never appended
    pub last_location: Option<LiveLocation>,
    /// Record creation time
    pub created_at: DateTime<Utc>,
    /// Set on `created -> active`
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once on entering a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// `started_at + estimate + timeout buffer`
    pub expected_arrival: Option<DateTime<Utc>>,
}

impl Walk {
    /// Estimated duration as a `Duration`
    #[inline]
    #[must_use]
    pub fn estimated_duration(&self) -> Option<Duration> {
        self.estimated_duration_secs.map(Duration::from_secs)
    }

    /// Path deviation is measured against: the supplied route, otherwise the
    /// straight line start -> destination. Empty when neither is known.
    #[must_use]
    pub fn reference_path(&self) -> Vec<Coordinate> {
        match (&self.route, &self.start) {
            (Some(route), _) if route.len() >= 2 => route.clone(),
            (_, Some(start)) => vec![start.coordinate, self.destination.coordinate],
            _ => Vec::new(),
        }
    }

    /// Last known position, if any sample has been recorded
    #[inline]
    #[must_use]
    pub fn last_coordinate(&self) -> Option<Coordinate> {
        self.last_location.as_ref().map(LiveLocation::coordinate)
    }
}
