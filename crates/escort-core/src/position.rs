//! Device positioning capability

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escort_model::{Coordinate, LiveLocation};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Accuracy requested from the positioning provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyHint {
    /// GPS-grade
    #[default]
    High,
    /// Mixed GPS / network
    Balanced,
    /// Network only
    Low,
}

/// One position fix from the device
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    /// Position
    pub coordinate: Coordinate,
    /// Horizontal accuracy in metres
    pub accuracy_m: Option<f64>,
    /// Ground speed in metres per second
    pub speed_mps: Option<f64>,
    /// Heading in degrees
    pub heading_deg: Option<f64>,
    /// Provider timestamp; the clock is used when absent
    pub timestamp: Option<DateTime<Utc>>,
}

impl PositionFix {
    /// Fix with only a coordinate
    #[inline]
    #[must_use]
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            accuracy_m: None,
            speed_mps: None,
            heading_deg: None,
            timestamp: None,
        }
    }

    /// With provider timestamp
    #[inline]
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Convert to a live sample, stamping with `fallback` if the provider did not
    #[must_use]
    pub fn into_sample(self, fallback: DateTime<Utc>) -> LiveLocation {
        LiveLocation {
            latitude: self.coordinate.latitude,
            longitude: self.coordinate.longitude,
            accuracy_m: self.accuracy_m,
            speed_mps: self.speed_mps,
            heading_deg: self.heading_deg,
            timestamp: self.timestamp.unwrap_or(fallback),
        }
    }
}

/// Why a fix could not be taken
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    /// User revoked location permission
    #[error("location permission denied")]
    PermissionDenied,

    /// Provider error or no fix this time
    #[error("position unavailable: {0}")]
    Unavailable(String),
}

/// Source of position fixes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionSource: Send + Sync + Debug {
    /// Take one fix
    async fn current_position(&self, accuracy: AccuracyHint) -> Result<PositionFix, PositionError>;
}
