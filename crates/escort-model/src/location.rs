//! Coordinates and live location samples

use crate::error::ModelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// WGS84 coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude, -90..=90
    pub latitude: f64,
    /// Longitude, -180..=180
    pub longitude: f64,
}

impl Coordinate {
    /// Create a validated coordinate
    ///
    /// # Errors
    /// `ModelError::LatitudeOutOfRange` / `LongitudeOutOfRange` when the
    /// value is outside its bounds or not finite.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ModelError> {
        let coord = Self {
            latitude,
            longitude,
        };
        coord.validate()?;
        Ok(coord)
    }

    /// Check bounds (deserialized coordinates bypass [`Coordinate::new`])
    ///
    /// # Errors
    /// Same as [`Coordinate::new`].
    pub fn validate(&self) -> Result<(), ModelError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ModelError::LatitudeOutOfRange(self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ModelError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }
}

/// Transient position sample
///
/// Lives on the wire and as the walk's last-known mirror; never stored as a
/// time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveLocation {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Horizontal accuracy radius in metres
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    /// Ground speed in metres per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    /// Heading in degrees clockwise from true north
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
    /// When the fix was taken
    pub timestamp: DateTime<Utc>,
}

impl LiveLocation {
    /// Sample at a coordinate with no motion metadata
    #[inline]
    #[must_use]
    pub fn at(coordinate: Coordinate, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            accuracy_m: None,
            speed_mps: None,
            heading_deg: None,
            timestamp,
        }
    }

    /// Attach an accuracy radius
    #[inline]
    #[must_use]
    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    /// Position of this sample
    #[inline]
    #[must_use]
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    /// Validate coordinate bounds and optional measurements
    ///
    /// # Errors
    /// Out-of-range coordinates or negative/non-finite measurements.
    pub fn validate(&self) -> Result<(), ModelError> {
        self.coordinate().validate()?;
        for (field, value) in [("accuracy_m", self.accuracy_m), ("speed_mps", self.speed_mps)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(ModelError::InvalidMeasurement { field, value: v });
                }
            }
        }
        Ok(())
    }
}
