//! Escort configuration
//!
//! All thresholds the lifecycle, sampler and monitor use. Loadable from
//! TOML; every field has a default so partial files are fine:
//!
//! ```toml
//! sampling_interval_ms = 5000
//! deviation_threshold_m = 150.0
//! accuracy = "balanced"
//! ```

use crate::clock::chrono_secs;
use crate::error::EscortError;
use crate::position::AccuracyHint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Escort configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscortConfig {
    /// Interval between location samples
    pub sampling_interval_ms: u64,
    /// No movement for longer than this raises `stopped`
    pub stopped_threshold_secs: u64,
    /// Position changes at or below this are GPS noise
    pub movement_epsilon_m: f64,
    /// Distance from the reference path that raises `deviated`
    pub deviation_threshold_m: f64,
    /// Grace period added to the estimate to get expected arrival
    pub timeout_buffer_secs: u64,
    /// A sample this close to the destination records `arrived`
    pub arrival_radius_m: f64,
    /// Speed used to derive a duration estimate from distance
    pub walking_speed_mps: f64,
    /// Per-topic broadcast buffer
    pub broadcast_capacity: usize,
    /// Accuracy requested from the positioning capability
    pub accuracy: AccuracyHint,
}

impl EscortConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// `EscortError::Config` on malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, EscortError> {
        let config: Self =
            toml::from_str(text).map_err(|e| EscortError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// `EscortError::Config` if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EscortError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EscortError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject zero intervals and non-positive thresholds
    ///
    /// # Errors
    /// `EscortError::Config` naming the first bad field.
    pub fn validate(&self) -> Result<(), EscortError> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(EscortError::Config(format!("{name} must be positive, got {value}")))
            }
        };

        if self.sampling_interval_ms == 0 {
            return Err(EscortError::Config("sampling_interval_ms must be non-zero".into()));
        }
        if self.stopped_threshold_secs == 0 {
            return Err(EscortError::Config("stopped_threshold_secs must be non-zero".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(EscortError::Config("broadcast_capacity must be non-zero".into()));
        }
        positive("movement_epsilon_m", self.movement_epsilon_m)?;
        positive("deviation_threshold_m", self.deviation_threshold_m)?;
        positive("arrival_radius_m", self.arrival_radius_m)?;
        positive("walking_speed_mps", self.walking_speed_mps)?;
        Ok(())
    }

    /// With sampling interval
    #[inline]
    #[must_use]
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With stopped threshold
    #[inline]
    #[must_use]
    pub fn with_stopped_threshold(mut self, threshold: Duration) -> Self {
        self.stopped_threshold_secs = threshold.as_secs();
        self
    }

    /// With deviation threshold in metres
    #[inline]
    #[must_use]
    pub fn with_deviation_threshold(mut self, metres: f64) -> Self {
        self.deviation_threshold_m = metres;
        self
    }

    /// With timeout buffer
    #[inline]
    #[must_use]
    pub fn with_timeout_buffer(mut self, buffer: Duration) -> Self {
        self.timeout_buffer_secs = buffer.as_secs();
        self
    }

    /// Sampling interval
    #[inline]
    #[must_use]
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    /// Stopped threshold as a chrono duration
    #[inline]
    #[must_use]
    pub fn stopped_threshold(&self) -> chrono::Duration {
        chrono_secs(self.stopped_threshold_secs)
    }

    /// Timeout buffer as a chrono duration
    #[inline]
    #[must_use]
    pub fn timeout_buffer(&self) -> chrono::Duration {
        chrono_secs(self.timeout_buffer_secs)
    }
}

impl Default for EscortConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 10_000,
            stopped_threshold_secs: 300,
            movement_epsilon_m: 10.0,
            deviation_threshold_m: 200.0,
            timeout_buffer_secs: 600,
            arrival_radius_m: 50.0,
            walking_speed_mps: 1.4,
            broadcast_capacity: 256,
            accuracy: AccuracyHint::High,
        }
    }
}
