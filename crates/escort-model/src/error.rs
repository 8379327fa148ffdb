//! Error types for the model crate

/// Invalid domain input
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Latitude outside [-90, 90] or not finite
    #[error("latitude out of range: {0}")]
    LatitudeOutOfRange(f64),

    /// Longitude outside [-180, 180] or not finite
    #[error("longitude out of range: {0}")]
    LongitudeOutOfRange(f64),

    /// A supplied route has fewer than two points
    #[error("route must contain at least two points, got {0}")]
    RouteTooShort(usize),

    /// Negative or non-finite measurement
    #[error("invalid {field}: {value}")]
    InvalidMeasurement {
        /// Field name
        field: &'static str,
        /// Offending value
        value: f64,
    },
}
