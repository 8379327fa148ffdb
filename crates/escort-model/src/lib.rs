//! Escort Model - domain types for escorted walks
//!
//! The vocabulary shared by every other crate in the workspace:
//! - [`Walk`] and its lifecycle [`WalkState`]
//! - [`Watcher`] identities (registered or anonymous)
//! - append-only [`Alert`] and [`Checkpoint`] records
//! - transient [`LiveLocation`] samples and the [`WalkPayload`] wire shape
//! - great-circle helpers in [`geo`]
//!
//! # Example
//!
//! ```rust
//! use escort_model::{geo, Coordinate};
//!
//! let a = Coordinate::new(51.5007, -0.1246).unwrap();
//! let b = Coordinate::new(51.5014, -0.1419).unwrap();
//! assert!(geo::haversine_m(a, b) > 1_000.0);
//! ```

#![warn(unreachable_pub)]

pub mod alert;
pub mod checkpoint;
pub mod error;
pub mod geo;
pub mod ids;
pub mod location;
pub mod payload;
pub mod walk;
pub mod watcher;

pub use alert::{Alert, AlertKind};
pub use checkpoint::{Checkpoint, CheckpointKind};
pub use error::ModelError;
pub use ids::{AlertId, CheckpointId, UserId, WalkId, WatcherId};
pub use location::{Coordinate, LiveLocation};
pub use payload::WalkPayload;
pub use walk::{Place, Walk, WalkState};
pub use watcher::{ShareToken, Watcher, WatcherIdentity};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
