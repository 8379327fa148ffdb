//! Escort Store - durable record of walks, watchers, alerts and checkpoints
//!
//! [`WalkStore`] is the request/response boundary to whatever backend holds
//! walk records. Two write paths are conditional:
//! - [`WalkStore::update_last_location`] writes only if the sample is newer
//!   than the stored one
//! - [`WalkStore::set_state`] is a compare-and-set on the current state
//!
//! Alerts and checkpoints are append-only; checkpoints are unique per
//! (walk, kind).
//!
//! [`MemoryWalkStore`] is the in-process implementation used by tests, the
//! simulator and single-device deployments.

#![warn(unreachable_pub)]

pub mod error;
pub mod memory;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryWalkStore;
pub use store::{CheckpointWrite, LocationWrite, StateUpdate, WalkStore};
