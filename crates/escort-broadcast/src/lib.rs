//! Escort Broadcast - ephemeral per-walk fan-out
//!
//! Each walk has a topic named `walk:<id>`. Publishing is at-most-once and
//! best-effort: no persistence, no replay, nothing for subscribers that were
//! not attached at publish time. Each subscriber receives its stream in
//! publish order on its own task; there is no ordering across subscribers.
//!
//! ```text
//! sampler ──publish──► BroadcastHub ──► topic "walk:01H…" ──┬─► subscriber task ─► handler
//!                                                           └─► subscriber task ─► handler
//! ```

#![warn(unreachable_pub)]

pub mod error;
pub mod hub;
pub mod topic;
pub mod transport;

pub use error::TransportError;
pub use hub::BroadcastHub;
pub use topic::Topic;
pub use transport::{PayloadHandler, Subscription, Transport};
