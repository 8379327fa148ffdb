//! Escort Core - the "Walk With Me" escort subsystem
//!
//! A walker shares an in-progress journey with trusted watchers:
//! - [`WalkLifecycle`] drives `created → active ⇄ alert → completed | cancelled`
//! - [`LocationSampler`] takes a fix every interval and feeds the
//!   [`LocationPipeline`]: durable last-location write, broadcast, evaluation
//! - [`AnomalyMonitor`] raises stopped / deviated / timeout alerts once per
//!   episode, plus SOS on demand, and records milestone checkpoints
//! - [`WatcherSession`] gives a watcher a snapshot plus live updates
//!
//! [`WalkService`] wires all of it over one store, transport, clock and
//! notification sink.
//!
//! # Example
//!
//! ```rust,ignore
//! use escort_core::prelude::*;
//!
//! # async fn example() -> Result<(), EscortError> {
//! let service = WalkService::builder().build()?;
//! let me = UserContext::new(UserId::new());
//!
//! let destination = Place::new(Coordinate::new(51.5014, -0.1419)?);
//! let created = service.create_walk(&me, NewWalk::to(destination)).await?;
//! let walk = service.start_walk(&me, created.walk.id, None).await?;
//!
//! let mut session = service.attach_watcher(Viewer::from(&me), walk.id).await?;
//! while let Some(update) = session.next_update().await {
//!     println!("{}", update.kind());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod position;
pub mod sampler;
pub mod service;
pub mod state_machine;
pub mod watcher;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EscortConfig;
pub use context::{UserContext, Viewer};
pub use error::EscortError;
pub use lifecycle::{NewWalk, NewWatcher, Transition, WalkLifecycle};
pub use monitor::{journey_progress, AnomalyMonitor, Evaluation, RuleState};
pub use notify::{ChannelNotifier, DispatchError, LogNotifier, NotificationSink, WalkEvent};
pub use pipeline::{LocationPipeline, SampleOutcome};
pub use position::{AccuracyHint, PositionError, PositionFix, PositionSource};
pub use sampler::{LocationSampler, SamplerExit, SamplerHandle, SamplerRegistry};
pub use service::{CreatedWalk, WalkService, WalkServiceBuilder};
pub use state_machine::{allowed_transitions, validate_transition};
pub use watcher::{WatcherSession, WatcherView};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Escort Core
    pub use crate::{
        EscortConfig, EscortError, NewWalk, NewWatcher, PositionFix, PositionSource, UserContext,
        Viewer, WalkService, WatcherSession,
    };
    pub use escort_model::{
        Alert, AlertKind, Coordinate, LiveLocation, Place, UserId, Walk, WalkId, WalkPayload,
        WalkState,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
