//! The durable store boundary

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escort_model::{
    Alert, AlertId, AlertKind, Checkpoint, CheckpointKind, Coordinate, LiveLocation, Place,
    UserId, Walk, WalkId, WalkState, Watcher,
};
use std::fmt::Debug;

/// Outcome of a conditional last-location write
#[derive(Debug, Clone, PartialEq)]
pub enum LocationWrite {
    /// Sample stored; carries the updated walk
    Applied(Walk),
    /// Sample older than the stored one; discarded
    Stale {
        /// The newer sample already stored
        current: LiveLocation,
    },
}

impl LocationWrite {
    /// Whether the sample was stored
    #[inline]
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Outcome of a checkpoint append
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointWrite {
    /// First checkpoint of this kind
    Created(Checkpoint),
    /// Already present; the stored record is returned unchanged
    Existing(Checkpoint),
}

impl CheckpointWrite {
    /// The stored checkpoint either way
    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        match self {
            Self::Created(c) | Self::Existing(c) => c,
        }
    }

    /// Whether this call created the record
    #[inline]
    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Fields written together with a state change
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    /// Target state
    pub state: WalkState,
    /// Replace the start place
    pub start: Option<Place>,
    /// Set `started_at`
    pub started_at: Option<DateTime<Utc>>,
    /// Set `expected_arrival`
    pub expected_arrival: Option<DateTime<Utc>>,
    /// Set `completed_at`; ignored if already set
    pub completed_at: Option<DateTime<Utc>>,
    /// Refuse the change while any alert on the walk is unresolved
    pub require_alerts_resolved: bool,
}

impl StateUpdate {
    /// Plain state change
    #[inline]
    #[must_use]
    pub fn to(state: WalkState) -> Self {
        Self {
            state,
            start: None,
            started_at: None,
            expected_arrival: None,
            completed_at: None,
            require_alerts_resolved: false,
        }
    }

    /// With start place
    #[inline]
    #[must_use]
    pub fn with_start(mut self, start: Option<Place>) -> Self {
        self.start = start;
        self
    }

    /// With start time and expected arrival
    #[inline]
    #[must_use]
    pub fn started(mut self, at: DateTime<Utc>, expected_arrival: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self.expected_arrival = expected_arrival;
        self
    }

    /// With completion time
    #[inline]
    #[must_use]
    pub fn finished(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Only apply once every alert is resolved
    #[inline]
    #[must_use]
    pub fn once_alerts_resolved(mut self) -> Self {
        self.require_alerts_resolved = true;
        self
    }
}

/// Durable walk records
///
/// Implementations must make `update_last_location` and `set_state` atomic
/// per walk: the check and the write happen under the same lock or
/// transaction.
#[async_trait]
pub trait WalkStore: Send + Sync + Debug {
    /// Insert a new walk together with its initial watchers
    async fn create_walk(&self, walk: Walk, watchers: Vec<Watcher>) -> Result<Walk, StoreError>;

    /// Fetch a walk
    async fn get_walk(&self, id: WalkId) -> Result<Walk, StoreError>;

    /// The owner's walk in `created`, `active` or `alert`, if any
    async fn get_active_walk(&self, owner: UserId) -> Result<Option<Walk>, StoreError>;

    /// Overwrite the last-known location if `sample` is not older than it
    ///
    /// # Errors
    /// `StoreError::NotTracking` unless the walk is `active` or `alert`.
    async fn update_last_location(
        &self,
        id: WalkId,
        sample: LiveLocation,
    ) -> Result<LocationWrite, StoreError>;

    /// Compare-and-set the walk state
    ///
    /// # Errors
    /// - `StoreError::StateConflict` if the stored state is not `expected`
    /// - `StoreError::OpenAlerts` if the update requires resolved alerts and
    ///   some are still open; checked under the same lock as the state
    async fn set_state(
        &self,
        id: WalkId,
        expected: WalkState,
        update: StateUpdate,
    ) -> Result<Walk, StoreError>;

    /// Append an unresolved alert
    async fn append_alert(
        &self,
        id: WalkId,
        kind: AlertKind,
        message: String,
        at: DateTime<Utc>,
    ) -> Result<Alert, StoreError>;

    /// Mark an alert resolved; resolving twice returns the stored record
    async fn resolve_alert(
        &self,
        id: WalkId,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> Result<Alert, StoreError>;

    /// Append a checkpoint; a second append of the same kind is a no-op
    async fn append_checkpoint(
        &self,
        id: WalkId,
        kind: CheckpointKind,
        coordinate: Option<Coordinate>,
        at: DateTime<Utc>,
    ) -> Result<CheckpointWrite, StoreError>;

    /// Add a watcher to an existing walk
    async fn add_watcher(&self, watcher: Watcher) -> Result<Watcher, StoreError>;

    /// Watchers of a walk in insertion order
    async fn list_watchers(&self, id: WalkId) -> Result<Vec<Watcher>, StoreError>;

    /// Full alert history in creation order
    async fn list_alerts(&self, id: WalkId) -> Result<Vec<Alert>, StoreError>;

    /// Checkpoints in creation order
    async fn list_checkpoints(&self, id: WalkId) -> Result<Vec<Checkpoint>, StoreError>;

    /// Delete a walk and cascade its watchers, alerts and checkpoints
    async fn delete_walk(&self, id: WalkId) -> Result<(), StoreError>;
}
