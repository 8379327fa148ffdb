//! In-memory walk store
//!
//! One [`DashMap`] entry per walk holds the walk and its child records, so
//! every conditional write runs under that entry's shard lock.

use crate::error::StoreError;
use crate::store::{CheckpointWrite, LocationWrite, StateUpdate, WalkStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use escort_model::{
    Alert, AlertId, AlertKind, Checkpoint, CheckpointId, CheckpointKind, Coordinate, LiveLocation,
    UserId, Walk, WalkId, WalkState, Watcher,
};

/// Walk plus its owned child records
#[derive(Debug, Clone)]
struct WalkEntry {
    walk: Walk,
    watchers: Vec<Watcher>,
    alerts: Vec<Alert>,
    checkpoints: Vec<Checkpoint>,
}

/// Process-local store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryWalkStore {
    walks: DashMap<WalkId, WalkEntry>,
}

impl MemoryWalkStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of walks held
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.walks.len()
    }

    /// Whether the store holds no walks
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.walks.is_empty()
    }

    fn with_entry<T>(
        &self,
        id: WalkId,
        f: impl FnOnce(&mut WalkEntry) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut entry = self
            .walks
            .get_mut(&id)
            .ok_or_else(|| StoreError::walk_not_found(id))?;
        f(entry.value_mut())
    }

    fn read_entry<T>(&self, id: WalkId, f: impl FnOnce(&WalkEntry) -> T) -> Result<T, StoreError> {
        self.walks
            .get(&id)
            .map(|entry| f(entry.value()))
            .ok_or_else(|| StoreError::walk_not_found(id))
    }
}

#[async_trait]
impl WalkStore for MemoryWalkStore {
    async fn create_walk(&self, walk: Walk, watchers: Vec<Watcher>) -> Result<Walk, StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.walks.entry(walk.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(walk.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(WalkEntry {
                    walk: walk.clone(),
                    watchers,
                    alerts: Vec::new(),
                    checkpoints: Vec::new(),
                });
                tracing::debug!(walk_id = %walk.id, owner = %walk.owner, "walk stored");
                Ok(walk)
            }
        }
    }

    async fn get_walk(&self, id: WalkId) -> Result<Walk, StoreError> {
        self.read_entry(id, |e| e.walk.clone())
    }

    async fn get_active_walk(&self, owner: UserId) -> Result<Option<Walk>, StoreError> {
        // Newest first if the single-open-walk rule was ever violated
        Ok(self
            .walks
            .iter()
            .filter(|e| e.walk.owner == owner && !e.walk.state.is_terminal())
            .map(|e| e.walk.clone())
            .max_by_key(|w| w.created_at))
    }

    async fn update_last_location(
        &self,
        id: WalkId,
        sample: LiveLocation,
    ) -> Result<LocationWrite, StoreError> {
        self.with_entry(id, |entry| {
            let walk = &mut entry.walk;
            if !walk.state.is_tracking() {
                return Err(StoreError::NotTracking { state: walk.state });
            }
            if let Some(current) = &walk.last_location {
                if sample.timestamp < current.timestamp {
                    return Ok(LocationWrite::Stale {
                        current: current.clone(),
                    });
                }
            }
            walk.last_location = Some(sample);
            Ok(LocationWrite::Applied(walk.clone()))
        })
    }

    async fn set_state(
        &self,
        id: WalkId,
        expected: WalkState,
        update: StateUpdate,
    ) -> Result<Walk, StoreError> {
        self.with_entry(id, |entry| {
            if entry.walk.state != expected {
                return Err(StoreError::StateConflict {
                    expected,
                    actual: entry.walk.state,
                });
            }
            if update.require_alerts_resolved {
                let open = entry.alerts.iter().filter(|a| !a.resolved).count();
                if open > 0 {
                    return Err(StoreError::OpenAlerts { open });
                }
            }
            let walk = &mut entry.walk;
            walk.state = update.state;
            if let Some(start) = update.start {
                walk.start = Some(start);
            }
            if let Some(at) = update.started_at {
                walk.started_at = Some(at);
            }
            if update.expected_arrival.is_some() {
                walk.expected_arrival = update.expected_arrival;
            }
            if walk.completed_at.is_none() {
                walk.completed_at = update.completed_at;
            }
            Ok(walk.clone())
        })
    }

    async fn append_alert(
        &self,
        id: WalkId,
        kind: AlertKind,
        message: String,
        at: DateTime<Utc>,
    ) -> Result<Alert, StoreError> {
        self.with_entry(id, |entry| {
            let alert = Alert {
                id: AlertId::new(),
                walk_id: id,
                kind,
                message,
                resolved: false,
                created_at: at,
                resolved_at: None,
            };
            entry.alerts.push(alert.clone());
            Ok(alert)
        })
    }

    async fn resolve_alert(
        &self,
        id: WalkId,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> Result<Alert, StoreError> {
        self.with_entry(id, |entry| {
            let alert = entry
                .alerts
                .iter_mut()
                .find(|a| a.id == alert_id)
                .ok_or_else(|| StoreError::NotFound {
                    entity: "alert",
                    id: alert_id.to_string(),
                })?;
            if !alert.resolved {
                alert.resolved = true;
                alert.resolved_at = Some(at);
            }
            Ok(alert.clone())
        })
    }

    async fn append_checkpoint(
        &self,
        id: WalkId,
        kind: CheckpointKind,
        coordinate: Option<Coordinate>,
        at: DateTime<Utc>,
    ) -> Result<CheckpointWrite, StoreError> {
        self.with_entry(id, |entry| {
            if let Some(existing) = entry.checkpoints.iter().find(|c| c.kind == kind) {
                return Ok(CheckpointWrite::Existing(existing.clone()));
            }
            let checkpoint = Checkpoint {
                id: CheckpointId::new(),
                walk_id: id,
                kind,
                coordinate,
                recorded_at: at,
            };
            entry.checkpoints.push(checkpoint.clone());
            Ok(CheckpointWrite::Created(checkpoint))
        })
    }

    async fn add_watcher(&self, watcher: Watcher) -> Result<Watcher, StoreError> {
        self.with_entry(watcher.walk_id, |entry| {
            entry.watchers.push(watcher.clone());
            Ok(watcher)
        })
    }

    async fn list_watchers(&self, id: WalkId) -> Result<Vec<Watcher>, StoreError> {
        self.read_entry(id, |e| e.watchers.clone())
    }

    async fn list_alerts(&self, id: WalkId) -> Result<Vec<Alert>, StoreError> {
        self.read_entry(id, |e| e.alerts.clone())
    }

    async fn list_checkpoints(&self, id: WalkId) -> Result<Vec<Checkpoint>, StoreError> {
        self.read_entry(id, |e| e.checkpoints.clone())
    }

    async fn delete_walk(&self, id: WalkId) -> Result<(), StoreError> {
        self.walks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::walk_not_found(id))
    }
}
