//! Testing utilities for the escort workspace
//!
//! Shared fixtures, a scripted position source and a store wrapper that can
//! be told to fail.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escort_broadcast::BroadcastHub;
use escort_core::{
    AccuracyHint, ChannelNotifier, Clock, EscortConfig, ManualClock, NewWalk, PositionError,
    PositionFix, PositionSource, UserContext, WalkEvent, WalkService,
};
use escort_model::{
    geo, Alert, AlertId, AlertKind, Checkpoint, CheckpointKind, Coordinate, LiveLocation, Place,
    UserId, Walk, WalkId, WalkState, Watcher,
};
use escort_store::{
    CheckpointWrite, LocationWrite, MemoryWalkStore, StateUpdate, StoreError, WalkStore,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Fixed origin used by every fixture (Trafalgar Square)
pub fn origin() -> Coordinate {
    Coordinate {
        latitude: 51.508_039,
        longitude: -0.128_069,
    }
}

/// Point `metres` due north of `from`
pub fn north_of(from: Coordinate, metres: f64) -> Coordinate {
    geo::destination_point(from, 0.0, metres)
}

/// Point `metres` due east of `from`
pub fn east_of(from: Coordinate, metres: f64) -> Coordinate {
    geo::destination_point(from, 90.0, metres)
}

/// Walk from [`origin`] to a point `distance_m` north of it
pub fn straight_walk(distance_m: f64, estimate: Duration) -> NewWalk {
    NewWalk::to(Place::new(north_of(origin(), distance_m)).with_address("Destination"))
        .starting_at(Place::new(origin()))
        .with_estimated_duration(estimate)
}

/// Sample at `at`
pub fn sample_at(at: Coordinate, timestamp: DateTime<Utc>) -> LiveLocation {
    LiveLocation::at(at, timestamp)
}

/// Fully wired service over inspectable collaborators
pub struct TestRig {
    pub service: WalkService,
    pub store: Arc<FailingStore>,
    pub hub: Arc<BroadcastHub>,
    pub clock: Arc<ManualClock>,
    pub events: mpsc::UnboundedReceiver<WalkEvent>,
    pub owner: UserContext,
}

impl TestRig {
    /// Current manual time
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Move the clock forward
    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    /// Create and start a straight walk of `distance_m`, starting at [`origin`]
    pub async fn started_walk(&self, distance_m: f64, estimate: Duration) -> Walk {
        start_straight_walk(&self.service, &self.owner, distance_m, estimate).await
    }

    /// Report a sample at `at` stamped with the current clock
    pub async fn report(&self, walk_id: WalkId, at: Coordinate) -> escort_core::SampleOutcome {
        let sample = sample_at(at, self.now());
        self.service
            .report_location(&self.owner, walk_id, sample)
            .await
            .unwrap()
    }

    /// Drain notification events received so far
    pub fn drain_events(&mut self) -> Vec<WalkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// A second service over the same store, hub and clock, as after a
    /// process restart
    pub fn restarted_service(&self) -> WalkService {
        WalkService::builder()
            .with_config(self.service.config().clone())
            .with_store(self.store.clone())
            .with_transport(self.hub.clone())
            .with_clock(self.clock.clone())
            .build()
            .unwrap()
    }
}

/// Service with default configuration
pub fn setup_service() -> TestRig {
    setup_service_with(EscortConfig::default())
}

/// Service with `config`, a manual clock and a channel notifier
pub fn setup_service_with(config: EscortConfig) -> TestRig {
    let store = Arc::new(FailingStore::new());
    let hub = Arc::new(BroadcastHub::new(config.broadcast_capacity));
    let clock = Arc::new(ManualClock::new(fixed_start()));
    let (notifier, events) = ChannelNotifier::channel();

    let service = WalkService::builder()
        .with_config(config)
        .with_store(store.clone())
        .with_transport(hub.clone())
        .with_clock(clock.clone())
        .with_notifier(Arc::new(notifier))
        .build()
        .unwrap();

    TestRig {
        service,
        store,
        hub,
        clock,
        events,
        owner: UserContext::new(UserId::new()),
    }
}

/// Service whose clock follows tokio time, for sampler tests under
/// `start_paused`
pub struct TrackingRig {
    pub service: WalkService,
    pub hub: Arc<BroadcastHub>,
    pub events: mpsc::UnboundedReceiver<WalkEvent>,
    pub owner: UserContext,
}

impl TrackingRig {
    /// Create and start a straight walk of `distance_m`, starting at [`origin`]
    pub async fn started_walk(&self, distance_m: f64, estimate: Duration) -> Walk {
        start_straight_walk(&self.service, &self.owner, distance_m, estimate).await
    }

    /// Drain notification events received so far
    pub fn drain_events(&mut self) -> Vec<WalkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Tracking service with `config`
pub fn setup_tracking_service(config: EscortConfig) -> TrackingRig {
    let hub = Arc::new(BroadcastHub::new(config.broadcast_capacity));
    let (notifier, events) = ChannelNotifier::channel();
    let service = WalkService::builder()
        .with_config(config)
        .with_transport(hub.clone())
        .with_clock(Arc::new(TokioClock::new(fixed_start())))
        .with_notifier(Arc::new(notifier))
        .build()
        .unwrap();
    TrackingRig {
        service,
        hub,
        events,
        owner: UserContext::new(UserId::new()),
    }
}

/// Create and start a straight walk on `service`
pub async fn start_straight_walk(
    service: &WalkService,
    owner: &UserContext,
    distance_m: f64,
    estimate: Duration,
) -> Walk {
    let created = service
        .create_walk(owner, straight_walk(distance_m, estimate))
        .await
        .unwrap();
    service
        .start_walk(owner, created.walk.id, Some(origin()))
        .await
        .unwrap()
}

/// Wall clock derived from tokio's clock, so paused-time tests get
/// advancing timestamps
#[derive(Debug)]
pub struct TokioClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}

/// Deterministic start time for fixtures
pub fn fixed_start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-04T21:30:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Position source replaying a script of fixes
///
/// Once the script runs out the last fix is repeated; an empty script
/// yields `Unavailable`.
#[derive(Debug, Default)]
pub struct ScriptedPositionSource {
    script: Mutex<VecDeque<Result<PositionFix, PositionError>>>,
    last: Mutex<Option<PositionFix>>,
    calls: AtomicUsize,
}

impl ScriptedPositionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fix at `at`
    pub fn then_fix(self, at: Coordinate) -> Self {
        self.script.lock().push_back(Ok(PositionFix::new(at)));
        self
    }

    /// Queue a failure
    pub fn then_fail(self, error: PositionError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Queue a fix while running
    pub fn push_fix(&self, at: Coordinate) {
        self.script.lock().push_back(Ok(PositionFix::new(at)));
    }

    /// Number of fixes requested so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionSource for ScriptedPositionSource {
    async fn current_position(&self, _accuracy: AccuracyHint) -> Result<PositionFix, PositionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            Some(Ok(fix)) => {
                *self.last.lock() = Some(fix.clone());
                Ok(fix)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last
                .lock()
                .clone()
                .ok_or_else(|| PositionError::Unavailable("script exhausted".into())),
        }
    }
}

/// In-memory store whose writes can be made to fail or be interleaved
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryWalkStore,
    fail_alerts: AtomicBool,
    fail_checkpoints: AtomicBool,
    failing_alert_flips: AtomicUsize,
    alert_before_clear: Mutex<Option<AlertKind>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle `append_alert` failures
    pub fn fail_alerts(&self, fail: bool) {
        self.fail_alerts.store(fail, Ordering::SeqCst);
    }

    /// Toggle `append_checkpoint` failures
    pub fn fail_checkpoints(&self, fail: bool) {
        self.fail_checkpoints.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `times` `active -> alert` state changes
    pub fn fail_alert_flips(&self, times: usize) {
        self.failing_alert_flips.store(times, Ordering::SeqCst);
    }

    /// Append an alert of `kind` just before the next `alert -> active`
    /// state change, as a concurrent writer would
    pub fn append_alert_before_clear(&self, kind: AlertKind) {
        *self.alert_before_clear.lock() = Some(kind);
    }

    fn outage() -> StoreError {
        StoreError::Unavailable("injected outage".into())
    }
}

#[async_trait]
impl WalkStore for FailingStore {
    async fn create_walk(&self, walk: Walk, watchers: Vec<Watcher>) -> Result<Walk, StoreError> {
        self.inner.create_walk(walk, watchers).await
    }

    async fn get_walk(&self, id: WalkId) -> Result<Walk, StoreError> {
        self.inner.get_walk(id).await
    }

    async fn get_active_walk(&self, owner: UserId) -> Result<Option<Walk>, StoreError> {
        self.inner.get_active_walk(owner).await
    }

    async fn update_last_location(
        &self,
        id: WalkId,
        sample: LiveLocation,
    ) -> Result<LocationWrite, StoreError> {
        self.inner.update_last_location(id, sample).await
    }

    async fn set_state(
        &self,
        id: WalkId,
        expected: WalkState,
        update: StateUpdate,
    ) -> Result<Walk, StoreError> {
        if expected == WalkState::Active && update.state == WalkState::Alert {
            let failing = self.failing_alert_flips.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_alert_flips.store(failing - 1, Ordering::SeqCst);
                return Err(Self::outage());
            }
        }
        if expected == WalkState::Alert && update.state == WalkState::Active {
            let injected = self.alert_before_clear.lock().take();
            if let Some(kind) = injected {
                let at = self.inner.get_walk(id).await?.created_at;
                self.inner
                    .append_alert(id, kind, "raised concurrently".into(), at)
                    .await?;
            }
        }
        self.inner.set_state(id, expected, update).await
    }

    async fn append_alert(
        &self,
        id: WalkId,
        kind: AlertKind,
        message: String,
        at: DateTime<Utc>,
    ) -> Result<Alert, StoreError> {
        if self.fail_alerts.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.append_alert(id, kind, message, at).await
    }

    async fn resolve_alert(
        &self,
        id: WalkId,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> Result<Alert, StoreError> {
        self.inner.resolve_alert(id, alert_id, at).await
    }

    async fn append_checkpoint(
        &self,
        id: WalkId,
        kind: CheckpointKind,
        coordinate: Option<Coordinate>,
        at: DateTime<Utc>,
    ) -> Result<CheckpointWrite, StoreError> {
        if self.fail_checkpoints.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.append_checkpoint(id, kind, coordinate, at).await
    }

    async fn add_watcher(&self, watcher: Watcher) -> Result<Watcher, StoreError> {
        self.inner.add_watcher(watcher).await
    }

    async fn list_watchers(&self, id: WalkId) -> Result<Vec<Watcher>, StoreError> {
        self.inner.list_watchers(id).await
    }

    async fn list_alerts(&self, id: WalkId) -> Result<Vec<Alert>, StoreError> {
        self.inner.list_alerts(id).await
    }

    async fn list_checkpoints(&self, id: WalkId) -> Result<Vec<Checkpoint>, StoreError> {
        self.inner.list_checkpoints(id).await
    }

    async fn delete_walk(&self, id: WalkId) -> Result<(), StoreError> {
        self.inner.delete_walk(id).await
    }
}
