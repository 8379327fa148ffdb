//! Walk lifecycle
//!
//! Creation, start, completion and cancellation, plus the `active <-> alert`
//! flag flips the monitor and alert resolution use. Every state change is a
//! compare-and-set against the state just read, so a stale writer can never
//! regress a newer state.

use crate::clock::{chrono_secs, Clock};
use crate::config::EscortConfig;
use crate::context::UserContext;
use crate::error::EscortError;
use crate::state_machine::validate_transition;
use chrono::{DateTime, Utc};
use escort_model::{
    geo, Coordinate, Place, ShareToken, UserId, Walk, WalkId, WalkState, Watcher, WatcherId,
    WatcherIdentity,
};
use escort_store::{StateUpdate, StoreError, WalkStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Compare-and-set retries before giving up on a contended walk
const MAX_CAS_ATTEMPTS: usize = 4;

/// Request to create a walk
#[derive(Debug, Clone, PartialEq)]
pub struct NewWalk {
    /// Where the walker is headed
    pub destination: Place,
    /// Known start point, if any
    pub start: Option<Place>,
    /// Estimated duration
    pub estimated_duration: Option<Duration>,
    /// Estimated distance in metres
    pub estimated_distance_m: Option<f64>,
    /// Route polyline for deviation checks
    pub route: Option<Vec<Coordinate>>,
    /// Initial watchers
    pub watchers: Vec<NewWatcher>,
}

impl NewWalk {
    /// Walk to `destination`
    #[inline]
    #[must_use]
    pub fn to(destination: Place) -> Self {
        Self {
            destination,
            start: None,
            estimated_duration: None,
            estimated_distance_m: None,
            route: None,
            watchers: Vec::new(),
        }
    }

    /// With start place
    #[inline]
    #[must_use]
    pub fn starting_at(mut self, start: Place) -> Self {
        self.start = Some(start);
        self
    }

    /// With estimated duration
    #[inline]
    #[must_use]
    pub fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }

    /// With estimated distance
    #[inline]
    #[must_use]
    pub fn with_estimated_distance(mut self, metres: f64) -> Self {
        self.estimated_distance_m = Some(metres);
        self
    }

    /// With route polyline
    #[inline]
    #[must_use]
    pub fn with_route(mut self, route: Vec<Coordinate>) -> Self {
        self.route = Some(route);
        self
    }

    /// Add a watcher
    #[inline]
    #[must_use]
    pub fn with_watcher(mut self, watcher: NewWatcher) -> Self {
        self.watchers.push(watcher);
        self
    }
}

/// Request to add a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewWatcher {
    /// Registered account
    Registered {
        /// Account id
        user_id: UserId,
        /// Display name
        name: Option<String>,
    },
    /// Anonymous share-link holder; a token is generated
    Anonymous {
        /// Display name
        name: Option<String>,
        /// Contact phone
        phone: Option<String>,
    },
}

impl NewWatcher {
    /// Registered watcher
    #[inline]
    #[must_use]
    pub fn user(user_id: UserId) -> Self {
        Self::Registered {
            user_id,
            name: None,
        }
    }

    /// Anonymous watcher
    #[inline]
    #[must_use]
    pub fn anonymous(name: impl Into<String>, phone: Option<String>) -> Self {
        Self::Anonymous {
            name: Some(name.into()),
            phone,
        }
    }
}

/// Result of a terminal transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Walk after the call
    pub walk: Walk,
    /// False when the walk was already in the target state
    pub changed: bool,
}

/// Lifecycle state machine over the durable store
#[derive(Debug)]
pub struct WalkLifecycle {
    store: Arc<dyn WalkStore>,
    clock: Arc<dyn Clock>,
    config: Arc<EscortConfig>,
}

impl WalkLifecycle {
    /// Create the lifecycle
    #[must_use]
    pub fn new(store: Arc<dyn WalkStore>, clock: Arc<dyn Clock>, config: Arc<EscortConfig>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Create a walk in `created`
    ///
    /// # Errors
    /// - `Validation` for out-of-range coordinates, short routes, bad
    ///   estimates or the owner listed as their own watcher
    /// - `InvalidState` if the owner already has an open walk
    pub async fn create(
        &self,
        ctx: &UserContext,
        draft: NewWalk,
    ) -> Result<(Walk, Vec<Watcher>), EscortError> {
        validate_draft(ctx, &draft)?;

        if let Some(open) = self.store.get_active_walk(ctx.user_id).await? {
            return Err(EscortError::invalid_state("create another walk beside", open.state));
        }

        let now = self.clock.now();
        let estimated_duration_secs = draft.estimated_duration.map(|d| d.as_secs()).or_else(|| {
            let distance = draft.estimated_distance_m.or_else(|| {
                draft
                    .start
                    .as_ref()
                    .map(|s| geo::haversine_m(s.coordinate, draft.destination.coordinate))
            })?;
            Some(self.estimate_secs(distance))
        });

        let walk = Walk {
            id: WalkId::new(),
            owner: ctx.user_id,
            start: draft.start,
            destination: draft.destination,
            route: draft.route,
            estimated_duration_secs,
            estimated_distance_m: draft.estimated_distance_m,
            state: WalkState::Created,
            last_location: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expected_arrival: None,
        };

        let watchers: Vec<Watcher> = draft
            .watchers
            .into_iter()
            .map(|w| build_watcher(walk.id, w, now))
            .collect();

        let walk = self.store.create_walk(walk, watchers.clone()).await?;
        info!(walk_id = %walk.id, owner = %walk.owner, watchers = watchers.len(), "walk created");
        Ok((walk, watchers))
    }

    /// `created -> active`
    ///
    /// Sets `started_at = now` and `expected_arrival = now + estimate +
    /// timeout buffer`. A start coordinate given here replaces the one
    /// supplied at creation.
    ///
    /// # Errors
    /// `InvalidState` unless the walk is `created`; `Validation` for a bad
    /// coordinate.
    pub async fn start(
        &self,
        ctx: &UserContext,
        id: WalkId,
        start: Option<Coordinate>,
    ) -> Result<Walk, EscortError> {
        if let Some(c) = start {
            c.validate()?;
        }
        let walk = self.owned_walk(ctx, id).await?;
        validate_transition("start", walk.state, WalkState::Active)?;

        let start_place = start.map(|c| match &walk.start {
            Some(existing) if existing.coordinate == c => existing.clone(),
            _ => Place::new(c),
        });

        let now = self.clock.now();
        let estimate_secs = walk.estimated_duration_secs.or_else(|| {
            let from = start.or_else(|| walk.start.as_ref().map(|s| s.coordinate))?;
            let distance = walk
                .estimated_distance_m
                .unwrap_or_else(|| geo::haversine_m(from, walk.destination.coordinate));
            Some(self.estimate_secs(distance))
        });
        let expected_arrival = self.expected_arrival(now, estimate_secs);

        if walk.estimated_duration_secs.is_none() && estimate_secs.is_some() {
            debug!(walk_id = %id, ?estimate_secs, "estimate derived at start");
        }
        let update = StateUpdate::to(WalkState::Active)
            .with_start(start_place)
            .started(now, expected_arrival);

        let started = self
            .store
            .set_state(id, WalkState::Created, update)
            .await
            .map_err(|e| match e {
                StoreError::StateConflict { actual, .. } => {
                    EscortError::invalid_state("start", actual)
                }
                other => other.into(),
            })?;

        info!(walk_id = %id, expected_arrival = ?started.expected_arrival, "walk started");
        Ok(started)
    }

    /// `{active, alert} -> completed`; idempotent on a completed walk
    ///
    /// # Errors
    /// `InvalidState` from `created` or `cancelled`.
    pub async fn complete(&self, ctx: &UserContext, id: WalkId) -> Result<Transition, EscortError> {
        self.finish(ctx, id, WalkState::Completed, "complete").await
    }

    /// `{created, active, alert} -> cancelled`; idempotent on a cancelled walk
    ///
    /// # Errors
    /// `InvalidState` from `completed`.
    pub async fn cancel(&self, ctx: &UserContext, id: WalkId) -> Result<Transition, EscortError> {
        self.finish(ctx, id, WalkState::Cancelled, "cancel").await
    }

    async fn finish(
        &self,
        ctx: &UserContext,
        id: WalkId,
        target: WalkState,
        operation: &'static str,
    ) -> Result<Transition, EscortError> {
        let mut last_seen = WalkState::Created;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let walk = self.owned_walk(ctx, id).await?;
            if walk.state == target {
                return Ok(Transition {
                    walk,
                    changed: false,
                });
            }
            validate_transition(operation, walk.state, target)?;

            let update = StateUpdate::to(target).finished(self.clock.now());
            match self.store.set_state(id, walk.state, update).await {
                Ok(walk) => {
                    info!(walk_id = %id, state = %walk.state, "walk finished");
                    return Ok(Transition {
                        walk,
                        changed: true,
                    });
                }
                Err(StoreError::StateConflict { actual, .. }) => {
                    debug!(walk_id = %id, %actual, "state changed underneath; retrying");
                    last_seen = actual;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EscortError::invalid_state(operation, last_seen))
    }

    /// `active -> alert`
    ///
    /// Returns the updated walk if this call flipped the state, `None` if the
    /// walk was already `alert` or has since ended.
    ///
    /// # Errors
    /// `InvalidState` for a walk that never started; store failures.
    pub async fn flag_alert(&self, id: WalkId) -> Result<Option<Walk>, EscortError> {
        self.flip(id, WalkState::Active, StateUpdate::to(WalkState::Alert))
            .await
    }

    /// `alert -> active`, only once every alert is resolved
    ///
    /// Returns the updated walk if this call flipped the state, `None` if an
    /// alert is still open or the walk is no longer `alert`.
    ///
    /// # Errors
    /// Store failures.
    pub async fn clear_alert(&self, id: WalkId) -> Result<Option<Walk>, EscortError> {
        let update = StateUpdate::to(WalkState::Active).once_alerts_resolved();
        self.flip(id, WalkState::Alert, update).await
    }

    async fn flip(
        &self,
        id: WalkId,
        from: WalkState,
        update: StateUpdate,
    ) -> Result<Option<Walk>, EscortError> {
        let to = update.state;
        match self.store.set_state(id, from, update).await {
            Ok(walk) => Ok(Some(walk)),
            Err(StoreError::StateConflict { actual, .. }) if actual == to || actual.is_terminal() => {
                Ok(None)
            }
            Err(StoreError::OpenAlerts { open }) => {
                debug!(walk_id = %id, open, "alerts still open; walk stays in alert");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The user's walk in `created`, `active` or `alert`
    ///
    /// # Errors
    /// Store failures.
    pub async fn get_active_walk(&self, ctx: &UserContext) -> Result<Option<Walk>, EscortError> {
        Ok(self.store.get_active_walk(ctx.user_id).await?)
    }

    /// Fetch a walk owned by the caller
    ///
    /// # Errors
    /// `NotFound`; `Unauthorized` if another user owns it.
    pub async fn owned_walk(&self, ctx: &UserContext, id: WalkId) -> Result<Walk, EscortError> {
        let walk = self.store.get_walk(id).await?;
        if walk.owner != ctx.user_id {
            return Err(EscortError::Unauthorized(format!(
                "user {} does not own walk {id}",
                ctx.user_id
            )));
        }
        Ok(walk)
    }

    /// Add a watcher to a walk that has not ended
    ///
    /// # Errors
    /// `InvalidState` on a terminal walk; `Validation` if the owner adds
    /// themselves.
    pub async fn add_watcher(
        &self,
        ctx: &UserContext,
        id: WalkId,
        watcher: NewWatcher,
    ) -> Result<Watcher, EscortError> {
        validate_watcher(ctx, &watcher)?;
        let walk = self.owned_walk(ctx, id).await?;
        if walk.state.is_terminal() {
            return Err(EscortError::invalid_state("add a watcher to", walk.state));
        }
        let watcher = build_watcher(id, watcher, self.clock.now());
        Ok(self.store.add_watcher(watcher).await?)
    }

    /// `started_at + estimate + timeout buffer`
    #[must_use]
    pub fn expected_arrival(
        &self,
        started_at: DateTime<Utc>,
        estimate_secs: Option<u64>,
    ) -> Option<DateTime<Utc>> {
        estimate_secs.map(|secs| started_at + chrono_secs(secs) + self.config.timeout_buffer())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn estimate_secs(&self, distance_m: f64) -> u64 {
        (distance_m / self.config.walking_speed_mps).round().max(0.0) as u64
    }
}

fn validate_draft(ctx: &UserContext, draft: &NewWalk) -> Result<(), EscortError> {
    draft.destination.coordinate.validate()?;
    if let Some(start) = &draft.start {
        start.coordinate.validate()?;
    }
    if let Some(route) = &draft.route {
        if route.len() < 2 {
            return Err(escort_model::ModelError::RouteTooShort(route.len()).into());
        }
        for point in route {
            point.validate()?;
        }
    }
    if let Some(d) = draft.estimated_distance_m {
        if !d.is_finite() || d < 0.0 {
            return Err(escort_model::ModelError::InvalidMeasurement {
                field: "estimated_distance_m",
                value: d,
            }
            .into());
        }
    }
    for watcher in &draft.watchers {
        validate_watcher(ctx, watcher)?;
    }
    Ok(())
}

fn validate_watcher(ctx: &UserContext, watcher: &NewWatcher) -> Result<(), EscortError> {
    match watcher {
        NewWatcher::Registered { user_id, .. } if *user_id == ctx.user_id => Err(
            EscortError::Validation("the walker cannot watch their own walk".to_string()),
        ),
        _ => Ok(()),
    }
}

fn build_watcher(walk_id: WalkId, request: NewWatcher, at: DateTime<Utc>) -> Watcher {
    let (identity, name, phone) = match request {
        NewWatcher::Registered { user_id, name } => {
            (WatcherIdentity::Registered { user_id }, name, None)
        }
        NewWatcher::Anonymous { name, phone } => (
            WatcherIdentity::Anonymous {
                share_token: new_share_token(),
            },
            name,
            phone,
        ),
    };
    Watcher {
        id: WatcherId::new(),
        walk_id,
        identity,
        name,
        phone,
        added_at: at,
    }
}

fn new_share_token() -> ShareToken {
    ShareToken(hex::encode(rand::random::<[u8; 16]>()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use escort_store::MemoryWalkStore;
    use proptest::prelude::*;

    struct Fixture {
        lifecycle: WalkLifecycle,
        clock: Arc<ManualClock>,
        ctx: UserContext,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let lifecycle = WalkLifecycle::new(
            Arc::new(MemoryWalkStore::new()),
            clock.clone(),
            Arc::new(EscortConfig::default()),
        );
        Fixture {
            lifecycle,
            clock,
            ctx: UserContext::new(UserId::new()),
        }
    }

    fn place(lat: f64, lon: f64) -> Place {
        Place::new(Coordinate::new(lat, lon).unwrap())
    }

    fn draft() -> NewWalk {
        NewWalk::to(place(51.5014, -0.1419)).with_estimated_duration(Duration::from_secs(1200))
    }

    #[tokio::test]
    async fn create_rejects_invalid_destination() {
        let f = fixture();
        let bad = NewWalk::to(Place::new(Coordinate {
            latitude: 123.0,
            longitude: 0.0,
        }));
        assert!(matches!(
            f.lifecycle.create(&f.ctx, bad).await,
            Err(EscortError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_second_open_walk() {
        let f = fixture();
        f.lifecycle.create(&f.ctx, draft()).await.unwrap();
        assert!(matches!(
            f.lifecycle.create(&f.ctx, draft()).await,
            Err(EscortError::InvalidState { state: WalkState::Created, .. })
        ));
    }

    #[tokio::test]
    async fn create_issues_share_tokens_for_anonymous_watchers() {
        let f = fixture();
        let friend = UserId::new();
        let (walk, watchers) = f
            .lifecycle
            .create(
                &f.ctx,
                draft()
                    .with_watcher(NewWatcher::user(friend))
                    .with_watcher(NewWatcher::anonymous("Mum", Some("+44".into()))),
            )
            .await
            .unwrap();

        assert_eq!(walk.state, WalkState::Created);
        assert_eq!(watchers.len(), 2);
        assert!(watchers[0].is_user(friend));
        match &watchers[1].identity {
            WatcherIdentity::Anonymous { share_token } => assert_eq!(share_token.as_str().len(), 32),
            other => panic!("expected anonymous watcher, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn owner_cannot_watch_own_walk() {
        let f = fixture();
        let result = f
            .lifecycle
            .create(&f.ctx, draft().with_watcher(NewWatcher::user(f.ctx.user_id)))
            .await;
        assert!(matches!(result, Err(EscortError::Validation(_))));
    }

    #[tokio::test]
    async fn start_sets_expected_arrival() {
        let f = fixture();
        let (walk, _) = f.lifecycle.create(&f.ctx, draft()).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(30));

        let start = Coordinate::new(51.5007, -0.1246).unwrap();
        let started = f.lifecycle.start(&f.ctx, walk.id, Some(start)).await.unwrap();

        let now = f.clock.now();
        assert_eq!(started.state, WalkState::Active);
        assert_eq!(started.started_at, Some(now));
        assert_eq!(
            started.expected_arrival,
            Some(now + chrono::Duration::seconds(1200) + chrono::Duration::seconds(600))
        );
        assert_eq!(started.start.unwrap().coordinate, start);
    }

    #[tokio::test]
    async fn start_derives_estimate_from_distance() {
        let f = fixture();
        let origin = place(0.0, 0.0);
        let dest = Place::new(geo::destination_point(origin.coordinate, 0.0, 1_400.0));
        let (walk, _) = f
            .lifecycle
            .create(&f.ctx, NewWalk::to(dest).starting_at(origin))
            .await
            .unwrap();
        assert_eq!(walk.estimated_duration_secs, Some(1_000));

        let started = f.lifecycle.start(&f.ctx, walk.id, None).await.unwrap();
        let expected = f.clock.now() + chrono::Duration::seconds(1_000 + 600);
        assert_eq!(started.expected_arrival, Some(expected));
    }

    #[tokio::test]
    async fn start_twice_is_invalid() {
        let f = fixture();
        let (walk, _) = f.lifecycle.create(&f.ctx, draft()).await.unwrap();
        f.lifecycle.start(&f.ctx, walk.id, None).await.unwrap();
        assert!(matches!(
            f.lifecycle.start(&f.ctx, walk.id, None).await,
            Err(EscortError::InvalidState { operation: "start", state: WalkState::Active })
        ));
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let f = fixture();
        let (walk, _) = f.lifecycle.create(&f.ctx, draft()).await.unwrap();
        f.lifecycle.start(&f.ctx, walk.id, None).await.unwrap();

        let first = f.lifecycle.complete(&f.ctx, walk.id).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(5));
        let second = f.lifecycle.complete(&f.ctx, walk.id).await.unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(first.walk, second.walk);
        assert!(first.walk.completed_at.is_some());
    }

    #[tokio::test]
    async fn only_one_terminal_state_is_reachable() {
        let f = fixture();
        let (walk, _) = f.lifecycle.create(&f.ctx, draft()).await.unwrap();
        let cancelled = f.lifecycle.cancel(&f.ctx, walk.id).await.unwrap();
        assert_eq!(cancelled.walk.state, WalkState::Cancelled);

        assert!(matches!(
            f.lifecycle.complete(&f.ctx, walk.id).await,
            Err(EscortError::InvalidState { state: WalkState::Cancelled, .. })
        ));
        assert!(matches!(
            f.lifecycle.start(&f.ctx, walk.id, None).await,
            Err(EscortError::InvalidState { .. })
        ));
        // Walk slot is free again
        assert!(f.lifecycle.get_active_walk(&f.ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_from_created_is_invalid() {
        let f = fixture();
        let (walk, _) = f.lifecycle.create(&f.ctx, draft()).await.unwrap();
        assert!(matches!(
            f.lifecycle.complete(&f.ctx, walk.id).await,
            Err(EscortError::InvalidState { state: WalkState::Created, .. })
        ));
    }

    #[tokio::test]
    async fn flag_and_clear_alert() {
        let f = fixture();
        let (walk, _) = f.lifecycle.create(&f.ctx, draft()).await.unwrap();
        f.lifecycle.start(&f.ctx, walk.id, None).await.unwrap();

        assert!(f.lifecycle.flag_alert(walk.id).await.unwrap().is_some());
        assert!(f.lifecycle.flag_alert(walk.id).await.unwrap().is_none());
        let cleared = f.lifecycle.clear_alert(walk.id).await.unwrap().unwrap();
        assert_eq!(cleared.state, WalkState::Active);
    }

    #[tokio::test]
    async fn other_users_cannot_drive_the_walk() {
        let f = fixture();
        let (walk, _) = f.lifecycle.create(&f.ctx, draft()).await.unwrap();
        let stranger = UserContext::new(UserId::new());
        assert!(matches!(
            f.lifecycle.start(&stranger, walk.id, None).await,
            Err(EscortError::Unauthorized(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_create_then_start_is_active_with_expected_arrival(
            lat in -89.0f64..89.0,
            lon in -179.0f64..179.0,
            estimate in 1u64..20_000,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let f = fixture();
                let draft = NewWalk::to(place(lat, lon))
                    .with_estimated_duration(Duration::from_secs(estimate));
                let (walk, _) = f.lifecycle.create(&f.ctx, draft).await.unwrap();
                let started = f.lifecycle.start(&f.ctx, walk.id, None).await.unwrap();

                prop_assert_eq!(started.state, WalkState::Active);
                let started_at = started.started_at.unwrap();
                prop_assert_eq!(
                    started.expected_arrival.unwrap(),
                    started_at + chrono_secs(estimate) + chrono::Duration::seconds(600)
                );
                Ok(())
            })?;
        }
    }
}
