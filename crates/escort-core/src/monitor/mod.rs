//! Anomaly monitor
//!
//! Evaluates every accepted sample against the stopped, deviated and timeout
//! rules and records milestone checkpoints. SOS enters through
//! [`AnomalyMonitor::raise`] directly.
//!
//! Raising an alert is ordered so a watcher never sees `alert` without the
//! record behind it:
//!
//! ```text
//! append_alert ──► active→alert (CAS) ──► publish Alert ──► publish State ──► notify
//!      │                  │
//!      │                  └─ failure: alert stays owed, next step retries the CAS
//!      └─ failure: nothing published, rule stays armed, next sample retries
//! ```
//!
//! Rule state for a walk is rebuilt from its stored alerts and checkpoints
//! the first time the monitor sees it, and every alert step for a walk runs
//! under that walk's rule lock.

mod rules;

pub use rules::{journey_progress, RuleState};

use crate::clock::Clock;
use crate::config::EscortConfig;
use crate::error::EscortError;
use crate::lifecycle::WalkLifecycle;
use crate::notify::{self, NotificationSink, WalkEvent};
use dashmap::DashMap;
use escort_broadcast::{Topic, Transport};
use escort_model::{
    Alert, AlertId, AlertKind, Checkpoint, LiveLocation, Walk, WalkId, WalkPayload, WalkState,
};
use escort_store::{CheckpointWrite, WalkStore};
use rules::WalkRules;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What one sample produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Alerts raised, in rule order
    pub alerts: Vec<Alert>,
    /// Checkpoints recorded for the first time
    pub checkpoints: Vec<Checkpoint>,
}

impl Evaluation {
    /// Nothing raised or recorded
    #[inline]
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.alerts.is_empty() && self.checkpoints.is_empty()
    }
}

/// Rule evaluation and alert raising
#[derive(Debug)]
pub struct AnomalyMonitor {
    store: Arc<dyn WalkStore>,
    transport: Arc<dyn Transport>,
    lifecycle: Arc<WalkLifecycle>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: Arc<EscortConfig>,
    rules: DashMap<WalkId, Arc<Mutex<WalkRules>>>,
}

impl AnomalyMonitor {
    /// Create the monitor
    #[must_use]
    pub fn new(
        store: Arc<dyn WalkStore>,
        transport: Arc<dyn Transport>,
        lifecycle: Arc<WalkLifecycle>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: Arc<EscortConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            lifecycle,
            notifier,
            clock,
            config,
            rules: DashMap::new(),
        }
    }

    /// Evaluate the newest sample of `walk`
    ///
    /// `walk` must already carry `sample` as its last location. Ended walks
    /// are not evaluated.
    ///
    /// # Errors
    /// A failed alert append fails the whole step; the rule stays armed and
    /// trips again on the next qualifying sample. A failed `active→alert`
    /// flip fails the step too; the stored alert is announced once a later
    /// step manages the flip. Checkpoint failures are logged and retried the
    /// same way.
    pub async fn evaluate(
        &self,
        walk: &Walk,
        sample: &LiveLocation,
    ) -> Result<Evaluation, EscortError> {
        if walk.state.is_terminal() {
            return Ok(Evaluation::default());
        }
        let Some(rules) = self.rules_for(walk.id).await? else {
            return Ok(Evaluation::default());
        };
        let mut rules = rules.lock().await;
        self.announce(walk.id, &mut rules).await?;

        let mut evaluation = Evaluation::default();
        for trip in rules.check(walk, sample, &self.config) {
            let alert = self.append(walk.id, trip.kind, trip.message).await?;
            rules.flag(alert.kind, alert.id);
            rules.owe(alert.clone());
            evaluation.alerts.push(alert);
        }
        self.announce(walk.id, &mut rules).await?;

        for kind in rules.pending_milestones(walk, sample, &self.config) {
            match self
                .store
                .append_checkpoint(walk.id, kind, Some(sample.coordinate()), self.clock.now())
                .await
            {
                Ok(write) => {
                    rules.mark_recorded(kind);
                    if let CheckpointWrite::Created(checkpoint) = write {
                        info!(walk_id = %walk.id, kind = %checkpoint.kind, "checkpoint recorded");
                        evaluation.checkpoints.push(checkpoint);
                    }
                }
                Err(e) => warn!(walk_id = %walk.id, %kind, error = %e, "checkpoint not recorded"),
            }
        }

        Ok(evaluation)
    }

    /// Store, flag, publish and signal one alert
    ///
    /// # Errors
    /// A failed append publishes nothing. A failed `active→alert` flip
    /// returns the error with the alert stored; the next evaluated sample
    /// retries the flip and announces it.
    pub async fn raise(
        &self,
        walk_id: WalkId,
        kind: AlertKind,
        message: String,
    ) -> Result<Alert, EscortError> {
        let shared = self.rules_for(walk_id).await?;
        let mut detached = WalkRules::default();
        let mut guard = match &shared {
            Some(rules) => Some(rules.lock().await),
            None => None,
        };
        let rules = guard.as_deref_mut().unwrap_or(&mut detached);

        let alert = self.append(walk_id, kind, message).await?;
        rules.flag(alert.kind, alert.id);
        rules.owe(alert.clone());
        self.announce(walk_id, rules).await?;
        Ok(alert)
    }

    /// Resolve `alert_id` and settle the walk state
    ///
    /// Re-arms the rule that raised the alert and republishes the resolved
    /// record. When no alert is left open the walk returns to `active`; the
    /// store refuses that flip while any alert is unresolved, so an alert
    /// appended concurrently keeps the walk in `alert`.
    ///
    /// Resolving twice returns the stored record without side effects.
    ///
    /// # Errors
    /// `NotFound` for an unknown walk or alert; store failures on the
    /// resolve itself.
    pub async fn resolve(&self, walk_id: WalkId, alert_id: AlertId) -> Result<Alert, EscortError> {
        let shared = self.rules_for(walk_id).await?;
        let mut detached = WalkRules::default();
        let mut guard = match &shared {
            Some(rules) => Some(rules.lock().await),
            None => None,
        };
        let rules = guard.as_deref_mut().unwrap_or(&mut detached);

        let existing = self
            .store
            .list_alerts(walk_id)
            .await?
            .into_iter()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| EscortError::NotFound {
                entity: "alert",
                id: alert_id.to_string(),
            })?;
        if existing.resolved {
            return Ok(existing);
        }

        let now = self.clock.now();
        let resolved = self.store.resolve_alert(walk_id, alert_id, now).await?;
        info!(%walk_id, %alert_id, kind = %resolved.kind, "alert resolved");
        if rules.acknowledge(resolved.kind, resolved.id, now, &self.config) {
            debug!(%walk_id, kind = %resolved.kind, "rule re-armed");
        }
        rules.drop_owed(alert_id);
        self.publish(walk_id, WalkPayload::Alert(resolved.clone())).await;

        match self.lifecycle.clear_alert(walk_id).await {
            Ok(Some(_)) => {
                self.publish(
                    walk_id,
                    WalkPayload::State {
                        state: WalkState::Active,
                    },
                )
                .await;
            }
            Ok(None) => {}
            Err(e) => warn!(%walk_id, error = %e, "walk not returned to active"),
        }

        Ok(resolved)
    }

    async fn append(
        &self,
        walk_id: WalkId,
        kind: AlertKind,
        message: String,
    ) -> Result<Alert, EscortError> {
        let alert = self
            .store
            .append_alert(walk_id, kind, message, self.clock.now())
            .await?;
        warn!(%walk_id, alert_id = %alert.id, %kind, message = %alert.message, "alert raised");
        Ok(alert)
    }

    /// Flip the walk to `alert`, then publish and signal every owed alert
    ///
    /// On a failed flip the alerts stay owed and nothing is published.
    async fn announce(&self, walk_id: WalkId, rules: &mut WalkRules) -> Result<(), EscortError> {
        let owed = rules.take_unannounced();
        if owed.is_empty() {
            return Ok(());
        }

        let flipped = match self.lifecycle.flag_alert(walk_id).await {
            Ok(flipped) => flipped.is_some(),
            Err(e) => {
                warn!(%walk_id, owed = owed.len(), error = %e, "walk not moved to alert");
                rules.restore_unannounced(owed);
                return Err(e);
            }
        };

        for alert in &owed {
            self.publish(walk_id, WalkPayload::Alert(alert.clone())).await;
        }
        if flipped {
            self.publish(
                walk_id,
                WalkPayload::State {
                    state: WalkState::Alert,
                },
            )
            .await;
        }
        for alert in owed {
            notify::signal(
                self.notifier.as_ref(),
                WalkEvent::WalkAlert {
                    walk_id,
                    alert_id: alert.id,
                    kind: alert.kind,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Re-arm the rule that raised `alert`
    ///
    /// Returns false for SOS alerts and for walks the monitor has no state
    /// for.
    pub async fn acknowledge(&self, alert: &Alert) -> bool {
        let Some(rules) = self.rules.get(&alert.walk_id).map(|r| Arc::clone(r.value())) else {
            return false;
        };
        let now = self.clock.now();
        let rearmed = rules
            .lock()
            .await
            .acknowledge(alert.kind, alert.id, now, &self.config);
        if rearmed {
            debug!(walk_id = %alert.walk_id, kind = %alert.kind, "rule re-armed");
        }
        rearmed
    }

    /// Current state of one rule for a walk
    pub async fn rule_state(&self, walk_id: WalkId, kind: AlertKind) -> Option<RuleState> {
        let rules = self.rules.get(&walk_id).map(|r| Arc::clone(r.value()))?;
        let state = rules.lock().await.state(kind);
        state
    }

    /// Drop rule state for an ended walk
    pub fn forget(&self, walk_id: WalkId) {
        if self.rules.remove(&walk_id).is_some() {
            debug!(%walk_id, "rule state dropped");
        }
    }

    /// Number of walks with rule state
    #[must_use]
    pub fn tracked_walks(&self) -> usize {
        self.rules.len()
    }

    /// Rule state for a walk, rebuilt from the store on first use
    ///
    /// `None` for an ended walk; nothing is kept for it.
    async fn rules_for(
        &self,
        walk_id: WalkId,
    ) -> Result<Option<Arc<Mutex<WalkRules>>>, EscortError> {
        if let Some(rules) = self.rules.get(&walk_id) {
            return Ok(Some(Arc::clone(rules.value())));
        }

        let walk = self.store.get_walk(walk_id).await?;
        if walk.state.is_terminal() {
            return Ok(None);
        }
        let alerts = self.store.list_alerts(walk_id).await?;
        let checkpoints = self.store.list_checkpoints(walk_id).await?;
        let resumed = WalkRules::resume(&walk, &alerts, &checkpoints);
        if alerts.iter().any(|a| !a.resolved) {
            debug!(%walk_id, "rule state resumed with open alerts");
        }

        let entry = self
            .rules
            .entry(walk_id)
            .or_insert_with(|| Arc::new(Mutex::new(resumed)));
        Ok(Some(Arc::clone(entry.value())))
    }

    async fn publish(&self, walk_id: WalkId, payload: WalkPayload) {
        let kind = payload.kind();
        if let Err(e) = self.transport.publish(&Topic::for_walk(walk_id), payload).await {
            warn!(%walk_id, kind, error = %e, "publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::UserContext;
    use crate::lifecycle::NewWalk;
    use crate::notify::ChannelNotifier;
    use chrono::Duration;
    use escort_broadcast::BroadcastHub;
    use escort_model::{geo, Coordinate, Place, UserId};
    use escort_store::{LocationWrite, MemoryWalkStore};
    use tokio::sync::mpsc;

    struct Fixture {
        monitor: AnomalyMonitor,
        store: Arc<MemoryWalkStore>,
        clock: Arc<ManualClock>,
        events: mpsc::UnboundedReceiver<WalkEvent>,
        walk: Walk,
    }

    fn origin() -> Coordinate {
        Coordinate::new(48.8566, 2.3522).unwrap()
    }

    async fn started_walk() -> Fixture {
        let store = Arc::new(MemoryWalkStore::new());
        let clock = Arc::new(ManualClock::default());
        let config = Arc::new(EscortConfig::default());
        let lifecycle = Arc::new(WalkLifecycle::new(store.clone(), clock.clone(), config.clone()));
        let (notifier, events) = ChannelNotifier::channel();
        let monitor = AnomalyMonitor::new(
            store.clone(),
            Arc::new(BroadcastHub::default()),
            lifecycle.clone(),
            Arc::new(notifier),
            clock.clone(),
            config,
        );

        let ctx = UserContext::new(UserId::new());
        let destination = Place::new(geo::destination_point(origin(), 0.0, 2_000.0));
        let draft = NewWalk::to(destination)
            .starting_at(Place::new(origin()))
            .with_estimated_duration(std::time::Duration::from_secs(1_500));
        let (walk, _) = lifecycle.create(&ctx, draft).await.unwrap();
        let walk = lifecycle.start(&ctx, walk.id, None).await.unwrap();

        Fixture {
            monitor,
            store,
            clock,
            events,
            walk,
        }
    }

    async fn feed(f: &Fixture, at: Coordinate, offset_secs: i64) -> Evaluation {
        let ts = f.walk.started_at.unwrap() + Duration::seconds(offset_secs);
        f.clock.set(ts);
        let sample = LiveLocation::at(at, ts);
        let walk = match f.store.update_last_location(f.walk.id, sample.clone()).await.unwrap() {
            LocationWrite::Applied(walk) => walk,
            LocationWrite::Stale { .. } => panic!("sample unexpectedly stale"),
        };
        f.monitor.evaluate(&walk, &sample).await.unwrap()
    }

    #[tokio::test]
    async fn deviation_raises_alert_and_flips_state() {
        let mut f = started_walk().await;
        let off_path = geo::destination_point(origin(), 90.0, 250.0);

        let evaluation = feed(&f, off_path, 10).await;

        assert_eq!(evaluation.alerts.len(), 1);
        assert_eq!(evaluation.alerts[0].kind, AlertKind::Deviated);
        let stored = f.store.get_walk(f.walk.id).await.unwrap();
        assert_eq!(stored.state, WalkState::Alert);
        assert_eq!(f.store.list_alerts(f.walk.id).await.unwrap().len(), 1);

        match f.events.recv().await.unwrap() {
            WalkEvent::WalkAlert { kind, .. } => assert_eq!(kind, AlertKind::Deviated),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn persisting_deviation_raises_one_alert() {
        let f = started_walk().await;
        let off_path = geo::destination_point(origin(), 90.0, 400.0);

        for tick in 1..=5 {
            feed(&f, off_path, tick * 10).await;
        }

        assert_eq!(f.store.list_alerts(f.walk.id).await.unwrap().len(), 1);
        assert!(matches!(
            f.monitor.rule_state(f.walk.id, AlertKind::Deviated).await,
            Some(RuleState::Flagged(_))
        ));
    }

    #[tokio::test]
    async fn acknowledged_rule_can_trip_again() {
        let f = started_walk().await;
        let off_path = geo::destination_point(origin(), 90.0, 400.0);
        let first = feed(&f, off_path, 10).await.alerts.remove(0);

        assert!(f.monitor.acknowledge(&first).await);
        let again = feed(&f, off_path, 20).await;
        assert_eq!(again.alerts.len(), 1);
        assert_ne!(again.alerts[0].id, first.id);
    }

    #[tokio::test]
    async fn timeout_raises_once() {
        let f = started_walk().await;
        let expected = f.walk.expected_arrival.unwrap();
        let late_secs = (expected - f.walk.started_at.unwrap()).num_seconds() + 5;
        // Keep moving so only the timeout rule can trip
        let mut raised = Vec::new();
        for (i, offset) in (late_secs..late_secs + 40).step_by(10).enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let on_path = geo::destination_point(origin(), 0.0, 1_700.0 + 15.0 * i as f64);
            raised.extend(feed(&f, on_path, offset).await.alerts);
        }
        let kinds: Vec<_> = raised.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::Timeout]);
    }

    #[tokio::test]
    async fn halfway_checkpoint_is_recorded_once() {
        let f = started_walk().await;
        let mut recorded = Vec::new();
        for (i, metres) in [800.0, 990.0, 1_010.0, 1_040.0, 1_200.0].into_iter().enumerate() {
            let at = geo::destination_point(origin(), 0.0, metres);
            let offset = i64::try_from(i).unwrap() * 10 + 10;
            recorded.extend(feed(&f, at, offset).await.checkpoints);
        }

        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].kind, escort_model::CheckpointKind::Halfway);
        let stored = f.store.list_checkpoints(f.walk.id).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn forget_drops_rule_state() {
        let f = started_walk().await;
        feed(&f, origin(), 10).await;
        assert_eq!(f.monitor.tracked_walks(), 1);
        f.monitor.forget(f.walk.id);
        assert_eq!(f.monitor.tracked_walks(), 0);
        assert!(f.monitor.rule_state(f.walk.id, AlertKind::Stopped).await.is_none());
    }
}
