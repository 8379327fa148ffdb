//! Watcher sessions
//!
//! A session is a snapshot of the walk plus a live subscription to its
//! topic. The subscription is taken before the snapshot is read so nothing
//! published in between is lost; anything that arrives twice (once in the
//! snapshot, once on the wire) is folded away when applied. There is no
//! replay and no polling: a watcher that suspects it missed updates calls
//! [`WatcherSession::resync`] or attaches again.

use crate::context::Viewer;
use crate::error::EscortError;
use escort_broadcast::{PayloadHandler, Subscription, Topic, Transport};
use escort_model::{Alert, Checkpoint, LiveLocation, Walk, WalkId, WalkPayload, Watcher};
use escort_store::WalkStore;
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What a watcher currently knows about a walk
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherView {
    /// Walk record; `state` follows live updates
    pub walk: Walk,
    /// Everyone entitled to watch
    pub watchers: Vec<Watcher>,
    /// Full alert history
    pub alerts: Vec<Alert>,
    /// Milestones so far
    pub checkpoints: Vec<Checkpoint>,
    /// Newest known position
    pub location: Option<LiveLocation>,
}

impl WatcherView {
    async fn load(store: &dyn WalkStore, walk_id: WalkId) -> Result<Self, EscortError> {
        let walk = store.get_walk(walk_id).await?;
        let watchers = store.list_watchers(walk_id).await?;
        let alerts = store.list_alerts(walk_id).await?;
        let checkpoints = store.list_checkpoints(walk_id).await?;
        let location = walk.last_location.clone();
        Ok(Self {
            walk,
            watchers,
            alerts,
            checkpoints,
            location,
        })
    }

    /// Unresolved alerts
    pub fn open_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| !a.resolved)
    }

    /// Fold one payload in; false if it told us nothing new
    fn apply(&mut self, payload: &WalkPayload) -> bool {
        match payload {
            WalkPayload::Location(sample) => {
                if self
                    .location
                    .as_ref()
                    .is_some_and(|current| sample.timestamp <= current.timestamp)
                {
                    return false;
                }
                self.location = Some(sample.clone());
                self.walk.last_location = Some(sample.clone());
                true
            }
            WalkPayload::Alert(alert) => {
                match self.alerts.iter_mut().find(|a| a.id == alert.id) {
                    Some(known) if known.resolved == alert.resolved => return false,
                    Some(known) => *known = alert.clone(),
                    None => self.alerts.push(alert.clone()),
                }
                true
            }
            WalkPayload::State { state } => {
                if self.walk.state == *state {
                    return false;
                }
                self.walk.state = *state;
                true
            }
        }
    }
}

/// A viewer's live view of one walk
#[derive(Debug)]
pub struct WatcherSession {
    walk_id: WalkId,
    viewer: Viewer,
    view: WatcherView,
    updates: mpsc::UnboundedReceiver<WalkPayload>,
    subscription: Option<Subscription>,
}

impl WatcherSession {
    /// Authorize `viewer`, subscribe to the walk topic and load the snapshot
    ///
    /// # Errors
    /// - `NotFound` for an unknown walk
    /// - `Unauthorized` if the viewer is neither the owner nor a watcher
    /// - `Transport` if the subscription cannot be set up
    pub async fn attach(
        store: &dyn WalkStore,
        transport: &dyn Transport,
        walk_id: WalkId,
        viewer: Viewer,
    ) -> Result<Self, EscortError> {
        let walk = store.get_walk(walk_id).await?;
        let watchers = store.list_watchers(walk_id).await?;
        if !viewer.can_observe(&walk, &watchers) {
            return Err(EscortError::Unauthorized(format!(
                "viewer may not observe walk {walk_id}"
            )));
        }

        let (tx, updates) = mpsc::unbounded_channel();
        let handler: PayloadHandler = Arc::new(move |payload| {
            // Receiver gone means the session was dropped mid-delivery
            let _ = tx.send(payload);
        });
        let subscription = transport.subscribe(&Topic::for_walk(walk_id), handler).await?;

        let view = WatcherView::load(store, walk_id).await?;
        info!(%walk_id, state = %view.walk.state, alerts = view.alerts.len(), "watcher attached");

        Ok(Self {
            walk_id,
            viewer,
            view,
            updates,
            subscription: Some(subscription),
        })
    }

    /// Observed walk
    #[inline]
    #[must_use]
    pub fn walk_id(&self) -> WalkId {
        self.walk_id
    }

    /// Who is watching
    #[inline]
    #[must_use]
    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    /// Current view
    #[inline]
    #[must_use]
    pub fn view(&self) -> &WatcherView {
        &self.view
    }

    /// Newest known position
    #[inline]
    #[must_use]
    pub fn location(&self) -> Option<&LiveLocation> {
        self.view.location.as_ref()
    }

    /// Whether the subscription is still delivering
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.subscription.as_ref().is_some_and(Subscription::is_active)
    }

    /// Wait for the next update that changes the view
    ///
    /// Returns `None` once the subscription has ended and the queue is
    /// drained.
    pub async fn next_update(&mut self) -> Option<WalkPayload> {
        loop {
            let payload = self.updates.recv().await?;
            if self.view.apply(&payload) {
                return Some(payload);
            }
            debug!(walk_id = %self.walk_id, kind = payload.kind(), "update already known");
        }
    }

    /// Apply the next queued update without waiting
    pub fn try_next_update(&mut self) -> Option<WalkPayload> {
        while let Ok(payload) = self.updates.try_recv() {
            if self.view.apply(&payload) {
                return Some(payload);
            }
        }
        None
    }

    /// Updates as a stream
    pub fn updates(&mut self) -> impl Stream<Item = WalkPayload> + '_ {
        stream::poll_fn(move |cx| loop {
            match self.updates.poll_recv(cx) {
                Poll::Ready(Some(payload)) => {
                    if self.view.apply(&payload) {
                        return Poll::Ready(Some(payload));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        })
    }

    /// Reload the snapshot from the durable last-known fields
    ///
    /// The subscription is kept; queued updates still apply on top.
    ///
    /// # Errors
    /// Store failures; the old view is kept.
    pub async fn resync(&mut self, store: &dyn WalkStore) -> Result<(), EscortError> {
        self.view = WatcherView::load(store, self.walk_id).await?;
        debug!(walk_id = %self.walk_id, "watcher resynced");
        Ok(())
    }

    /// Unsubscribe and release the delivery task
    pub fn detach(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        info!(walk_id = %self.walk_id, "watcher detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::EscortConfig;
    use crate::context::UserContext;
    use crate::lifecycle::{NewWalk, NewWatcher, WalkLifecycle};
    use chrono::{Duration, Utc};
    use escort_broadcast::BroadcastHub;
    use escort_model::{AlertKind, Coordinate, Place, UserId, WalkState, WatcherIdentity};
    use escort_store::MemoryWalkStore;
    use futures::StreamExt;

    struct Rig {
        store: Arc<MemoryWalkStore>,
        hub: Arc<BroadcastHub>,
        walk: Walk,
        owner: UserId,
        friend: UserId,
        token: escort_model::ShareToken,
    }

    fn spot(metres_north: f64) -> Coordinate {
        let origin = Coordinate::new(-33.8688, 151.2093).unwrap();
        escort_model::geo::destination_point(origin, 0.0, metres_north)
    }

    async fn rig() -> Rig {
        let store = Arc::new(MemoryWalkStore::new());
        let lifecycle = WalkLifecycle::new(
            store.clone(),
            Arc::new(SystemClock),
            Arc::new(EscortConfig::default()),
        );
        let owner = UserId::new();
        let friend = UserId::new();
        let ctx = UserContext::new(owner);
        let draft = NewWalk::to(Place::new(spot(1_000.0)))
            .with_watcher(NewWatcher::user(friend))
            .with_watcher(NewWatcher::anonymous("Sam", None));
        let (walk, watchers) = lifecycle.create(&ctx, draft).await.unwrap();
        let walk = lifecycle.start(&ctx, walk.id, Some(spot(0.0))).await.unwrap();

        let token = match &watchers[1].identity {
            WatcherIdentity::Anonymous { share_token } => share_token.clone(),
            WatcherIdentity::Registered { .. } => unreachable!(),
        };

        Rig {
            store,
            hub: Arc::new(BroadcastHub::default()),
            walk,
            owner,
            friend,
            token,
        }
    }

    async fn record(rig: &Rig, sample: &LiveLocation) {
        rig.store
            .update_last_location(rig.walk.id, sample.clone())
            .await
            .unwrap();
        rig.hub
            .publish(&Topic::for_walk(rig.walk.id), WalkPayload::Location(sample.clone()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn strangers_are_turned_away() {
        let rig = rig().await;
        for viewer in [
            Viewer::User(UserId::new()),
            Viewer::Token(escort_model::ShareToken("nope".into())),
        ] {
            let result =
                WatcherSession::attach(rig.store.as_ref(), rig.hub.as_ref(), rig.walk.id, viewer).await;
            assert!(matches!(result, Err(EscortError::Unauthorized(_))));
        }
        assert_eq!(rig.hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn owner_friend_and_link_holder_may_attach() {
        let rig = rig().await;
        for viewer in [
            Viewer::User(rig.owner),
            Viewer::User(rig.friend),
            Viewer::Token(rig.token.clone()),
        ] {
            let session =
                WatcherSession::attach(rig.store.as_ref(), rig.hub.as_ref(), rig.walk.id, viewer)
                    .await
                    .unwrap();
            assert_eq!(session.view().walk.state, WalkState::Active);
            assert_eq!(session.view().watchers.len(), 2);
        }
    }

    #[tokio::test]
    async fn snapshot_carries_last_known_location_and_alerts() {
        let rig = rig().await;
        let t0 = Utc::now();
        record(&rig, &LiveLocation::at(spot(100.0), t0)).await;
        rig.store
            .append_alert(rig.walk.id, AlertKind::Deviated, "off path".into(), t0)
            .await
            .unwrap();

        let session =
            WatcherSession::attach(rig.store.as_ref(), rig.hub.as_ref(), rig.walk.id, Viewer::User(rig.friend))
                .await
                .unwrap();

        assert_eq!(session.location().map(LiveLocation::coordinate), Some(spot(100.0)));
        assert_eq!(session.view().alerts.len(), 1);
        assert_eq!(session.view().open_alerts().count(), 1);
    }

    #[tokio::test]
    async fn watcher_sees_only_what_was_published_after_attach() {
        let rig = rig().await;
        let t0 = Utc::now();
        record(&rig, &LiveLocation::at(spot(10.0), t0)).await;
        record(&rig, &LiveLocation::at(spot(20.0), t0 + Duration::seconds(10))).await;

        let mut session =
            WatcherSession::attach(rig.store.as_ref(), rig.hub.as_ref(), rig.walk.id, Viewer::User(rig.friend))
                .await
                .unwrap();
        let third = LiveLocation::at(spot(30.0), t0 + Duration::seconds(20));
        record(&rig, &third).await;

        assert_eq!(session.next_update().await, Some(WalkPayload::Location(third.clone())));
        assert_eq!(session.location(), Some(&third));
        assert!(session.try_next_update().is_none());
    }

    #[tokio::test]
    async fn stale_and_duplicate_updates_are_folded_away() {
        let rig = rig().await;
        let t0 = Utc::now();
        let mut session =
            WatcherSession::attach(rig.store.as_ref(), rig.hub.as_ref(), rig.walk.id, Viewer::User(rig.owner))
                .await
                .unwrap();
        let topic = Topic::for_walk(rig.walk.id);

        let newer = LiveLocation::at(spot(50.0), t0 + Duration::seconds(20));
        let older = LiveLocation::at(spot(40.0), t0 + Duration::seconds(10));
        rig.hub.publish(&topic, WalkPayload::Location(newer.clone())).await.unwrap();
        rig.hub.publish(&topic, WalkPayload::Location(older)).await.unwrap();
        rig.hub
            .publish(&topic, WalkPayload::State { state: WalkState::Active })
            .await
            .unwrap();
        rig.hub
            .publish(&topic, WalkPayload::State { state: WalkState::Alert })
            .await
            .unwrap();

        let updates: Vec<_> = session.updates().take(2).collect().await;
        assert_eq!(
            updates,
            vec![
                WalkPayload::Location(newer.clone()),
                WalkPayload::State { state: WalkState::Alert }
            ]
        );
        assert_eq!(session.location(), Some(&newer));
        assert_eq!(session.view().walk.state, WalkState::Alert);
    }

    #[tokio::test]
    async fn resolved_alert_replaces_the_open_one() {
        let rig = rig().await;
        let mut session =
            WatcherSession::attach(rig.store.as_ref(), rig.hub.as_ref(), rig.walk.id, Viewer::User(rig.friend))
                .await
                .unwrap();
        let topic = Topic::for_walk(rig.walk.id);
        let now = Utc::now();
        let alert = rig
            .store
            .append_alert(rig.walk.id, AlertKind::Sos, "help".into(), now)
            .await
            .unwrap();

        rig.hub.publish(&topic, WalkPayload::Alert(alert.clone())).await.unwrap();
        rig.hub.publish(&topic, WalkPayload::Alert(alert.clone())).await.unwrap();
        let resolved = rig.store.resolve_alert(rig.walk.id, alert.id, now).await.unwrap();
        rig.hub.publish(&topic, WalkPayload::Alert(resolved.clone())).await.unwrap();

        assert_eq!(session.next_update().await, Some(WalkPayload::Alert(alert)));
        assert_eq!(session.next_update().await, Some(WalkPayload::Alert(resolved)));
        assert_eq!(session.view().alerts.len(), 1);
        assert_eq!(session.view().open_alerts().count(), 0);
    }

    #[tokio::test]
    async fn detach_releases_the_subscription() {
        let rig = rig().await;
        let session =
            WatcherSession::attach(rig.store.as_ref(), rig.hub.as_ref(), rig.walk.id, Viewer::User(rig.friend))
                .await
                .unwrap();
        assert!(session.is_attached());
        assert_eq!(rig.hub.subscriber_count(&Topic::for_walk(rig.walk.id)), 1);

        session.detach();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let delivered = rig
            .hub
            .publish(&Topic::for_walk(rig.walk.id), WalkPayload::State { state: WalkState::Alert })
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn resync_reads_durable_last_known_fields() {
        let rig = rig().await;
        let mut session =
            WatcherSession::attach(rig.store.as_ref(), rig.hub.as_ref(), rig.walk.id, Viewer::User(rig.friend))
                .await
                .unwrap();
        // Written without a publish: only a resync can see it
        let missed = LiveLocation::at(spot(70.0), Utc::now());
        rig.store.update_last_location(rig.walk.id, missed.clone()).await.unwrap();
        assert!(session.location().is_none());

        session.resync(rig.store.as_ref()).await.unwrap();
        assert_eq!(session.location(), Some(&missed));
    }
}
