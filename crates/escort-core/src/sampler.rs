//! Location sampling loop
//!
//! One tokio task per walk takes a position fix every sampling interval and
//! feeds it through the [`LocationPipeline`]. Tick-level failures (no fix,
//! store or publish trouble) are logged and the loop waits for the next
//! tick. The loop ends when:
//! - [`SamplerHandle::stop`] is called; effective before the next tick
//! - the walk is found terminal or missing on a tick
//! - positioning permission is denied, which needs the user to act; a
//!   `location_permission_denied` event is signalled

use crate::clock::Clock;
use crate::config::EscortConfig;
use crate::error::EscortError;
use crate::notify::{self, NotificationSink, WalkEvent};
use crate::pipeline::LocationPipeline;
use crate::position::{PositionError, PositionSource};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use escort_model::{WalkId, WalkState};
use escort_store::{StoreError, WalkStore};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Why a sampling loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerExit {
    /// Stopped through its handle
    Stopped,
    /// The walk reached a terminal state
    WalkEnded(WalkState),
    /// The walk no longer exists
    WalkMissing,
    /// Positioning permission revoked
    PermissionDenied,
    /// The task panicked or was aborted
    Aborted,
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: AtomicBool,
    wake: Notify,
}

impl StopSignal {
    fn raise(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn is_raised(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Handle to a running sampling loop
#[derive(Debug)]
pub struct SamplerHandle {
    walk_id: WalkId,
    signal: Arc<StopSignal>,
    task: JoinHandle<SamplerExit>,
}

impl SamplerHandle {
    /// Sampled walk
    #[inline]
    #[must_use]
    pub fn walk_id(&self) -> WalkId {
        self.walk_id
    }

    /// Ask the loop to stop; no new tick starts after this returns
    pub fn stop(&self) {
        self.signal.raise();
    }

    /// Whether the loop task is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait for the loop to end
    pub async fn join(self) -> SamplerExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(walk_id = %self.walk_id, error = %e, "sampler task failed");
                SamplerExit::Aborted
            }
        }
    }
}

/// Periodic position sampler for one walk
#[derive(Debug, Clone)]
pub struct LocationSampler {
    store: Arc<dyn WalkStore>,
    pipeline: Arc<LocationPipeline>,
    source: Arc<dyn PositionSource>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: Arc<EscortConfig>,
}

impl LocationSampler {
    /// Create a sampler
    #[must_use]
    pub fn new(
        store: Arc<dyn WalkStore>,
        pipeline: Arc<LocationPipeline>,
        source: Arc<dyn PositionSource>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: Arc<EscortConfig>,
    ) -> Self {
        Self {
            store,
            pipeline,
            source,
            notifier,
            clock,
            config,
        }
    }

    /// Start sampling `walk_id` on a new task
    #[must_use]
    pub fn spawn(self, walk_id: WalkId) -> SamplerHandle {
        let signal = Arc::new(StopSignal::default());
        let task = tokio::spawn(self.run(walk_id, Arc::clone(&signal)));
        info!(%walk_id, "sampler started");
        SamplerHandle {
            walk_id,
            signal,
            task,
        }
    }

    async fn run(self, walk_id: WalkId, signal: Arc<StopSignal>) -> SamplerExit {
        let mut ticker = tokio::time::interval(self.config.sampling_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                () = signal.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            if signal.is_raised() {
                break SamplerExit::Stopped;
            }
            if let ControlFlow::Break(exit) = self.tick(walk_id, &signal).await {
                break exit;
            }
        };

        info!(%walk_id, ?exit, "sampler exited");
        exit
    }

    async fn tick(&self, walk_id: WalkId, signal: &StopSignal) -> ControlFlow<SamplerExit> {
        let walk = match self.store.get_walk(walk_id).await {
            Ok(walk) => walk,
            Err(StoreError::NotFound { .. }) => return ControlFlow::Break(SamplerExit::WalkMissing),
            Err(e) => {
                warn!(%walk_id, error = %e, "walk lookup failed; skipping tick");
                return ControlFlow::Continue(());
            }
        };
        if walk.state.is_terminal() {
            return ControlFlow::Break(SamplerExit::WalkEnded(walk.state));
        }
        if !walk.state.is_tracking() {
            debug!(%walk_id, state = %walk.state, "walk not started; skipping tick");
            return ControlFlow::Continue(());
        }

        let fix = match self.source.current_position(self.config.accuracy).await {
            Ok(fix) => fix,
            Err(PositionError::PermissionDenied) => {
                warn!(%walk_id, "location permission denied; sampling halted");
                notify::signal(
                    self.notifier.as_ref(),
                    WalkEvent::LocationPermissionDenied { walk_id },
                )
                .await;
                return ControlFlow::Break(SamplerExit::PermissionDenied);
            }
            Err(PositionError::Unavailable(reason)) => {
                debug!(%walk_id, %reason, "no position fix this tick");
                return ControlFlow::Continue(());
            }
        };

        if signal.is_raised() {
            return ControlFlow::Break(SamplerExit::Stopped);
        }

        let sample = fix.into_sample(self.clock.now());
        match self.pipeline.process(walk_id, sample).await {
            Ok(_) => ControlFlow::Continue(()),
            Err(EscortError::InvalidState { state, .. }) if state.is_terminal() => {
                ControlFlow::Break(SamplerExit::WalkEnded(state))
            }
            Err(e) => {
                warn!(%walk_id, error = %e, "sample not processed");
                ControlFlow::Continue(())
            }
        }
    }
}

/// At most one sampling loop per walk
#[derive(Debug, Default)]
pub struct SamplerRegistry {
    handles: DashMap<WalkId, SamplerHandle>,
}

impl SamplerRegistry {
    /// Create an empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `sampler` for `walk_id` unless a loop is already running
    ///
    /// Returns false if one was.
    pub fn start(&self, sampler: LocationSampler, walk_id: WalkId) -> bool {
        match self.handles.entry(walk_id) {
            Entry::Occupied(entry) if entry.get().is_running() => {
                debug!(%walk_id, "sampler already running");
                false
            }
            Entry::Occupied(mut entry) => {
                entry.insert(sampler.spawn(walk_id));
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(sampler.spawn(walk_id));
                true
            }
        }
    }

    /// Stop the loop for `walk_id` and wait for it to exit
    pub async fn stop(&self, walk_id: WalkId) -> Option<SamplerExit> {
        let (_, handle) = self.handles.remove(&walk_id)?;
        handle.stop();
        Some(handle.join().await)
    }

    /// Whether a loop is running for `walk_id`
    #[must_use]
    pub fn is_running(&self, walk_id: WalkId) -> bool {
        self.handles.get(&walk_id).is_some_and(|h| h.is_running())
    }

    /// Number of live loops
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.handles.iter().filter(|h| h.is_running()).count()
    }

    /// Stop every loop
    pub async fn stop_all(&self) {
        let ids: Vec<WalkId> = self.handles.iter().map(|h| *h.key()).collect();
        for walk_id in ids {
            self.stop(walk_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::UserContext;
    use crate::lifecycle::{NewWalk, WalkLifecycle};
    use crate::monitor::AnomalyMonitor;
    use crate::notify::{ChannelNotifier, LogNotifier};
    use crate::position::{MockPositionSource, PositionFix};
    use escort_broadcast::BroadcastHub;
    use escort_model::{Coordinate, Place, UserId};
    use escort_store::MemoryWalkStore;
    use std::time::Duration;

    struct Rig {
        store: Arc<MemoryWalkStore>,
        lifecycle: Arc<WalkLifecycle>,
        pipeline: Arc<LocationPipeline>,
        clock: Arc<ManualClock>,
        config: Arc<EscortConfig>,
        ctx: UserContext,
        walk_id: WalkId,
    }

    fn here() -> Coordinate {
        Coordinate::new(40.4168, -3.7038).unwrap()
    }

    async fn rig(start: bool) -> Rig {
        let store = Arc::new(MemoryWalkStore::new());
        let clock = Arc::new(ManualClock::default());
        let config = Arc::new(EscortConfig::default());
        let transport = Arc::new(BroadcastHub::default());
        let lifecycle = Arc::new(WalkLifecycle::new(store.clone(), clock.clone(), config.clone()));
        let monitor = Arc::new(AnomalyMonitor::new(
            store.clone(),
            transport.clone(),
            lifecycle.clone(),
            Arc::new(LogNotifier),
            clock.clone(),
            config.clone(),
        ));
        let pipeline = Arc::new(LocationPipeline::new(store.clone(), transport, monitor));

        let ctx = UserContext::new(UserId::new());
        let draft = NewWalk::to(Place::new(Coordinate::new(40.42, -3.70).unwrap()))
            .with_estimated_duration(Duration::from_secs(900));
        let (walk, _) = lifecycle.create(&ctx, draft).await.unwrap();
        if start {
            lifecycle.start(&ctx, walk.id, Some(here())).await.unwrap();
        }

        Rig {
            store,
            lifecycle,
            pipeline,
            clock,
            config,
            ctx,
            walk_id: walk.id,
        }
    }

    fn sampler(rig: &Rig, source: MockPositionSource) -> LocationSampler {
        sampler_with(rig, source, Arc::new(LogNotifier))
    }

    fn sampler_with(
        rig: &Rig,
        source: MockPositionSource,
        notifier: Arc<dyn NotificationSink>,
    ) -> LocationSampler {
        LocationSampler::new(
            rig.store.clone(),
            rig.pipeline.clone(),
            Arc::new(source),
            notifier,
            rig.clock.clone(),
            rig.config.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn samples_every_interval_until_stopped() {
        let rig = rig(true).await;
        let mut source = MockPositionSource::new();
        source
            .expect_current_position()
            .times(3)
            .returning(|_| Ok(PositionFix::new(here())));

        let handle = sampler(&rig, source).spawn(rig.walk_id);
        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.stop();

        assert_eq!(handle.join().await, SamplerExit::Stopped);
        let walk = rig.store.get_walk(rig.walk_id).await.unwrap();
        assert_eq!(walk.last_coordinate(), Some(here()));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_fix_is_skipped() {
        let rig = rig(true).await;
        let mut calls = 0;
        let mut source = MockPositionSource::new();
        source.expect_current_position().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(PositionError::Unavailable("no satellites".into()))
            } else {
                Ok(PositionFix::new(here()))
            }
        });

        let handle = sampler(&rig, source).spawn(rig.walk_id);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rig.store.get_walk(rig.walk_id).await.unwrap().last_location.is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rig.store.get_walk(rig.walk_id).await.unwrap().last_location.is_some());
        assert!(handle.is_running());
        handle.stop();
        assert_eq!(handle.join().await, SamplerExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_halts_without_touching_state() {
        let rig = rig(true).await;
        let mut source = MockPositionSource::new();
        source
            .expect_current_position()
            .times(1)
            .returning(|_| Err(PositionError::PermissionDenied));

        let (notifier, mut events) = ChannelNotifier::channel();
        let exit = sampler_with(&rig, source, Arc::new(notifier))
            .spawn(rig.walk_id)
            .join()
            .await;

        assert_eq!(exit, SamplerExit::PermissionDenied);
        assert_eq!(
            events.try_recv().ok(),
            Some(WalkEvent::LocationPermissionDenied {
                walk_id: rig.walk_id
            })
        );
        let walk = rig.store.get_walk(rig.walk_id).await.unwrap();
        assert_eq!(walk.state, WalkState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn ended_walk_stops_the_loop_on_next_tick() {
        let rig = rig(true).await;
        let mut source = MockPositionSource::new();
        source
            .expect_current_position()
            .returning(|_| Ok(PositionFix::new(here())));

        let handle = sampler(&rig, source).spawn(rig.walk_id);
        tokio::time::sleep(Duration::from_secs(5)).await;
        rig.lifecycle.cancel(&rig.ctx, rig.walk_id).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!handle.is_running());
        assert_eq!(handle.join().await, SamplerExit::WalkEnded(WalkState::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn created_walk_is_not_sampled() {
        let rig = rig(false).await;
        let mut source = MockPositionSource::new();
        source.expect_current_position().never();

        let handle = sampler(&rig, source).spawn(rig.walk_id);
        tokio::time::sleep(Duration::from_secs(35)).await;
        handle.stop();
        assert_eq!(handle.join().await, SamplerExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_keeps_one_loop_per_walk() {
        let rig = rig(true).await;
        let registry = SamplerRegistry::new();
        let source = || {
            let mut source = MockPositionSource::new();
            source
                .expect_current_position()
                .returning(|_| Ok(PositionFix::new(here())));
            source
        };

        assert!(registry.start(sampler(&rig, source()), rig.walk_id));
        assert!(!registry.start(sampler(&rig, source()), rig.walk_id));
        assert_eq!(registry.active_count(), 1);

        assert_eq!(registry.stop(rig.walk_id).await, Some(SamplerExit::Stopped));
        assert!(!registry.is_running(rig.walk_id));
        assert_eq!(registry.stop(rig.walk_id).await, None);
    }
}
