//! Walk service facade
//!
//! Wires the lifecycle, monitor, pipeline and sampler registry over one
//! store, transport, clock and notification sink, and adds the side effects
//! each owner operation carries: state broadcasts, checkpoints, notification
//! signals and sampler teardown.

use crate::clock::{Clock, SystemClock};
use crate::config::EscortConfig;
use crate::context::{UserContext, Viewer};
use crate::error::EscortError;
use crate::lifecycle::{NewWalk, NewWatcher, Transition, WalkLifecycle};
use crate::monitor::AnomalyMonitor;
use crate::notify::{self, LogNotifier, NotificationSink, WalkEvent};
use crate::pipeline::{LocationPipeline, SampleOutcome};
use crate::position::PositionSource;
use crate::sampler::{LocationSampler, SamplerExit, SamplerRegistry};
use crate::watcher::WatcherSession;
use escort_broadcast::{BroadcastHub, Topic, Transport};
use escort_model::{
    Alert, AlertId, AlertKind, CheckpointKind, Coordinate, LiveLocation, Walk, WalkId,
    WalkPayload, WalkState, Watcher,
};
use escort_store::{MemoryWalkStore, WalkStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of `create_walk`
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedWalk {
    /// The new walk, in `created`
    pub walk: Walk,
    /// Its initial watchers; anonymous ones carry their share tokens
    pub watchers: Vec<Watcher>,
}

/// Builder for [`WalkService`]
///
/// Anything not supplied gets the in-process default: in-memory store,
/// broadcast hub sized from the config, system clock, log-only notifier.
#[derive(Debug, Default)]
pub struct WalkServiceBuilder {
    config: Option<EscortConfig>,
    store: Option<Arc<dyn WalkStore>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl WalkServiceBuilder {
    /// Create builder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With configuration
    #[must_use]
    pub fn with_config(mut self, config: EscortConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// With durable store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn WalkStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// With real-time transport
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// With clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// With notification sink
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the service
    ///
    /// # Errors
    /// `EscortError::Config` if the configuration is invalid.
    pub fn build(self) -> Result<WalkService, EscortError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = Arc::new(config);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryWalkStore::new()));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(BroadcastHub::new(config.broadcast_capacity)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let lifecycle = Arc::new(WalkLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let monitor = Arc::new(AnomalyMonitor::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&lifecycle),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let pipeline = Arc::new(LocationPipeline::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&monitor),
        ));

        Ok(WalkService {
            config,
            store,
            transport,
            clock,
            notifier,
            lifecycle,
            monitor,
            pipeline,
            samplers: SamplerRegistry::new(),
        })
    }
}

/// The escort subsystem behind one entry point
#[derive(Debug)]
pub struct WalkService {
    config: Arc<EscortConfig>,
    store: Arc<dyn WalkStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSink>,
    lifecycle: Arc<WalkLifecycle>,
    monitor: Arc<AnomalyMonitor>,
    pipeline: Arc<LocationPipeline>,
    samplers: SamplerRegistry,
}

impl WalkService {
    /// Start building a service
    #[inline]
    #[must_use]
    pub fn builder() -> WalkServiceBuilder {
        WalkServiceBuilder::new()
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EscortConfig {
        &self.config
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn WalkStore> {
        &self.store
    }

    /// Underlying transport
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Anomaly monitor
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &AnomalyMonitor {
        &self.monitor
    }

    /// Create a walk in `created`
    ///
    /// # Errors
    /// See [`WalkLifecycle::create`].
    pub async fn create_walk(
        &self,
        ctx: &UserContext,
        draft: NewWalk,
    ) -> Result<CreatedWalk, EscortError> {
        let (walk, watchers) = self.lifecycle.create(ctx, draft).await?;
        Ok(CreatedWalk { walk, watchers })
    }

    /// Start a created walk
    ///
    /// Publishes the `active` state, records the `started` checkpoint and
    /// signals `walk_started`.
    ///
    /// # Errors
    /// See [`WalkLifecycle::start`].
    pub async fn start_walk(
        &self,
        ctx: &UserContext,
        walk_id: WalkId,
        start: Option<Coordinate>,
    ) -> Result<Walk, EscortError> {
        let walk = self.lifecycle.start(ctx, walk_id, start).await?;

        self.publish_state(walk_id, WalkState::Active).await;
        let at = walk.start.as_ref().map(|s| s.coordinate);
        self.record_checkpoint(walk_id, CheckpointKind::Started, at).await;
        notify::signal(self.notifier.as_ref(), WalkEvent::WalkStarted { walk_id }).await;

        Ok(walk)
    }

    /// Complete a walk
    ///
    /// The sampler is stopped before this returns. On the first completion
    /// the state is published, the `safe` checkpoint recorded and
    /// `walk_completed` signalled; repeating the call only returns the record.
    ///
    /// # Errors
    /// See [`WalkLifecycle::complete`].
    pub async fn complete_walk(&self, ctx: &UserContext, walk_id: WalkId) -> Result<Walk, EscortError> {
        let Transition { walk, changed } = self.lifecycle.complete(ctx, walk_id).await?;
        self.samplers.stop(walk_id).await;

        self.monitor.forget(walk_id);

        if changed {
            self.publish_state(walk_id, WalkState::Completed).await;
            self.record_checkpoint(walk_id, CheckpointKind::Safe, walk.last_coordinate())
                .await;
            notify::signal(self.notifier.as_ref(), WalkEvent::WalkCompleted { walk_id }).await;
        }
        Ok(walk)
    }

    /// Cancel a walk
    ///
    /// # Errors
    /// See [`WalkLifecycle::cancel`].
    pub async fn cancel_walk(&self, ctx: &UserContext, walk_id: WalkId) -> Result<Walk, EscortError> {
        let Transition { walk, changed } = self.lifecycle.cancel(ctx, walk_id).await?;
        self.samplers.stop(walk_id).await;
        self.monitor.forget(walk_id);

        if changed {
            self.publish_state(walk_id, WalkState::Cancelled).await;
        }
        Ok(walk)
    }

    /// The caller's open walk, if any
    ///
    /// # Errors
    /// Store failures.
    pub async fn get_active_walk(&self, ctx: &UserContext) -> Result<Option<Walk>, EscortError> {
        self.lifecycle.get_active_walk(ctx).await
    }

    /// Begin sampling `source` for a walk
    ///
    /// Returns false if a sampler is already running for it. A `created`
    /// walk may be tracked; ticks are skipped until it starts.
    ///
    /// # Errors
    /// `InvalidState` on a terminal walk; `Unauthorized` for non-owners.
    pub async fn start_tracking(
        &self,
        ctx: &UserContext,
        walk_id: WalkId,
        source: Arc<dyn PositionSource>,
    ) -> Result<bool, EscortError> {
        let walk = self.lifecycle.owned_walk(ctx, walk_id).await?;
        if walk.state.is_terminal() {
            return Err(EscortError::invalid_state("track", walk.state));
        }
        let sampler = LocationSampler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pipeline),
            source,
            Arc::clone(&self.notifier),
            Arc::clone(&self.clock),
            Arc::clone(&self.config),
        );
        Ok(self.samplers.start(sampler, walk_id))
    }

    /// Stop sampling a walk and wait for the loop to exit
    ///
    /// Returns why the loop ended, or `None` if none was registered.
    ///
    /// # Errors
    /// - `NotFound`; `Unauthorized` for non-owners
    /// - `PermissionDenied` if the loop had halted on a permission denial;
    ///   the walker must re-grant it before tracking again
    pub async fn stop_tracking(
        &self,
        ctx: &UserContext,
        walk_id: WalkId,
    ) -> Result<Option<SamplerExit>, EscortError> {
        self.lifecycle.owned_walk(ctx, walk_id).await?;
        match self.samplers.stop(walk_id).await {
            Some(SamplerExit::PermissionDenied) => Err(EscortError::PermissionDenied),
            exit => Ok(exit),
        }
    }

    /// Whether a sampler is running for the walk
    #[must_use]
    pub fn is_tracking(&self, walk_id: WalkId) -> bool {
        self.samplers.is_running(walk_id)
    }

    /// Feed one externally taken sample through the pipeline
    ///
    /// # Errors
    /// `Unauthorized` for non-owners, plus [`LocationPipeline::process`].
    pub async fn report_location(
        &self,
        ctx: &UserContext,
        walk_id: WalkId,
        sample: LiveLocation,
    ) -> Result<SampleOutcome, EscortError> {
        self.lifecycle.owned_walk(ctx, walk_id).await?;
        self.pipeline.process(walk_id, sample).await
    }

    /// Raise an SOS alert
    ///
    /// Always emits, regardless of other rule state, and moves an `active`
    /// walk to `alert`.
    ///
    /// # Errors
    /// `InvalidState` unless the walk is `active` or `alert`.
    pub async fn trigger_sos(
        &self,
        ctx: &UserContext,
        walk_id: WalkId,
        message: Option<String>,
    ) -> Result<Alert, EscortError> {
        let walk = self.lifecycle.owned_walk(ctx, walk_id).await?;
        if !walk.state.is_tracking() {
            return Err(EscortError::invalid_state("trigger SOS on", walk.state));
        }
        let message = message.unwrap_or_else(|| "SOS triggered by walker".to_string());
        self.monitor.raise(walk_id, AlertKind::Sos, message).await
    }

    /// Acknowledge an alert as the owner or a watcher
    ///
    /// See [`AnomalyMonitor::resolve`].
    ///
    /// # Errors
    /// `NotFound` for an unknown walk or alert; `Unauthorized` for anyone
    /// else.
    pub async fn resolve_alert(
        &self,
        viewer: &Viewer,
        walk_id: WalkId,
        alert_id: AlertId,
    ) -> Result<Alert, EscortError> {
        let walk = self.store.get_walk(walk_id).await?;
        let watchers = self.store.list_watchers(walk_id).await?;
        if !viewer.can_observe(&walk, &watchers) {
            return Err(EscortError::Unauthorized(format!(
                "viewer may not resolve alerts on walk {walk_id}"
            )));
        }

        self.monitor.resolve(walk_id, alert_id).await
    }

    /// Add a watcher to an open walk
    ///
    /// # Errors
    /// See [`WalkLifecycle::add_watcher`].
    pub async fn add_watcher(
        &self,
        ctx: &UserContext,
        walk_id: WalkId,
        watcher: NewWatcher,
    ) -> Result<Watcher, EscortError> {
        self.lifecycle.add_watcher(ctx, walk_id, watcher).await
    }

    /// Delete a walk that is not being tracked
    ///
    /// # Errors
    /// `InvalidState` for an `active` or `alert` walk.
    pub async fn delete_walk(&self, ctx: &UserContext, walk_id: WalkId) -> Result<(), EscortError> {
        let walk = self.lifecycle.owned_walk(ctx, walk_id).await?;
        if walk.state.is_tracking() {
            return Err(EscortError::invalid_state("delete", walk.state));
        }
        self.samplers.stop(walk_id).await;
        self.store.delete_walk(walk_id).await?;
        self.monitor.forget(walk_id);
        info!(%walk_id, "walk deleted");
        Ok(())
    }

    /// Open a watcher session
    ///
    /// # Errors
    /// See [`WatcherSession::attach`].
    pub async fn attach_watcher(
        &self,
        viewer: Viewer,
        walk_id: WalkId,
    ) -> Result<WatcherSession, EscortError> {
        WatcherSession::attach(self.store.as_ref(), self.transport.as_ref(), walk_id, viewer).await
    }

    /// Stop every sampler
    pub async fn shutdown(&self) {
        self.samplers.stop_all().await;
        info!("walk service shut down");
    }

    async fn publish(&self, walk_id: WalkId, payload: WalkPayload) {
        let kind = payload.kind();
        if let Err(e) = self.transport.publish(&Topic::for_walk(walk_id), payload).await {
            warn!(%walk_id, kind, error = %e, "publish failed");
        }
    }

    async fn publish_state(&self, walk_id: WalkId, state: WalkState) {
        self.publish(walk_id, WalkPayload::State { state }).await;
    }

    async fn record_checkpoint(
        &self,
        walk_id: WalkId,
        kind: CheckpointKind,
        coordinate: Option<Coordinate>,
    ) {
        if let Err(e) = self
            .store
            .append_checkpoint(walk_id, kind, coordinate, self.clock.now())
            .await
        {
            warn!(%walk_id, %kind, error = %e, "checkpoint not recorded");
        }
    }
}
