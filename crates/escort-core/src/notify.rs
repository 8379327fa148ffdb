//! Outbound notification signals
//!
//! Push delivery to watchers is somebody else's job. This module only names
//! the events and hands them to a [`NotificationSink`]; dispatch failures
//! are logged and never fail the operation that produced them.

use async_trait::async_trait;
use escort_model::{AlertId, AlertKind, WalkId};
use serde::Serialize;
use std::fmt::Debug;
use tokio::sync::mpsc;

/// Event signalled to the notification service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WalkEvent {
    /// `walk_started`
    WalkStarted {
        /// Walk id
        walk_id: WalkId,
    },
    /// `walk_alert`
    WalkAlert {
        /// Walk id
        walk_id: WalkId,
        /// Alert id
        alert_id: AlertId,
        /// Rule or SOS
        kind: AlertKind,
    },
    /// `walk_completed`
    WalkCompleted {
        /// Walk id
        walk_id: WalkId,
    },
    /// `location_permission_denied`; sampling halted until the walker
    /// re-grants permission
    LocationPermissionDenied {
        /// Walk id
        walk_id: WalkId,
    },
}

impl WalkEvent {
    /// Walk the event belongs to
    #[must_use]
    pub fn walk_id(&self) -> WalkId {
        match self {
            Self::WalkStarted { walk_id }
            | Self::WalkAlert { walk_id, .. }
            | Self::WalkCompleted { walk_id }
            | Self::LocationPermissionDenied { walk_id } => *walk_id,
        }
    }

    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::WalkStarted { .. } => "walk_started",
            Self::WalkAlert { .. } => "walk_alert",
            Self::WalkCompleted { .. } => "walk_completed",
            Self::LocationPermissionDenied { .. } => "location_permission_denied",
        }
    }
}

/// Notification dispatch failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("notification dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Receives named walk events
#[async_trait]
pub trait NotificationSink: Send + Sync + Debug {
    /// Hand off one event
    async fn dispatch(&self, event: WalkEvent) -> Result<(), DispatchError>;
}

/// Sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn dispatch(&self, event: WalkEvent) -> Result<(), DispatchError> {
        tracing::info!(walk_id = %event.walk_id(), event = event.name(), "notification");
        Ok(())
    }
}

/// Sink forwarding events into an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<WalkEvent>,
}

impl ChannelNotifier {
    /// Create the sink and its receiving end
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WalkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn dispatch(&self, event: WalkEvent) -> Result<(), DispatchError> {
        self.tx
            .send(event)
            .map_err(|_| DispatchError("receiver dropped".to_string()))
    }
}

/// Dispatch and log on failure
pub(crate) async fn signal(sink: &dyn NotificationSink, event: WalkEvent) {
    let walk_id = event.walk_id();
    let name = event.name();
    if let Err(e) = sink.dispatch(event).await {
        tracing::warn!(%walk_id, event = name, error = %e, "notification not dispatched");
    }
}
