//! Per-walk rule state
//!
//! Each automatic rule is a two-state machine: `Clear` until it trips, then
//! `Flagged` with the alert it raised until that alert is acknowledged.
//! A flagged rule never trips again, which is what keeps a persisting
//! condition down to one alert.

use crate::clock::chrono_secs;
use crate::config::EscortConfig;
use chrono::{DateTime, Utc};
use escort_model::{
    geo, Alert, AlertId, AlertKind, Checkpoint, CheckpointKind, Coordinate, LiveLocation, Walk,
    WalkState,
};

/// Episode state of one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleState {
    /// Armed
    #[default]
    Clear,
    /// Tripped; waiting for the alert to be acknowledged
    Flagged(AlertId),
}

impl RuleState {
    /// Whether the rule may trip
    #[inline]
    #[must_use]
    pub fn is_clear(self) -> bool {
        matches!(self, Self::Clear)
    }
}

/// A rule violation observed on one sample
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Trip {
    pub(crate) kind: AlertKind,
    pub(crate) message: String,
}

/// Last position that counted as movement
#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    coordinate: Coordinate,
    since: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct WalkRules {
    stopped: RuleState,
    deviated: RuleState,
    timeout: RuleState,
    anchor: Option<Anchor>,
    timeout_snoozed_until: Option<DateTime<Utc>>,
    halfway_recorded: bool,
    arrived_recorded: bool,
    /// Stored alerts whose walk promotion and broadcast are still owed
    unannounced: Vec<Alert>,
}

impl WalkRules {
    /// Rebuild rule state from a walk's stored history
    ///
    /// Each rule with an unresolved alert starts flagged by the newest one.
    /// If the walk is still `active` while alerts are open, those alerts are
    /// queued for announcement so the next step promotes the walk.
    pub(crate) fn resume(walk: &Walk, alerts: &[Alert], checkpoints: &[Checkpoint]) -> Self {
        let mut rules = Self::default();
        let open: Vec<&Alert> = alerts.iter().filter(|a| !a.resolved).collect();
        for alert in &open {
            rules.flag(alert.kind, alert.id);
        }
        if walk.state == WalkState::Active {
            rules.unannounced = open.into_iter().cloned().collect();
        }
        for checkpoint in checkpoints {
            rules.mark_recorded(checkpoint.kind);
        }
        rules
    }

    /// Queue a stored alert for announcement
    pub(crate) fn owe(&mut self, alert: Alert) {
        self.unannounced.push(alert);
    }

    /// Take the alerts still owed an announcement
    pub(crate) fn take_unannounced(&mut self) -> Vec<Alert> {
        std::mem::take(&mut self.unannounced)
    }

    /// Stop owing an announcement for a resolved alert
    pub(crate) fn drop_owed(&mut self, alert_id: AlertId) {
        self.unannounced.retain(|a| a.id != alert_id);
    }

    /// Put back alerts whose announcement failed
    pub(crate) fn restore_unannounced(&mut self, mut alerts: Vec<Alert>) {
        alerts.append(&mut self.unannounced);
        self.unannounced = alerts;
    }

    /// Run stopped, deviated and timeout against `sample`, in that order
    ///
    /// The sample timestamp is "now" for every rule. Returned trips are not
    /// flagged yet; call [`WalkRules::flag`] once the alert is stored.
    pub(crate) fn check(
        &mut self,
        walk: &Walk,
        sample: &LiveLocation,
        config: &EscortConfig,
    ) -> Vec<Trip> {
        let mut trips = Vec::new();
        if let Some(trip) = self.check_stopped(sample, config) {
            trips.push(trip);
        }
        if let Some(trip) = self.check_deviated(walk, sample, config) {
            trips.push(trip);
        }
        if let Some(trip) = self.check_timeout(walk, sample) {
            trips.push(trip);
        }
        trips
    }

    fn check_stopped(&mut self, sample: &LiveLocation, config: &EscortConfig) -> Option<Trip> {
        let here = sample.coordinate();
        let anchor = match self.anchor {
            Some(anchor) if geo::haversine_m(anchor.coordinate, here) <= config.movement_epsilon_m => {
                anchor
            }
            _ => {
                self.anchor = Some(Anchor {
                    coordinate: here,
                    since: sample.timestamp,
                });
                return None;
            }
        };

        let still_for = sample.timestamp - anchor.since;
        if self.stopped.is_clear() && still_for > config.stopped_threshold() {
            return Some(Trip {
                kind: AlertKind::Stopped,
                message: format!("no movement for {} s", still_for.num_seconds()),
            });
        }
        None
    }

    fn check_deviated(
        &self,
        walk: &Walk,
        sample: &LiveLocation,
        config: &EscortConfig,
    ) -> Option<Trip> {
        if !self.deviated.is_clear() {
            return None;
        }
        let distance = geo::distance_to_path_m(sample.coordinate(), &walk.reference_path())?;
        (distance > config.deviation_threshold_m).then(|| Trip {
            kind: AlertKind::Deviated,
            message: format!("{distance:.0} m from the expected path"),
        })
    }

    fn check_timeout(&self, walk: &Walk, sample: &LiveLocation) -> Option<Trip> {
        if !self.timeout.is_clear() || walk.state.is_terminal() {
            return None;
        }
        let expected = walk.expected_arrival?;
        let deadline = self.timeout_snoozed_until.map_or(expected, |s| s.max(expected));
        (sample.timestamp > deadline).then(|| Trip {
            kind: AlertKind::Timeout,
            message: format!("overdue since {}", expected.format("%H:%M:%S UTC")),
        })
    }

    /// Mark the rule for `kind` as flagged by `alert_id`
    pub(crate) fn flag(&mut self, kind: AlertKind, alert_id: AlertId) {
        if let Some(slot) = self.slot_mut(kind) {
            *slot = RuleState::Flagged(alert_id);
        }
    }

    /// Re-arm the rule flagged by `alert_id`
    ///
    /// Stopped restarts its stillness window at `now`; timeout is snoozed
    /// for one timeout buffer. Returns false if no rule holds that alert.
    pub(crate) fn acknowledge(
        &mut self,
        kind: AlertKind,
        alert_id: AlertId,
        now: DateTime<Utc>,
        config: &EscortConfig,
    ) -> bool {
        match self.slot_mut(kind) {
            Some(slot) if *slot == RuleState::Flagged(alert_id) => *slot = RuleState::Clear,
            _ => return false,
        }
        match kind {
            AlertKind::Stopped => {
                if let Some(anchor) = self.anchor.as_mut() {
                    anchor.since = now;
                }
            }
            AlertKind::Timeout => {
                self.timeout_snoozed_until = Some(now + chrono_secs(config.timeout_buffer_secs));
            }
            AlertKind::Deviated | AlertKind::Sos => {}
        }
        true
    }

    /// Current state of a rule; SOS has none
    #[must_use]
    pub(crate) fn state(&self, kind: AlertKind) -> Option<RuleState> {
        match kind {
            AlertKind::Stopped => Some(self.stopped),
            AlertKind::Deviated => Some(self.deviated),
            AlertKind::Timeout => Some(self.timeout),
            AlertKind::Sos => None,
        }
    }

    fn slot_mut(&mut self, kind: AlertKind) -> Option<&mut RuleState> {
        match kind {
            AlertKind::Stopped => Some(&mut self.stopped),
            AlertKind::Deviated => Some(&mut self.deviated),
            AlertKind::Timeout => Some(&mut self.timeout),
            AlertKind::Sos => None,
        }
    }

    /// Checkpoints `sample` reaches that have not been recorded yet
    pub(crate) fn pending_milestones(
        &self,
        walk: &Walk,
        sample: &LiveLocation,
        config: &EscortConfig,
    ) -> Vec<CheckpointKind> {
        let mut pending = Vec::new();
        if !self.halfway_recorded && journey_progress(walk, sample).is_some_and(|p| p >= 0.5) {
            pending.push(CheckpointKind::Halfway);
        }
        if !self.arrived_recorded
            && geo::haversine_m(sample.coordinate(), walk.destination.coordinate)
                <= config.arrival_radius_m
        {
            pending.push(CheckpointKind::Arrived);
        }
        pending
    }

    /// Stop offering a milestone once it is stored
    pub(crate) fn mark_recorded(&mut self, kind: CheckpointKind) {
        match kind {
            CheckpointKind::Halfway => self.halfway_recorded = true,
            CheckpointKind::Arrived => self.arrived_recorded = true,
            CheckpointKind::Started | CheckpointKind::Safe => {}
        }
    }
}

/// Fraction of the journey covered at `sample`
///
/// Distance based when a reference path is known: how far along the route
/// polyline (or the start -> destination line) the walker's nearest point
/// lies, over the path length. Otherwise time elapsed over the estimated
/// duration. `None` when neither is available.
#[must_use]
pub fn journey_progress(walk: &Walk, sample: &LiveLocation) -> Option<f64> {
    let path = walk.reference_path();
    let total = geo::path_length_m(&path);
    if total > 0.0 {
        let along = geo::distance_along_path_m(sample.coordinate(), &path)?;
        return Some(along / total);
    }

    let started_at = walk.started_at?;
    let estimate = walk.estimated_duration_secs.filter(|secs| *secs > 0)?;
    #[allow(clippy::cast_precision_loss)]
    let progress = (sample.timestamp - started_at).num_milliseconds() as f64
        / (estimate as f64 * 1_000.0);
    Some(progress)
}
