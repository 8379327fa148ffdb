//! Scripted walk simulator
//!
//! Drives a [`WalkService`] on a manual clock through one scenario, feeding
//! samples the way the sampling loop would, and collects everything a
//! watcher attached before the start would have seen.

use chrono::Utc;
use escort_core::{
    ChannelNotifier, Clock, EscortConfig, EscortError, ManualClock, NewWalk, SampleOutcome, UserContext,
    Viewer, WalkEvent, WalkService, WatcherSession,
};
use escort_model::{
    geo, Alert, AlertKind, Checkpoint, CheckpointKind, Coordinate, LiveLocation, Place, UserId,
    WalkPayload, WalkState,
};
use escort_store::WalkStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// GPS noise radius applied to every simulated fix
const JITTER_M: f64 = 2.0;

/// Walker behaviour to simulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Walks straight to the destination
    Normal,
    /// Stops a third of the way and stays put
    Stall,
    /// Turns off the route a third of the way
    Detour,
    /// Walks at half speed and misses the expected arrival
    Late,
    /// Presses SOS a quarter of the way through
    Sos,
}

impl Scenario {
    /// Every scenario, in CLI order
    pub const ALL: [Self; 5] = [
        Self::Normal,
        Self::Stall,
        Self::Detour,
        Self::Late,
        Self::Sos,
    ];

    /// CLI name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Stall => "stall",
            Self::Detour => "detour",
            Self::Late => "late",
            Self::Sos => "sos",
        }
    }

    /// Alert the scenario must produce; `None` means no alert at all
    #[must_use]
    pub fn expected_alert(self) -> Option<AlertKind> {
        match self {
            Self::Normal => None,
            Self::Stall => Some(AlertKind::Stopped),
            Self::Detour => Some(AlertKind::Deviated),
            Self::Late => Some(AlertKind::Timeout),
            Self::Sos => Some(AlertKind::Sos),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unrecognised scenario name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scenario: {0}")]
pub struct UnknownScenario(pub String);

impl FromStr for Scenario {
    type Err = UnknownScenario;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownScenario(s.to_string()))
    }
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Walker behaviour
    pub scenario: Scenario,
    /// Maximum number of samples
    pub ticks: u32,
    /// Simulated time between samples
    pub interval: Duration,
    /// Straight-line distance to the destination
    pub distance_m: f64,
    /// Seed for GPS noise
    pub seed: u64,
    /// Escort thresholds
    pub escort: EscortConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            scenario: Scenario::Normal,
            ticks: 240,
            interval: Duration::from_secs(10),
            distance_m: 1_500.0,
            seed: 42,
            escort: EscortConfig::default(),
        }
    }
}

/// Counters collected during a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    /// Samples fed
    pub ticks_run: u32,
    /// Samples that became the last known location
    pub samples_recorded: u32,
    /// Samples discarded as older than the stored one
    pub samples_stale: u32,
    /// Alerts raised, SOS included
    pub alerts_raised: usize,
}

/// Outcome of one simulated walk
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    /// Simulated behaviour
    pub scenario: Scenario,
    /// Noise seed
    pub seed: u64,
    /// Counters
    pub stats: SimulatorStats,
    /// State after the walker finished
    pub final_state: WalkState,
    /// Stored alerts, oldest first
    pub alerts: Vec<Alert>,
    /// Stored checkpoints, oldest first
    pub checkpoints: Vec<Checkpoint>,
    /// Updates the watcher applied, in arrival order
    pub payloads: Vec<WalkPayload>,
    /// Notification events, in dispatch order
    pub events: Vec<WalkEvent>,
}

impl SimulatorReport {
    /// Kinds of the stored alerts
    #[must_use]
    pub fn alert_kinds(&self) -> Vec<AlertKind> {
        self.alerts.iter().map(|a| a.kind).collect()
    }

    /// Whether the walk ended safely and raised what the scenario expects
    #[must_use]
    pub fn passed(&self) -> bool {
        let kinds = self.alert_kinds();
        let alerts_ok = match self.scenario.expected_alert() {
            None => kinds.is_empty(),
            Some(kind) => kinds.contains(&kind),
        };
        alerts_ok && self.final_state == WalkState::Completed
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        report.push_str(&format!("=== Walk simulation: {} ===\n\n", self.scenario));
        report.push_str(&format!("Seed: {}\n", self.seed));
        report.push_str(&format!("Ticks: {}\n", self.stats.ticks_run));
        report.push_str(&format!("Samples Recorded: {}\n", self.stats.samples_recorded));
        report.push_str(&format!("Samples Stale: {}\n", self.stats.samples_stale));
        report.push_str(&format!("Final State: {}\n", self.final_state));
        report.push_str(&format!("Watcher Updates: {}\n", self.payloads.len()));

        report.push_str("\n=== Checkpoints ===\n");
        for checkpoint in &self.checkpoints {
            report.push_str(&format!(
                "{} at {}\n",
                checkpoint.kind,
                checkpoint.recorded_at.format("%H:%M:%S")
            ));
        }

        report.push_str("\n=== Alerts ===\n");
        if self.alerts.is_empty() {
            report.push_str("none\n");
        }
        for (i, alert) in self.alerts.iter().enumerate() {
            report.push_str(&format!(
                "{}. {} at {}: {}{}\n",
                i + 1,
                alert.kind,
                alert.created_at.format("%H:%M:%S"),
                alert.message,
                if alert.resolved { " (resolved)" } else { "" }
            ));
        }

        report.push_str(&format!(
            "\nResult: {}\n",
            if self.passed() { "PASSED" } else { "FAILED" }
        ));
        report
    }
}

/// Where the scripted walker is at each tick
#[derive(Debug)]
struct Walker {
    scenario: Scenario,
    start: Coordinate,
    distance_m: f64,
    speed_mps: f64,
    pivot_tick: u32,
    interval_secs: f64,
    rng: StdRng,
}

impl Walker {
    fn new(config: &SimulatorConfig, start: Coordinate) -> Self {
        let pivot_tick = match config.scenario {
            Scenario::Stall | Scenario::Detour => config.ticks / 3,
            Scenario::Normal | Scenario::Late | Scenario::Sos => config.ticks,
        };
        Self {
            scenario: config.scenario,
            start,
            distance_m: config.distance_m,
            speed_mps: config.escort.walking_speed_mps,
            pivot_tick,
            interval_secs: config.interval.as_secs_f64(),
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    fn along(&self, metres: f64) -> Coordinate {
        geo::destination_point(self.start, 0.0, metres.min(self.distance_m))
    }

    fn position(&mut self, tick: u32) -> Coordinate {
        let elapsed = f64::from(tick) * self.interval_secs;
        let pivot = f64::from(self.pivot_tick) * self.interval_secs;

        let exact = match self.scenario {
            Scenario::Normal | Scenario::Sos => self.along(self.speed_mps * elapsed),
            Scenario::Late => self.along(self.speed_mps * 0.5 * elapsed),
            Scenario::Stall => self.along(self.speed_mps * elapsed.min(pivot)),
            Scenario::Detour if tick <= self.pivot_tick => self.along(self.speed_mps * elapsed),
            Scenario::Detour => geo::destination_point(
                self.along(self.speed_mps * pivot),
                90.0,
                self.speed_mps * (elapsed - pivot),
            ),
        };

        let bearing = self.rng.random_range(0.0..360.0);
        let noise = self.rng.random_range(0.0..JITTER_M);
        geo::destination_point(exact, bearing, noise)
    }
}

/// Run one scenario to completion
///
/// The walk is completed when the arrival checkpoint is recorded or the
/// ticks run out, whichever comes first.
///
/// # Errors
/// Invalid configuration, or any service call failing.
pub async fn run_simulator(config: SimulatorConfig) -> Result<SimulatorReport, EscortError> {
    let step = chrono::Duration::from_std(config.interval)
        .map_err(|e| EscortError::Config(format!("interval: {e}")))?;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let (notifier, mut events_rx) = ChannelNotifier::channel();

    let service = WalkService::builder()
        .with_config(config.escort.clone())
        .with_clock(clock.clone())
        .with_notifier(Arc::new(notifier))
        .build()?;

    let owner = UserContext::new(UserId::new());
    let start = Coordinate::new(51.508_039, -0.128_069)?;
    let destination = geo::destination_point(start, 0.0, config.distance_m);
    let draft = NewWalk::to(Place::new(destination).with_address("Home"))
        .starting_at(Place::new(start).with_address("Station"));
    let walk_id = service.create_walk(&owner, draft).await?.walk.id;

    let session = service
        .attach_watcher(Viewer::from(&owner), walk_id)
        .await?;
    let watcher = tokio::spawn(collect_updates(session));

    let walk = service.start_walk(&owner, walk_id, Some(start)).await?;
    info!(
        %walk_id,
        scenario = %config.scenario,
        expected_arrival = ?walk.expected_arrival,
        "simulated walk started"
    );

    let mut walker = Walker::new(&config, start);
    let mut stats = SimulatorStats::default();
    let sos_tick = (config.ticks / 4).max(1);

    for tick in 1..=config.ticks {
        clock.advance(step);
        stats.ticks_run = tick;

        if config.scenario == Scenario::Sos && tick == sos_tick {
            let alert = service
                .trigger_sos(&owner, walk_id, Some("simulated SOS".into()))
                .await?;
            info!(tick, alert_id = %alert.id, "SOS pressed");
            stats.alerts_raised += 1;
        }

        let sample = LiveLocation::at(walker.position(tick), clock.now());
        let arrived = match service.report_location(&owner, walk_id, sample).await? {
            SampleOutcome::Recorded(evaluation) => {
                stats.samples_recorded += 1;
                stats.alerts_raised += evaluation.alerts.len();
                for alert in &evaluation.alerts {
                    info!(tick, kind = %alert.kind, message = %alert.message, "alert raised");
                }
                evaluation
                    .checkpoints
                    .iter()
                    .any(|c| c.kind == CheckpointKind::Arrived)
            }
            SampleOutcome::Stale => {
                stats.samples_stale += 1;
                false
            }
        };
        if arrived {
            debug!(tick, "arrived");
            break;
        }
    }

    let finished = service.complete_walk(&owner, walk_id).await?;
    let payloads = match watcher.await {
        Ok(payloads) => payloads,
        Err(e) => {
            warn!(error = %e, "watcher task failed");
            Vec::new()
        }
    };

    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }

    Ok(SimulatorReport {
        scenario: config.scenario,
        seed: config.seed,
        stats,
        final_state: finished.state,
        alerts: service.store().list_alerts(walk_id).await?,
        checkpoints: service.store().list_checkpoints(walk_id).await?,
        payloads,
        events,
    })
}

/// Run every scenario with the same settings
///
/// # Errors
/// The first scenario that fails to run.
pub async fn run_all(base: SimulatorConfig) -> Result<Vec<SimulatorReport>, EscortError> {
    let mut reports = Vec::with_capacity(Scenario::ALL.len());
    for scenario in Scenario::ALL {
        let config = SimulatorConfig {
            scenario,
            ..base.clone()
        };
        reports.push(run_simulator(config).await?);
    }
    Ok(reports)
}

async fn collect_updates(mut session: WatcherSession) -> Vec<WalkPayload> {
    let mut seen = Vec::new();
    while let Some(update) = session.next_update().await {
        let terminal = matches!(update, WalkPayload::State { state } if state.is_terminal());
        seen.push(update);
        if terminal {
            break;
        }
    }
    session.detach();
    seen
}
