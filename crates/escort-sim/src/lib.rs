//! Escort Sim - scripted walks against the escort service
//!
//! Runs a walker through a named [`Scenario`] on a manual clock and reports
//! the alerts, checkpoints and watcher updates it produced.

pub mod simulator;

pub use simulator::{
    run_all, run_simulator, Scenario, SimulatorConfig, SimulatorReport, SimulatorStats,
    UnknownScenario,
};
