use anyhow::Context;
use clap::builder::PossibleValuesParser;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use escort_core::EscortConfig;
use escort_sim::{run_all, run_simulator, Scenario, SimulatorConfig, SimulatorReport};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn common_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("ticks")
                .long("ticks")
                .default_value("240")
                .value_parser(value_parser!(u32))
                .help("Maximum number of location samples"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .default_value("10000")
                .value_parser(value_parser!(u64))
                .help("Simulated time between samples"),
        )
        .arg(
            Arg::new("distance")
                .long("distance")
                .default_value("1500")
                .value_parser(value_parser!(f64))
                .help("Straight-line distance to the destination in metres"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("42")
                .value_parser(value_parser!(u64))
                .help("Random seed for GPS noise"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .help("TOML file with escort thresholds"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output as JSON"),
        )
}

fn simulator_config(args: &ArgMatches) -> anyhow::Result<SimulatorConfig> {
    let escort = match args.get_one::<PathBuf>("config") {
        Some(path) => EscortConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EscortConfig::default(),
    };
    let scenario = match args.try_get_one::<String>("scenario") {
        Ok(Some(name)) => name.parse::<Scenario>()?,
        _ => Scenario::Normal,
    };

    Ok(SimulatorConfig {
        scenario,
        ticks: args.get_one::<u32>("ticks").copied().unwrap_or(240),
        interval: Duration::from_millis(
            args.get_one::<u64>("interval-ms").copied().unwrap_or(10_000),
        ),
        distance_m: args.get_one::<f64>("distance").copied().unwrap_or(1_500.0),
        seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
        escort,
    })
}

fn print_reports(reports: &[SimulatorReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
    } else {
        for report in reports {
            println!("{}", report.generate_text());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let scenario_names: Vec<&'static str> = Scenario::ALL.iter().map(|s| s.name()).collect();

    let cli = Command::new("escort-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Scripted walks against the escort service")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(common_args(
            Command::new("simulate").about("Run one scenario").arg(
                Arg::new("scenario")
                    .long("scenario")
                    .default_value("normal")
                    .value_parser(PossibleValuesParser::new(scenario_names))
                    .help("Walker behaviour to simulate"),
            ),
        ))
        .subcommand(common_args(
            Command::new("all").about("Run every scenario and check the expected alerts"),
        ));

    let matches = cli.get_matches();

    let (reports, json) = match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = simulator_config(args)?;
            (vec![run_simulator(config).await?], args.get_flag("json"))
        }
        Some(("all", args)) => {
            let config = simulator_config(args)?;
            (run_all(config).await?, args.get_flag("json"))
        }
        _ => return Ok(()),
    };

    print_reports(&reports, json)?;
    std::process::exit(if reports.iter().all(SimulatorReport::passed) { 0 } else { 1 });
}
