use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use dispatch_core::config::DispatchConfig;

mod scenario;

use scenario::{Scenario, ScenarioError};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "dispatch",
    about = "Ride dispatch engine runner",
    long_about = "Runs scripted dispatch scenarios against the in-memory engine and\n\
                  prints ride snapshots, rankings and telemetry as JSON."
)]
struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. "info", "dispatch_core=debug")
    #[arg(long, global = true, default_value = "info", env = "DISPATCH_LOG_LEVEL")]
    log_level: String,

    /// Dispatch config JSON; defaults apply to missing fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch every request in a scenario and print the outcomes
    Run {
        /// Scenario JSON file
        scenario: PathBuf,
    },
    /// Print the candidate ranking for each request without sending offers
    Rank {
        /// Scenario JSON file
        scenario: PathBuf,
    },
    /// Print the effective dispatch config
    Config,
}

// ── helpers ────────────────────────────────────────────────────────

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<DispatchConfig, ScenarioError> {
    let config = match path {
        Some(path) => DispatchConfig::from_json_file(path)?,
        None => DispatchConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), ScenarioError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn execute(cli: &Cli) -> Result<(), ScenarioError> {
    let config = load_config(cli.config.as_ref())?;
    match &cli.command {
        Commands::Run { scenario } => {
            let scenario = Scenario::from_json_file(scenario)?;
            print_json(&scenario::run(&scenario, config)?)
        }
        Commands::Rank { scenario } => {
            let scenario = Scenario::from_json_file(scenario)?;
            print_json(&scenario::rank(&scenario, config)?)
        }
        Commands::Config => print_json(&config),
    }
}

// ── main ───────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "dispatch command failed");
            ExitCode::FAILURE
        }
    }
}
