//! Parley daemon
//!
//! Loads configuration and catalogs, validates them, then drives simulated calls against the
//! placeholder collaborators. Real recognizer/classifier/TTS adapters plug in behind the same
//! `parley_voice` traits.

mod simulation;
mod stress;

use anyhow::{bail, Context};
use parley_core::{validate, Catalogs, ParleyConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CALLS: usize = 4;
const DEFAULT_CONFIG_OUT: &str = "config/parley.toml";

const HELP: &str = "\
parley-daemon - voice dialogue orchestration

USAGE:
    parley-daemon [COMMAND]

COMMANDS:
    simulate [--calls N]   Run N concurrent scripted calls (default, N = 4)
    stress                 Replay the chaotic caller scenario against the flow engine
    validate               Check the goal catalog and dialogue map for dangling references
    init-config [PATH]     Write the default configuration (default config/parley.toml)
    help                   Show this message

ENV:
    PARLEY_CONFIG          Configuration file (default config/parley.toml)
    PARLEY_<SECTION>__<KEY> Override any configuration key
    RUST_LOG               Log filter (default info)
";

enum Command {
    Simulate { calls: usize },
    Stress,
    Validate,
    InitConfig { path: PathBuf },
    Help,
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("simulate") => {
            let mut calls = DEFAULT_CALLS;
            let mut rest = args.iter().skip(1);
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--calls" | "-n" => {
                        let value = rest.next().context("--calls needs a value")?;
                        calls = value.parse().with_context(|| format!("invalid call count: {value}"))?;
                    }
                    other => bail!("unknown option for simulate: {other}"),
                }
            }
            Ok(Command::Simulate { calls: calls.max(1) })
        }
        Some("stress") => Ok(Command::Stress),
        Some("validate") => Ok(Command::Validate),
        Some("init-config") => Ok(Command::InitConfig {
            path: PathBuf::from(args.get(1).map(String::as_str).unwrap_or(DEFAULT_CONFIG_OUT)),
        }),
        Some("help" | "--help" | "-h") => Ok(Command::Help),
        Some(other) => bail!("unknown command: {other} (try `parley-daemon help`)"),
    }
}

/// Load catalogs and report every dangling reference. Issues are warnings, not failures.
fn load_catalogs(config: &ParleyConfig) -> anyhow::Result<(Catalogs, usize)> {
    let catalogs = config.catalogs.load().with_context(|| {
        format!(
            "loading catalogs from {} and {}",
            config.catalogs.goals_path.display(),
            config.catalogs.dialogue_map_path.display()
        )
    })?;
    let issues = validate(&catalogs.goals, &catalogs.dialogue, &config.flow.default_goal)?;
    for issue in &issues {
        tracing::warn!(%issue, "catalog issue");
    }
    tracing::info!(
        goals = catalogs.goals.len(),
        states = catalogs.dialogue.len(),
        issues = issues.len(),
        "catalogs loaded"
    );
    Ok((catalogs, issues.len()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    if let Command::Help = command {
        print!("{HELP}");
        return Ok(());
    }
    if let Command::InitConfig { path } = &command {
        ParleyConfig::default().save_to_path(path)?;
        tracing::info!(path = %path.display(), "default configuration written");
        return Ok(());
    }

    let config = ParleyConfig::load().context("loading configuration")?;
    let (catalogs, issues) = load_catalogs(&config)?;

    match command {
        Command::Validate => {
            if issues > 0 {
                bail!("{issues} catalog issue(s) found");
            }
            tracing::info!("catalogs are consistent");
        }
        Command::Stress => stress::run(&catalogs, &config)?,
        Command::Simulate { calls } => {
            let placeholders = simulation::Placeholders::new(&catalogs, &config);
            tracing::info!(calls, "starting simulated calls");
            tokio::select! {
                reports = simulation::run_calls(calls, &catalogs, &config, &placeholders) => {
                    simulation::log_summary(&reports);
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, shutting down");
                }
            }
        }
        Command::Help | Command::InitConfig { .. } => {}
    }
    Ok(())
}
