use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use barrage::engine::probe::SleepProbe;
use barrage::{Engine, RunConfig};

#[derive(Parser)]
#[command(name = "barrage", version, about = "Scenario-driven load testing engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a load test run
    Run {
        /// Path to the run configuration (YAML or JSON)
        config: PathBuf,
        /// Override the global user ceiling
        #[arg(long)]
        vus: Option<usize>,
        /// Override the run duration cap
        #[arg(long)]
        duration: Option<String>,
        /// Seed for reproducible behavior selection
        #[arg(long)]
        seed: Option<u64>,
        /// Print the summary as JSON instead of the console table
        #[arg(long)]
        json: bool,
        /// Write the JSON summary to a file
        #[arg(long, value_name = "PATH")]
        export_json: Option<PathBuf>,
        /// Set or override a run variable, repeatable
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
    /// Check a configuration without running it
    Validate { config: PathBuf },
    /// Print the configuration JSON schema
    Schema,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match dispatch(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run {
            config,
            vus,
            duration,
            seed,
            json,
            export_json,
            vars,
        } => {
            let mut run_config = RunConfig::from_path(&config)?;
            if vus.is_some() {
                run_config.vus = vus;
            }
            if duration.is_some() {
                run_config.duration = duration;
            }
            if seed.is_some() {
                run_config.seed = seed;
            }
            let env = run_config.env.get_or_insert_with(HashMap::new);
            for pair in &vars {
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("--var expects KEY=VALUE, got '{}'", pair);
                };
                env.insert(key.to_string(), value.to_string());
            }
            let sleep_probe = SleepProbe::from_vars(env);

            let mut engine = Engine::new();
            engine.register_probe("sleep", Arc::new(sleep_probe));
            let summary = engine.run(&run_config)?;

            if json {
                println!("{}", summary.to_json());
            } else {
                summary.print();
            }
            if let Some(path) = export_json {
                std::fs::write(&path, summary.to_json())
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            Ok(if summary.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Validate { config } => {
            let run_config = RunConfig::from_path(&config)?;
            run_config.validate()?;
            println!("{} is valid", config.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Schema => {
            let schema = schemars::schema_for!(RunConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
