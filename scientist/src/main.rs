use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use scientist::config::ScientistConfig;
use scientist::scientist::Scientist;
use tracing_subscriber::EnvFilter;

/// Autonomous plan / execute / analyze loop over a design space
#[derive(Debug, Parser)]
#[command(name = "scientist", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "SCIENTIST_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Offline LLM and simulated runner
    #[arg(long)]
    mock: bool,

    /// Override experiment.budget_max
    #[arg(long)]
    budget: Option<usize>,

    /// Override experiment.max_cycles
    #[arg(long)]
    cycles: Option<u32>,

    /// Override database.path
    #[arg(long)]
    db: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            match dotenvy::from_path(&candidate) {
                Ok(_) => {
                    tracing::info!(path = %candidate.display(), "Loaded environment from .env");
                }
                Err(e) => {
                    tracing::warn!(
                        path = %candidate.display(),
                        error = %e,
                        "Failed to load .env file"
                    );
                }
            }
            return;
        }

        if !current.pop() {
            break;
        }
    }

    tracing::info!(
        cwd = %cwd.display(),
        "No .env file found in current directory or ancestors; using process environment only"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    // Before config load, so ${VAR} references and OPENAI_API_KEY resolve.
    load_env_file();

    let mut config =
        ScientistConfig::load(args.config.as_deref()).context("loading scientist config")?;
    if args.mock {
        config.experiment.mock_mode = true;
    }
    if let Some(budget) = args.budget {
        config.experiment.budget_max = budget;
    }
    if let Some(cycles) = args.cycles {
        config.experiment.max_cycles = cycles;
    }
    if let Some(db) = args.db {
        config.database.path = db;
    }
    config.validate().context("validating overrides")?;

    let scientist = Scientist::start(config)
        .await
        .context("starting scientist")?;
    let outcome = scientist.run(None).await;
    scientist.shutdown().await;
    let outcome = outcome.context("experimentation loop failed")?;

    println!(
        "Finished after {} cycle(s), {} experiment(s)",
        outcome.cycles_completed, outcome.experiments_used
    );
    println!("Pareto front: {}", outcome.pareto_ids.join(", "));
    for finding in outcome.insights.key_findings().iter().take(5) {
        println!("  - {finding}");
    }
    Ok(())
}
