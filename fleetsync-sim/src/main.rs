//! fleetsync-sim: Runs fleetsync scenarios against an in-memory control plane.
//!
//! Each scenario exercises one part of the engine the way a resource
//! controller would:
//! - activation: create against a role that is still propagating, wait for it, delete it
//! - share: reconcile a document's grantees through several desired sets
//! - default-baseline: restore platform default baselines after overrides are deleted

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fleetsync::memory::MemoryControlPlane;
use fleetsync::{Engine, EngineConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod scenarios;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Activation,
    Share,
    DefaultBaseline,
    All,
}

/// fleetsync simulator
#[derive(Parser, Debug)]
#[command(name = "fleetsync-sim", version, about)]
struct Args {
    /// JSON engine configuration (defaults are used when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scenario to run
    #[arg(long, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Grantees per add/remove call (overrides the config file)
    #[arg(long)]
    batch_limit: Option<usize>,

    /// Create attempts that fail before the new role becomes visible
    #[arg(long, default_value = "3")]
    propagation_attempts: u32,

    /// Number of accounts to share the document with
    #[arg(long, default_value = "45")]
    grantees: u32,

    /// Poll interval in milliseconds (overrides the config file)
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetsync=info,fleetsync_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(
        batch_limit = config.permissions.batch_limit,
        poll_interval_ms = config.wait.poll_interval_ms,
        "Starting fleetsync-sim"
    );

    let api = Arc::new(MemoryControlPlane::new().with_batch_limit(config.permissions.batch_limit));
    let engine = Engine::new(api, config).context("invalid engine configuration")?;

    // Ctrl-C aborts in-flight waits and retries
    let shutdown = engine.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let run = |scenario: Scenario| matches!(args.scenario, Scenario::All) || args.scenario == scenario;

    if run(Scenario::Activation) {
        scenarios::activation(&engine.child(), args.propagation_attempts)
            .await
            .inspect_err(|e| error!("Activation scenario failed: {:#}", e))?;
    }
    if run(Scenario::Share) {
        scenarios::share(&engine.child(), args.grantees)
            .await
            .inspect_err(|e| error!("Share scenario failed: {:#}", e))?;
    }
    if run(Scenario::DefaultBaseline) {
        scenarios::default_baseline(&engine.child())
            .await
            .inspect_err(|e| error!("Default baseline scenario failed: {:#}", e))?;
    }

    info!("All scenarios completed");
    Ok(())
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig {
            // Keep the in-memory runs short unless a config file says otherwise
            wait: fleetsync::WaitConfig {
                poll_interval_ms: 200,
                ..Default::default()
            },
            ..Default::default()
        },
    };

    if let Some(limit) = args.batch_limit {
        config.permissions.batch_limit = limit;
    }
    if let Some(interval) = args.poll_interval_ms {
        config.wait.poll_interval_ms = interval;
    }
    config.validate()?;
    Ok(config)
}
