#![forbid(unsafe_code)]

use std::env;

use anyhow::{Result, bail};
use clap::Parser;
use taskboard_sim::campaign::{CampaignConfig, run_campaign};
use taskboard_sim::{Outcome, SimulationResult};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Drive an employee and a manager session through seeded edits and
/// network faults, then check both task views against the server.
#[derive(Debug, Parser)]
#[command(name = "taskboard-sim", version)]
struct Args {
    /// First seed to run.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of consecutive seeds to run.
    #[arg(long, default_value_t = 1)]
    seeds: u64,

    #[arg(long, default_value_t = 40)]
    rounds: u32,

    /// Chance per round (percent) that every realtime connection drops.
    #[arg(long, default_value_t = 10)]
    disconnect_percent: u8,

    /// Chance per round (percent) that the next query fails.
    #[arg(long, default_value_t = 5)]
    query_failure_percent: u8,

    /// Emit changes on the bus ahead of the service call.
    #[arg(long)]
    optimistic: bool,

    /// Print the full result as JSON.
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TASKBOARD_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "taskboard=debug,info"
        } else {
            "taskboard=info,warn"
        })
    });

    let format = env::var("TASKBOARD_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn print_summary(result: &SimulationResult) {
    println!(
        "seed={} accepted={} denied={} failed={} faults={} realtime_checked={} converged={}",
        result.seed,
        result.count_outcomes(|o| *o == Outcome::Accepted),
        result.count_outcomes(|o| *o == Outcome::Denied),
        result.count_outcomes(|o| matches!(o, Outcome::Failed(_))),
        result.faults(),
        result.realtime_checked,
        result.converged()
    );
    for divergence in &result.divergences {
        println!("  {divergence}");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = CampaignConfig {
        seed_range: args.seed..args.seed.saturating_add(args.seeds),
        rounds: args.rounds,
        optimistic: args.optimistic,
        fault_disconnect_percent: args.disconnect_percent,
        fault_query_failure_percent: args.query_failure_percent,
        ..CampaignConfig::default()
    };

    if args.seeds == 1 {
        let result = taskboard_sim::campaign::replay_seed(args.seed, &config).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_summary(&result);
        }
        if !result.converged() {
            bail!("seed {} diverged", args.seed);
        }
        return Ok(());
    }

    let report = run_campaign(&config).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign complete: seeds_run={} seeds_passed={} realtime_checked={} first_failure={:?}",
            report.seeds_run, report.seeds_passed, report.realtime_checked, report.first_failure
        );
        for failure in &report.failures {
            println!("  seed {}: {}", failure.seed, failure.divergences.join("; "));
        }
    }
    if !report.all_passed() {
        bail!("{} of {} seeds diverged", report.failures.len(), report.seeds_run);
    }
    Ok(())
}
