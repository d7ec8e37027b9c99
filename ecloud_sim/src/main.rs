//! eCloud Lockstep Simulator CLI
//!
//! Run lockstep protocol scenarios against simulated vehicles.

use clap::Parser;
use ecloud_core::OrchestratorConfig;
use ecloud_sim::scenarios::ScenarioId;
use ecloud_sim::{write_json_summary, ScenarioResult, ScenarioRunner, SimConfig, SimExport};
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// eCloud lockstep simulation CLI
#[derive(Parser, Debug)]
#[command(name = "ecloud-sim")]
#[command(about = "Run lockstep orchestration scenarios for eCloud", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of vehicle clients
    #[arg(short, long, default_value = "4")]
    agents: usize,

    /// Scenario to run (lockstep, early_finish, unresponsive, step_failure, mixed, step_limit, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Tick budget after which the run is finished
    #[arg(short, long, default_value = "60")]
    ticks: u64,

    /// Per-tick collection deadline in milliseconds
    #[arg(long)]
    tick_timeout_ms: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export tick frames and diagnostics to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Orchestrator config JSON file
    #[arg(long)]
    config: Option<String>,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    // Keep stdout clean for the JSON summary
    let installed = if args.json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    if let Err(e) = installed {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("eCloud Lockstep Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!(
                    "Available scenarios: lockstep, early_finish, unresponsive, step_failure, mixed, step_limit, all"
                );
                std::process::exit(1);
            }
        }
    };

    if args.export.is_some() && (scenarios.len() > 1 || args.seeds > 1) {
        eprintln!("Error: --export only supports a single scenario and seed");
        std::process::exit(1);
    }

    let mut orchestrator = match &args.config {
        Some(path) => match OrchestratorConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => SimConfig::default().orchestrator,
    };
    if let Some(ms) = args.tick_timeout_ms {
        orchestrator = orchestrator.with_tick_timeout(Duration::from_millis(ms));
    }

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let runner = ScenarioRunner::new(seed, args.agents)
            .with_ticks(args.ticks)
            .with_orchestrator_config(orchestrator.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED in {} ticks", scenario.name(), seed, result.total_ticks);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if let Some(path) = &args.export {
                let export = SimExport::from_result(&result, runner.config().world_tick());
                match export.write_to_file(path) {
                    Ok(()) => info!("Exported {} frames to {}", export.frames.len(), path),
                    Err(e) => error!("Failed to write export: {:?}", e),
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();

    if args.json {
        // JSON output for CI parsing
        if let Err(e) = write_json_summary(std::io::stdout().lock(), &all_results) {
            error!("Failed to write summary: {}", e);
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            // List failed seeds
            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
