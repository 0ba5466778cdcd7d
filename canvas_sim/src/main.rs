//! Agent Canvas Simulator CLI
//!
//! Run the built-in scenarios or a canvas file and report the outcome.

use canvas_sim::scenarios::ScenarioId;
use canvas_sim::{CanvasFile, ScenarioResult, ScenarioRunner, SimConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Agent Canvas deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "agent-canvas")]
#[command(about = "Run scripted agents through deterministic escrow rounds", long_about = None)]
struct Args {
    /// Scenario to run (escrow_happy_path, rogue_actor, runaway_script, dispute_resolution, marketplace, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Canvas file (TOML) to run instead of the built-in scenarios
    #[arg(short, long)]
    canvas: Option<PathBuf>,

    /// Ticks to run (defaults to each scenario's own count)
    #[arg(short, long)]
    ticks: Option<u64>,

    /// Master seed for seeded scenarios
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Per-agent execution limit in milliseconds
    #[arg(long)]
    max_exec_ms: Option<u64>,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export frame-by-frame JSON for replay
    #[arg(long)]
    export: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --verbose when set.
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = SimConfig {
        seed: args.seed,
        ..SimConfig::default()
    };
    if let Some(ms) = args.max_exec_ms {
        config.limits.max_execution_time_ms = ms;
    }
    let mut runner = ScenarioRunner::new(config);
    if let Some(ticks) = args.ticks {
        runner = runner.with_ticks(ticks);
    }

    if !args.json {
        info!("Agent Canvas Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let results: Vec<ScenarioResult> = match &args.canvas {
        Some(path) => {
            let canvas = CanvasFile::load(path).unwrap_or_else(|e| {
                eprintln!("Error: {}: {}", path.display(), e);
                std::process::exit(1);
            });
            vec![runner.run_canvas(&canvas, &path.display().to_string())]
        }
        None => {
            let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
                ScenarioId::all()
            } else {
                vec![args.scenario.parse().unwrap_or_else(|e| {
                    eprintln!("Error: {}", e);
                    eprintln!(
                        "Available scenarios: escrow_happy_path, rogue_actor, runaway_script, dispute_resolution, marketplace, all"
                    );
                    std::process::exit(1);
                })]
            };
            scenarios.into_iter().map(|s| runner.run(s)).collect()
        }
    };

    if let Some(path) = &args.export {
        if results.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }
        for result in &results {
            match result.export.write_to_file(path) {
                Ok(()) => info!(
                    "Exported {} frames to {}",
                    result.export.frames.len(),
                    path.display()
                ),
                Err(e) => error!("Failed to write export: {:?}", e),
            }
        }
    }

    let failed_count = results.iter().filter(|r| !r.passed).count();
    let total = results.len();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else {
        for result in &results {
            if result.passed {
                info!(
                    "✓ {} (seed={}) PASSED in {} ticks | settled={} rejected={} timeouts={}",
                    result.scenario,
                    result.seed,
                    result.total_ticks,
                    result.metrics.settled,
                    result.metrics.ops_rejected,
                    result.metrics.timeouts
                );
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    result.scenario,
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} runs passed!", total);
        } else {
            error!("❌ {}/{} runs failed!", failed_count, total);
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
