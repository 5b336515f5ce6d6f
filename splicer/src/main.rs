mod logging;
mod runner;
mod scenario;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use runner::ScenarioRunner;
use scenario::Scenario;

/// Runs a live-splicing scenario against a simulated host
#[derive(Debug, Parser)]
#[command(name = "splicer", version)]
struct Args {
    /// Scenario file (JSON)
    scenario: PathBuf,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Where the JSON run report is written
    #[arg(long, default_value = "splicer_report.json")]
    report: PathBuf,

    /// Overrides the scenario's initial update verbosity (0-4)
    #[arg(short, long)]
    debug: Option<u8>,

    /// Log everything, not just info and above
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };
    logging::setup_logging(&args.log_dir, level).context("Failed to setup logging")?;

    let mut scenario = Scenario::load(&args.scenario)?;
    if let Some(debug) = args.debug {
        scenario.config.debug = debug.min(4);
    }
    log::info!("Scenario {}: {} step(s)", scenario.name, scenario.steps.len());

    let start_time = std::time::Instant::now();
    let host = scenario.build_host()?;
    let mut runner = ScenarioRunner::new(&scenario, host);
    runner.run();

    let report = runner.generate_report(start_time);
    log::info!(
        "Summary: Total: {}, Passed: {}, Failed: {}",
        report.total_steps,
        report.passed,
        report.failed
    );
    println!(
        "\nTotal: {}, Passed: {}, Failed: {}",
        report.total_steps, report.passed, report.failed
    );

    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&args.report, json)
        .with_context(|| format!("Failed to write report {}", args.report.display()))?;
    log::info!("Report saved to: {}", args.report.display());

    if report.failed > 0 {
        anyhow::bail!("{} step(s) did not go as expected", report.failed);
    }
    Ok(())
}
