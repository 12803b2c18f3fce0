//! Run a micronetwork scenario.

use clap::{Arg, ArgAction, Command};
use micronetwork::{
    app::{self, Report},
    scenario::{self, Scenario},
};
use prometheus_client::encoding::text::encode;
use std::{path::PathBuf, process::ExitCode};
use tracing::{debug, error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

fn main() -> ExitCode {
    // Define application
    let matches = Command::new("micronetwork")
        .version(crate_version())
        .about("Simulate packet exchange between nodes over a deterministic virtual network.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scenario")
                .long("scenario")
                .help("Path to YAML scenario file (runs the built-in demo if not provided)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Seed for the link model (overrides the scenario's seed)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("runs")
                .long("runs")
                .default_value("1")
                .help("Runs (with consecutive seeds) to execute in parallel (must be >= 1)")
                .value_parser(clap::builder::RangedU64ValueParser::<u64>::new().range(1..)),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Load scenario
    let scenario = match matches.get_one::<PathBuf>("scenario") {
        Some(path) => Scenario::load(path),
        None => Scenario::demo(),
    };
    let mut scenario = match scenario {
        Ok(scenario) => scenario,
        Err(e) => {
            error!(error=?e, "failed to load scenario");
            return ExitCode::FAILURE;
        }
    };
    if let Some(seed) = matches.get_one::<u64>("seed") {
        scenario.seed = *seed;
    }
    let runs = *matches.get_one::<u64>("runs").unwrap();

    // Run a single simulation (and dump its metrics)
    if runs == 1 {
        let cfg = scenario.config();
        let registry = cfg.registry.clone();
        let result = scenario
            .build(cfg)
            .and_then(|app| app.run().map_err(scenario::Error::from));
        let mut buffer = String::new();
        if encode(&mut buffer, &registry.lock().unwrap()).is_ok() {
            debug!(metrics = %buffer, "collected metrics");
        }
        return match result {
            Ok(report) => {
                log(scenario.seed, &report);
                ExitCode::SUCCESS
            }
            Err(e) => {
                fail(scenario.seed, e);
                ExitCode::FAILURE
            }
        };
    }

    // Run many simulations in parallel
    let seeds: Vec<u64> = (0..runs).map(|i| scenario.seed.wrapping_add(i)).collect();
    let results = app::sweep(&seeds, |seed| {
        let mut cfg = scenario.config();
        cfg.seed = seed;
        scenario.build(cfg)
    });
    let mut failed = false;
    for (seed, result) in seeds.into_iter().zip(results) {
        match result {
            Ok(report) => log(seed, &report),
            Err(e) => {
                fail(seed, e);
                failed = true;
            }
        }
    }
    if failed {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn log(seed: u64, report: &Report) {
    info!(
        seed,
        outcome = ?report.outcome,
        now = ?report.now,
        dispatched = report.dispatched,
        delivered = report.delivered,
        dropped = report.dropped,
        pending = report.pending,
        state = %report.state,
        "run complete"
    );
}

fn fail(seed: u64, e: scenario::Error) {
    if let scenario::Error::Faults(report) = &e {
        log(seed, report);
        for fault in &report.faults {
            error!(seed, node = %fault.node, at = ?fault.at, kind = %fault.kind, "node fault");
        }
    }
    error!(seed, error=?e, "run failed");
}
