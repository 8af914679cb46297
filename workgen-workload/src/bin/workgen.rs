//! Workgen demo driver.
//!
//! Loads a workload profile (built-in or TOML file) and runs it against the
//! in-memory engine, printing interval and final reports to stdout.
//!
//! # Usage
//!
//! ```bash
//! # List built-in profiles
//! workgen --list
//!
//! # Run a built-in profile with a shorter run time
//! workgen --profile mixed --run-time 2
//!
//! # Run a profile file with 1% injected write failures
//! workgen --profile-file my.toml --write-fail-rate 0.01
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use workgen_engine::{FaultConfig, MemoryConnection};
use workgen_workload::profiles::{builtin_profiles, list_profiles, load_profile, Profile};

/// Synthetic key/value workload generator.
#[derive(Parser, Debug)]
#[command(name = "workgen")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Built-in profile to run.
    #[arg(long, default_value = "insert", conflicts_with = "profile_file")]
    profile: String,

    /// TOML profile file to run instead of a built-in profile.
    #[arg(long)]
    profile_file: Option<PathBuf>,

    /// Override the profile's run time in seconds.
    #[arg(long)]
    run_time: Option<u64>,

    /// Override the profile's report interval in seconds.
    #[arg(long)]
    report_interval: Option<u64>,

    /// Override the profile's random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Record engine call latency.
    #[arg(long)]
    latency: bool,

    /// Validate the value returned by every search.
    #[arg(long)]
    validate_reads: bool,

    /// Fraction of engine writes that fail.
    #[arg(long, default_value = "0.0")]
    write_fail_rate: f64,

    /// Print the workload description before running.
    #[arg(long)]
    describe: bool,

    /// List built-in profiles and exit.
    #[arg(long)]
    list: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: Level,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
        return ExitCode::FAILURE;
    }

    if args.list {
        let profiles = builtin_profiles();
        for name in list_profiles() {
            let description = profiles.get(name).map_or("", |p| p.description.as_str());
            println!("{name:<10} {description}");
        }
        return ExitCode::SUCCESS;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "workload failed");
            eprintln!("workgen: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut profile = match &args.profile_file {
        Some(path) => Profile::from_file(path)?,
        None => load_profile(&args.profile)?,
    };
    if let Some(run_time) = args.run_time {
        profile.run_time = run_time;
    }
    if let Some(interval) = args.report_interval {
        profile.report_interval = interval;
    }
    if let Some(seed) = args.seed {
        profile.seed = seed;
    }
    profile.track_latency |= args.latency;
    profile.validate_reads |= args.validate_reads;

    let mut workload = profile.into_workload()?;
    if args.describe {
        println!("{workload}");
    }

    let conn = if args.write_fail_rate > 0.0 {
        MemoryConnection::with_faults(
            profile.seed,
            FaultConfig::none().with_write_fail_rate(args.write_fail_rate),
        )
    } else {
        MemoryConnection::new()
    };

    info!(profile = %profile.name, run_time = profile.run_time, "running profile");
    let summary = workload.run(&conn)?;
    info!(
        ops = summary.totals.total_ops(),
        faults = conn.fault_stats().total_faults(),
        "profile finished"
    );
    Ok(())
}
