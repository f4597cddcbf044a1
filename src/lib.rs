pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod flags;
pub mod instrument;
pub mod model;
pub mod platform;
pub mod process;
pub mod report;

pub use error::{Error, Result};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::Config;
use crate::flags::ProcessEnv;
use crate::instrument::{Instrument, Toolchain};
use crate::model::RunOverrides;
use crate::process::{Output, SystemRunner};

pub fn run() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    init_logging(args.verbose);

    // 1. ── Configure ──────────────────────────────────────────────────
    let config = Config::load(args.config.as_deref()).with_context(|| "Loading configuration")?;
    let build = args.build_options()?;
    let run_opts = args.run_options();

    std::fs::create_dir_all(&args.workdir)
        .with_context(|| format!("Creating {}", args.workdir.display()))?;

    let tools = Toolchain {
        config: &config,
        platform: platform::native(),
        runner: &SystemRunner,
        env: &ProcessEnv,
    };
    tracing::debug!("{} on {}", config.version_string(), tools.platform.name());
    let mut instrument = Instrument::new(&args.instrument, &args.workdir, tools)
        .with_context(|| format!("Opening {}", args.instrument.display()))?;
    for (key, value) in &args.params {
        instrument.set_parameter(key, value);
    }

    // 2. ── Build ──────────────────────────────────────────────────────
    instrument
        .prepare(&build)
        .with_context(|| format!("Building {}", args.instrument.display()))?;

    // 3. ── Run ────────────────────────────────────────────────────────
    if args.info {
        let report = instrument.info(&run_opts).with_context(|| "Reading instrument info")?;
        println!("{}", serde_json::to_string_pretty(&report.to_json()?)?);
    } else {
        instrument
            .run(&run_opts, Output::Inherit, &RunOverrides::new(), None)
            .with_context(|| format!("Running {}", instrument.name()))?;
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}
