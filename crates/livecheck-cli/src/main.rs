mod cli;
mod commands;
mod output;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use livecheck_core::{ConfigError, SourceError, VerifyError};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::{Cli, Commands, OutputMode};
use crate::commands::InputError;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mode = cli.output_mode();
    init_tracing(cli.verbose);

    match run(cli, mode) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let class = classify(&err);
            output::render_error(&err, class.kind, mode);
            ExitCode::from(class.code)
        }
    }
}

fn run(cli: Cli, mode: OutputMode) -> Result<()> {
    let config = commands::load_config(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    match &cli.command {
        Commands::Plan(args) => output::render_plan(&commands::run_plan(args, &config)?, mode),
        Commands::Liveness(args) => {
            output::render_liveness(&commands::run_liveness(&args.recording, &config)?, mode)
        }
        Commands::Aggregate(args) => {
            output::render_aggregate(&commands::run_aggregate(&args.recording, &config)?, mode)
        }
        Commands::Compare(args) => {
            output::render_compare(&commands::run_compare(args, &config)?, mode)
        }
    }
}

struct ErrorClass {
    kind: &'static str,
    code: u8,
}

/// Exit 3 when there was too little data to decide, 2 for bad input, 1
/// otherwise.
fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(verify) = cause.downcast_ref::<VerifyError>() {
            let code = match verify {
                VerifyError::InsufficientFrames { .. }
                | VerifyError::InsufficientValidFrames { .. }
                | VerifyError::InsufficientFramesForAggregation { .. } => 3,
                VerifyError::DimensionMismatch { .. }
                | VerifyError::NoFaceDetected { .. }
                | VerifyError::InvalidRecord { .. } => 2,
                _ => 1,
            };
            return ErrorClass {
                kind: verify.kind(),
                code,
            };
        }
        if cause.is::<ConfigError>() {
            return ErrorClass { kind: "config", code: 2 };
        }
        if cause.is::<InputError>()
            || cause.is::<SourceError>()
            || cause.is::<serde_json::Error>()
            || cause.is::<std::io::Error>()
        {
            return ErrorClass { kind: "input", code: 2 };
        }
    }
    ErrorClass {
        kind: "internal",
        code: 1,
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(fmt_layer);
    if tracing::subscriber::set_global_default(registry).is_err() {
        // Already initialised (tests).
    }
}
