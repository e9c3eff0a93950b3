//! planpipe CLI: runs building-plan PDFs through ingest, extract, normalize
//! and store.

mod commands;

use std::process::ExitCode;

use clap::Parser;

use commands::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = planpipe::telemetry::init_tracing(cli.log_format, cli.verbose) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match commands::run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
