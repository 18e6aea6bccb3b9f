//! Floe CLI: tape-to-tape archival sync pipeline.

use std::process::ExitCode;

use clap::Parser;

use floe::CliArgs;
use floe_core::tracing::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    match floe::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("floe failed: {e}");
            ExitCode::FAILURE
        }
    }
}
