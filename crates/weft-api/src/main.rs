//! Weft CLI entry point.
//!
//! Binary name: `weft`
//!
//! Parses CLI arguments, initializes tracing and the database, then
//! dispatches to the appropriate command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn,weft=info",
        1 => "info,weft=debug",
        _ => "trace",
    };
    let telemetry = match weft_observe::telemetry::init(filter, cli.otel) {
        Ok(telemetry) => Some(telemetry),
        Err(err) => {
            eprintln!("failed to initialize telemetry: {err}");
            None
        }
    };

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Serve => cli::serve::serve(state).await,
        Commands::Submit {
            file,
            context,
            watch,
        } => cli::workflow::submit(&state, &file, &context, watch, cli.json).await,
        Commands::Runs { workflow_id, limit } => {
            cli::workflow::runs(&state, workflow_id, limit, cli.json).await
        }
        Commands::Steps { execution_id } => {
            cli::workflow::steps(&state, execution_id, cli.json).await
        }
    };

    if let Some(telemetry) = telemetry {
        telemetry.shutdown();
    }
    result
}
