//! CLI argument definitions for the `weft` binary.

pub mod serve;
pub mod workflow;

use clap::{Parser, Subcommand};

/// Weft -- queue-driven workflow orchestration engine.
#[derive(Debug, Parser)]
#[command(name = "weft", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Emit machine-readable JSON instead of human output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Bridge tracing spans to the OpenTelemetry stdout exporter.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the engine: admission consumer, step consumers, and monitoring.
    Serve,

    /// Submit a workflow document for execution.
    Submit {
        /// Path to the workflow JSON document.
        file: std::path::PathBuf,

        /// Initial execution context as inline JSON.
        #[arg(long, default_value = "{}")]
        context: String,

        /// Wait for the execution to reach a terminal status.
        #[arg(long)]
        watch: bool,
    },

    /// List executions of a workflow, newest first.
    Runs {
        /// Workflow id.
        workflow_id: uuid::Uuid,

        /// Maximum number of executions to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show the step executions of one execution.
    Steps {
        /// Execution id.
        execution_id: uuid::Uuid,
    },
}
