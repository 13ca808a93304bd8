//! CLI command definitions and dispatch for the `aflow` binary.
//!
//! Uses clap derive macros for argument parsing. The CLI follows a
//! noun-verb pattern (e.g., `aflow workflow run`, `aflow schedule list`).

pub mod approval;
pub mod cron;
pub mod schedule;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Orchestrate multi-agent workflows with approvals and cron schedules.
#[derive(Parser)]
#[command(name = "aflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (database and config.toml). Defaults to ~/.agentflow.
    #[arg(long, global = true, env = "AGENTFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server with the resume, expiry and schedule workers.
    Serve {
        /// Address to bind (defaults to `server.host` in config.toml).
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (defaults to `server.port` in config.toml).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate, import, list and run workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// List and answer approval requests.
    Approval {
        #[command(subcommand)]
        action: approval::ApprovalCommand,
    },

    /// Manage cron schedules for stored workflows.
    Schedule {
        #[command(subcommand)]
        action: schedule::ScheduleCommand,
    },

    /// Inspect cron expressions.
    Cron {
        #[command(subcommand)]
        action: cron::CronCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn test_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["aflow", "cron", "describe", "0 9 * * 1-5", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Cron { .. }));
    }
}
