//! CLI cron subcommands: describe an expression and preview its next runs.

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;
use console::style;

use agentflow_core::workflow::cron;

/// Cron subcommands.
#[derive(Subcommand)]
pub enum CronCommand {
    /// Print a human-readable description of an expression.
    Describe {
        /// 5-field cron expression, e.g. "*/15 9-17 * * 1-5".
        expression: String,
    },

    /// List the next fire times of an expression.
    Next {
        /// 5-field cron expression.
        expression: String,

        /// Number of fire times to list.
        #[arg(long, short = 'n', default_value = "5")]
        count: usize,

        /// IANA timezone the expression is evaluated in.
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
}

/// Handle a cron subcommand. Needs no application state.
pub fn handle_cron_command(cmd: CronCommand, json: bool) -> Result<()> {
    match cmd {
        CronCommand::Describe { expression } => {
            let description = cron::describe(&expression)?;
            if json {
                let out = serde_json::json!({
                    "expression": expression,
                    "description": description,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("  {} {}", style(&expression).cyan(), style(description).bold());
            }
            Ok(())
        }
        CronCommand::Next {
            expression,
            count,
            timezone,
        } => {
            let expr = cron::parse(&expression)?;
            let tz = cron::parse_timezone(&timezone)?;
            let runs = expr.next_runs(Utc::now(), tz, count.clamp(1, 50))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
                return Ok(());
            }
            println!();
            println!("  {} ({})", style(expr.describe()).bold(), timezone);
            for run in &runs {
                println!(
                    "  {}  {}",
                    run.with_timezone(&tz).format("%a %Y-%m-%d %H:%M %Z"),
                    style(run.format("%H:%M UTC")).dim()
                );
            }
            println!();
            Ok(())
        }
    }
}
