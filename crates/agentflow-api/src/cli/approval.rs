//! CLI approval subcommands: inbox, inspection and responses.
//!
//! Responding resumes the parked execution in this process, since one-shot
//! commands run without the server's resume worker.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use agentflow_types::approval::{ApprovalDecision, ApprovalRequest, ApprovalStatus, Approver};

use crate::cli::workflow::print_execution;
use crate::state::AppState;

/// Approval subcommands.
#[derive(Subcommand)]
pub enum ApprovalCommand {
    /// List pending requests the given user may answer.
    #[command(alias = "ls")]
    List {
        /// User id to list the inbox for.
        #[arg(long)]
        user: String,

        /// Email address, matched against `email:` approver entries.
        #[arg(long)]
        email: Option<String>,

        /// Role, matched against `role:` approver entries. Repeatable.
        #[arg(long = "role")]
        roles: Vec<String>,
    },

    /// Show one request with its responses.
    Show {
        /// Approval request UUID.
        id: Uuid,
    },

    /// Approve or reject a request.
    Respond {
        /// Approval request UUID.
        id: Uuid,

        /// Responding user id.
        #[arg(long)]
        user: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long = "role")]
        roles: Vec<String>,

        /// Approve the request.
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject the request.
        #[arg(long)]
        reject: bool,

        /// Optional comment, used as the rejection reason.
        #[arg(long, short)]
        comment: Option<String>,
    },
}

/// Handle an approval subcommand.
pub async fn handle_approval_command(cmd: ApprovalCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ApprovalCommand::List { user, email, roles } => {
            let who = Approver {
                user_id: user,
                email,
                roles,
            };
            let pending = state.gate().list_pending_for_user(&who).await?;
            print_pending(&pending, &who, json)
        }
        ApprovalCommand::Show { id } => {
            let request = state.gate().get(id).await?;
            print_request(&request, json)
        }
        ApprovalCommand::Respond {
            id,
            user,
            email,
            roles,
            approve,
            reject,
            comment,
        } => {
            let decision = decision_from_flags(approve, reject)?;
            let who = Approver {
                user_id: user,
                email,
                roles,
            };
            handle_respond(id, &who, decision, comment, state, json).await
        }
    }
}

fn decision_from_flags(approve: bool, reject: bool) -> Result<ApprovalDecision> {
    match (approve, reject) {
        (true, false) => Ok(ApprovalDecision::Approve),
        (false, true) => Ok(ApprovalDecision::Reject),
        _ => bail!("Pass exactly one of --approve or --reject"),
    }
}

async fn handle_respond(
    id: Uuid,
    who: &Approver,
    decision: ApprovalDecision,
    comment: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let outcome = state.gate().respond(id, who, decision, comment).await?;
    // Recovery in `drain_signals` covers a signal that failed to send.
    let resumed = if outcome.request.status != ApprovalStatus::Pending {
        state.drain_signals().await
    } else {
        Vec::new()
    };

    if json {
        let out = serde_json::json!({
            "approval": outcome.request,
            "resumed": resumed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let request = &outcome.request;
    println!();
    println!(
        "  {} Recorded {} from '{}' on '{}'",
        style("*").green().bold(),
        decision,
        who.user_id,
        style(&request.title).cyan()
    );
    match request.status {
        ApprovalStatus::Pending => println!(
            "  {} of {} approvals collected",
            request.approve_count(),
            request.required_approvals
        ),
        status => println!("  Request is now {}", style(status).bold()),
    }

    for execution in &resumed {
        print_execution(execution, false)?;
    }
    if resumed.is_empty() {
        println!();
    }
    Ok(())
}

fn print_pending(pending: &[ApprovalRequest], who: &Approver, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!();
        println!("  No pending approvals for '{}'.", who.user_id);
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Step"),
            Cell::new("Title"),
            Cell::new("Votes"),
            Cell::new("Expires"),
        ]);
    for r in pending {
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(&r.workflow_id),
            Cell::new(&r.step_id),
            Cell::new(&r.title),
            Cell::new(format!("{}/{}", r.approve_count(), r.required_approvals)),
            Cell::new(
                r.timeout_at
                    .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string()),
            ),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn print_request(request: &ApprovalRequest, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(request)?);
        return Ok(());
    }

    println!();
    println!("  {} ({})", style(&request.title).cyan().bold(), request.status);
    println!("  {}", request.message);
    println!();
    println!("  Workflow:   {} / step '{}'", request.workflow_id, request.step_id);
    println!("  Execution:  {}", request.execution_id);
    println!("  Approvers:  {}", request.approvers.join(", "));
    println!(
        "  Quorum:     {} of {}",
        request.approve_count(),
        request.required_approvals
    );
    if let Some(reason) = &request.rejection_reason {
        println!("  Rejected:   {reason}");
    }
    for response in &request.responses {
        let decision = match response.decision {
            ApprovalDecision::Approve => style("approve").green(),
            ApprovalDecision::Reject => style("reject").red(),
        };
        match &response.comment {
            Some(comment) => println!("    {} {} \"{}\"", response.user_id, decision, comment),
            None => println!("    {} {}", response.user_id, decision),
        }
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_requires_exactly_one_flag() {
        assert_eq!(decision_from_flags(true, false).unwrap(), ApprovalDecision::Approve);
        assert_eq!(decision_from_flags(false, true).unwrap(), ApprovalDecision::Reject);

        let err = decision_from_flags(false, false).unwrap_err().to_string();
        assert!(err.contains("--approve"), "got: {err}");
    }
}
