//! AgentFlow CLI and REST API entry point.
//!
//! Binary name: `aflow`
//!
//! Parses CLI arguments, loads `config.toml`, initializes the database and
//! services, then dispatches to the appropriate command handler or starts
//! the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use agentflow_infra::config::{load_global_config, resolve_data_dir};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "aflow", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = resolve_data_dir(cli.data_dir.as_deref());
    let config = load_global_config(&data_dir).await;

    // Set up tracing based on verbosity; RUST_LOG overrides it
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,agentflow=debug",
        _ => "trace",
    };
    agentflow_observe::init_tracing(filter, config.telemetry.otel_enabled)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Cron inspection is pure; skip the database
    if let Commands::Cron { action } = cli.command {
        return cli::cron::handle_cron_command(action, cli.json);
    }

    let state = AppState::init(data_dir, config).await?;

    let result = match cli.command {
        Commands::Workflow { action } => cli::workflow::handle_workflow_command(action, &state, cli.json).await,
        Commands::Approval { action } => cli::approval::handle_approval_command(action, &state, cli.json).await,
        Commands::Schedule { action } => cli::schedule::handle_schedule_command(action, &state, cli.json).await,
        Commands::Serve { host, port } => serve(state, host, port).await,
        Commands::Cron { .. } | Commands::Completions { .. } => unreachable!("handled above"),
    };

    agentflow_observe::shutdown_tracing();
    result
}

/// Run the REST API with the background workers until Ctrl+C or SIGTERM.
async fn serve(state: AppState, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| state.config.server.host.clone());
    let port = port.unwrap_or(state.config.server.port);

    let cancel = CancellationToken::new();
    let workers = state.start_background(&cancel).await?;

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "  {} AgentFlow API listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    if state.config.server.api_key.is_none() {
        println!(
            "  {}",
            console::style("No server.api_key configured; requests are not authenticated").yellow()
        );
    }
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let router = http::router::build_router(state.clone());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    state.shutdown();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "background worker ended abnormally");
        }
    }

    println!("\n  Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
