// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;
use std::process;

use clap::Parser;

mod api;
mod error;
mod state;

use state::AppState;

/// Build farm coordinator: accepts client build requests and
/// dispatches them across a fleet of builders.
#[derive(Parser)]
#[command(name = "buildfarm-coordinator")]
#[command(author = "Build Farm Contributors")]
#[command(version)]
#[command(about = "Coordinator process for the build farm control plane", long_about = None)]
struct Cli {
    /// Path to a coordinator config file, overriding the default search.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging regardless of RUST_LOG.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
        }))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        eprintln!("\nCaused by:");
        for cause in e.chain().skip(1) {
            eprintln!("  {cause}");
        }
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut loader = buildfarm_core::config::coordinator_loader();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let config = loader.load()?;

    let state = AppState::new(config)?;
    let bind_address = state.config.bind_address.clone();
    let app = api::router(state.clone());

    tokio::spawn(api::run_maintenance_loop(state.clone()));

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "coordinator listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(state)).await?;
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received, persisting job table before exit");
    state.persist();
}
