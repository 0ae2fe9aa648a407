// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;

mod api;
mod build_executor;
mod error;
mod runners;
mod state;
mod storage;

use state::AppState;

/// Build farm builder: runs a bounded pool of sandboxed workers and
/// heartbeats status to a coordinator.
#[derive(Parser)]
#[command(name = "buildfarm-builder")]
#[command(author = "Build Farm Contributors")]
#[command(version)]
#[command(about = "Builder process for the build farm control plane", long_about = None)]
struct Cli {
    /// Path to a builder config file, overriding the default search.
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
    let mut loader = buildfarm_core::config::builder_loader();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let config = loader.load()?;
    let bind_address = config.bind_address.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_seconds);
    let coordinator_url = config.coordinator_url.clone();
    let builder_id = config.builder_id.clone();
    let endpoint = config.public_endpoint.clone();
    let architecture = config.architecture.clone();
    let capacity = config.capacity;

    let (state, stop_tx) = AppState::new(config)?;
    let app = api::router(state.clone());

    let http = reqwest::Client::builder().build()?;
    register_with_coordinator(&http, &coordinator_url, &builder_id, &endpoint, &architecture, capacity).await;
    let heartbeat_client = buildfarm_core::heartbeat::HeartbeatClient::new(http, coordinator_url, builder_id, endpoint, capacity, heartbeat_interval);
    let heartbeat_state = state.clone();
    let stop_rx = stop_tx.subscribe();
    let heartbeat_task = tokio::spawn(async move {
        heartbeat_client.run(&heartbeat_state, stop_rx).await;
    });

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "builder listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(state.clone(), stop_tx)).await?;
    let _ = heartbeat_task.await;
    Ok(())
}

/// Registers this builder with the coordinator once at startup (§6.1
/// "Builder self-registration"), so it appears in the fleet immediately
/// rather than waiting for the coordinator to observe its first
/// heartbeat. Best-effort: a failure here is logged and does not stop
/// the builder from serving, since `BuilderRegistry::heartbeat` also
/// creates the fleet record on first contact.
async fn register_with_coordinator(http: &reqwest::Client, coordinator_url: &str, builder_id: &str, endpoint: &str, architecture: &str, capacity: u32) {
    let url = format!("{}/api/v1/builders/register", coordinator_url.trim_end_matches('/'));
    let body = buildfarm_core::protocol::BuilderRegisterRequest {
        builder_id: builder_id.to_string(),
        endpoint: endpoint.to_string(),
        architecture: architecture.to_string(),
        capacity,
    };
    match http.post(&url).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(%url, "registered with coordinator");
        }
        Ok(resp) => {
            tracing::warn!(%url, status = %resp.status(), "coordinator rejected builder registration, will join fleet on first heartbeat instead");
        }
        Err(e) => {
            tracing::warn!(%url, error = %e, "could not reach coordinator to register, will join fleet on first heartbeat instead");
        }
    }
}

async fn shutdown_signal(state: AppState, stop_tx: tokio::sync::watch::Sender<bool>) {
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
    let _ = stop_tx.send(true);
    state.persist();
}
