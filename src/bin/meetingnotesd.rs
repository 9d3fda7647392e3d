/*
 * Meeting Pipeline - Meeting Notes Daemon
 * Copyright (c) 2025 Meeting Pipeline Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use meeting_pipeline::config::DaemonConfig;
use meeting_pipeline::ingest::{self, DaemonState};
use meeting_pipeline::workspace::Workspace;

/// Ingest daemon: receives transcripts and calendar updates over HTTP
/// and persists them into the git-backed workspace.
#[derive(Parser)]
#[command(name = "meetingnotesd")]
#[command(version = "0.1.0")]
#[command(about = "Meeting notes ingest daemon")]
struct Cli {
    /// Run repo bootstrap/sync once and exit
    #[arg(long)]
    sync_once: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();

    let config = DaemonConfig::load_from_env()?;
    let workspace = Arc::new(Workspace::new(config.clone()));

    tracing::info!(
        "Starting meetingnotesd on {}:{}",
        config.server.host,
        config.server.port
    );
    tracing::info!("Inbox directory: {}", workspace.inbox_path().display());
    tracing::info!("Repository: {}", workspace.repo_path().display());
    tracing::info!(
        "Transcript webhook: http://{}:{}/webhook",
        config.server.host,
        config.server.port
    );
    tracing::info!(
        "Calendar webhook: http://{}:{}/calendar",
        config.server.host,
        config.server.port
    );

    // Ensure checkout + initial sync before accepting traffic.
    if config.sync_enabled() && config.sync.on_startup {
        let _guard = workspace.lock.lock().await;
        match workspace.sync().await {
            Ok((changed, message)) => {
                tracing::info!("Startup sync: {}", message);
                if changed {
                    let (ok, hook_msg) = workspace.run_hook_on_new_commits().await;
                    if !ok {
                        tracing::warn!("{}", hook_msg);
                    }
                }
            }
            Err(e) => tracing::warn!("Startup sync failed: {:#}", e),
        }
    }

    // The inbox may live inside a freshly-cloned repo.
    std::fs::create_dir_all(workspace.inbox_path())?;

    if cli.sync_once {
        tracing::info!("sync-once complete; exiting");
        return Ok(());
    }

    workspace.spawn_background_sync();

    let state = Arc::new(DaemonState { workspace });
    ingest::serve(state).await
}
