/*
 * Meeting Pipeline - Transcription Appliance Daemon
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

use meeting_pipeline::config::ApplianceConfig;
use meeting_pipeline::transcriber;

/// Transcription appliance: receives VBAN audio, records WAV, runs
/// whisper and posts transcripts to the notes webhook.
#[derive(Parser)]
#[command(name = "transcriberd")]
#[command(version = "0.1.0")]
#[command(about = "Meeting transcription appliance server")]
struct Cli {
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

    let config = ApplianceConfig::load();
    transcriber::serve(config).await
}
