/*
 * Meeting Pipeline - Capture Agent CLI
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

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meeting_pipeline::audio::{
    find_best_device, find_input_device, find_mic_device, is_virtual_device, list_input_devices,
    CaptureQuality, DualCapture, DEFAULT_MIC_GAIN,
};
use meeting_pipeline::config::AgentConfig;
use meeting_pipeline::controller::{sender, RecordingController};
use meeting_pipeline::vban::protocol::MAX_SAMPLES_PER_PACKET;
use meeting_pipeline::vban::VbanSender;

/// Meeting capture agent - streams meeting audio to the transcription
/// appliance and drives recording automatically.
#[derive(Parser)]
#[command(name = "meeting")]
#[command(version = "0.1.0")]
#[command(about = "One-command meeting capture and transcription")]
#[command(long_about = "
Meeting capture agent

Manages the full pipeline: VBAN streaming -> appliance recording ->
transcription. Designed to be the single command you run when a meeting
starts, or left watching in the background for automatic detection.
")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start recording a meeting
    Start {
        /// Meeting title
        title: String,

        /// Audio device name (default: auto-detect BlackHole > Zoom > Teams)
        #[arg(short, long)]
        device: Option<String>,

        /// Microphone device for dual-input mixing (default: auto-detect)
        #[arg(short, long)]
        mic: Option<String>,
    },

    /// Stop recording and transcribe
    Stop,

    /// Show current status
    Status,

    /// List audio input devices
    Devices,

    /// Watch for meetings and record automatically
    Watch,

    /// Run the VBAN sender loop in the foreground (spawned by start)
    #[command(hide = true)]
    Stream {
        /// Input device name
        #[arg(short, long)]
        device: String,

        /// Target hostname or IP
        #[arg(short, long)]
        target: String,

        /// UDP port
        #[arg(short, long, default_value_t = 6980)]
        port: u16,

        /// Microphone device for dual-input mixing
        #[arg(long)]
        mic: Option<String>,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let config = AgentConfig::load();

    match cli.command {
        Commands::Start { title, device, mic } => cmd_start(config, title, device, mic).await,
        Commands::Stop => cmd_stop(config).await,
        Commands::Status => cmd_status(config).await,
        Commands::Devices => cmd_devices(config),
        Commands::Watch => cmd_watch(config).await,
        Commands::Stream {
            device,
            target,
            port,
            mic,
        } => cmd_stream(config, device, target, port, mic).await,
    }
}

async fn cmd_start(
    config: AgentConfig,
    title: String,
    device: Option<String>,
    mic: Option<String>,
) -> Result<()> {
    let controller = RecordingController::new(config);

    println!("{} Starting recording: {}", "●".red(), title.bold());
    match controller.start(title.clone(), device, mic, None, false).await {
        Ok(_) => {
            println!("{} Recording! Audio streaming to appliance.", "✓".green());
            println!("   Title: {}", title);
            println!("   Run '{}' when done.", "meeting stop".bold());
            Ok(())
        }
        Err(e) => {
            println!("{} Failed to start recording: {:#}", "✗".red(), e);
            std::process::exit(1);
        }
    }
}

async fn cmd_stop(config: AgentConfig) -> Result<()> {
    let controller = RecordingController::new(config);

    println!("{} Stopping recording...", "■".yellow());
    match controller.stop(true).await? {
        Some(response) => {
            println!("{} Recording stopped: {}", "✓".green(), response.title);
            println!("   Duration: {:.1}s", response.duration_seconds);
            println!("   Transcription queued - transcript will be posted automatically.");
        }
        None => {
            println!(
                "{} No active recording found (may have already been stopped)",
                "!".yellow()
            );
        }
    }
    println!("{} Audio streaming stopped.", "●".dimmed());
    Ok(())
}

async fn cmd_status(config: AgentConfig) -> Result<()> {
    let pid_file = config.pid_file.clone();
    let controller = RecordingController::new(config);

    match sender::running(&pid_file) {
        Some(pid) => println!("{} VBAN sender: running (PID {})", "●".green(), pid),
        None => println!("{} VBAN sender: not running", "●".dimmed()),
    }

    match find_best_device() {
        Some((device, quality)) => {
            let label = match quality {
                CaptureQuality::Full => "full conversation",
                CaptureQuality::Partial => "remote only",
            };
            println!("{} Best audio device: {} ({})", "♪".cyan(), device.name, label);
        }
        None => println!("{} No suitable audio device found", "♪".red()),
    }

    match controller.appliance_status().await {
        Some(status) => {
            match status.recording {
                Some(recording) => println!(
                    "{} Recording: {} (started: {})",
                    "●".red(),
                    recording.title,
                    recording.meeting_start
                ),
                None => println!("{} Transcriber: idle", "▮".dimmed()),
            }
            println!("  Disk free: {} GB", status.disk_free_gb);
            println!("  Queue depth: {}", status.transcription_queue_depth);
            println!("  Recent recordings: {}", status.recent_count);
        }
        None => println!("{} Transcriber: unreachable", "✗".red()),
    }
    Ok(())
}

fn cmd_devices(_config: AgentConfig) -> Result<()> {
    let devices = list_input_devices().context("Failed to enumerate audio devices")?;

    println!();
    println!("Audio input devices:");
    println!("{}", "-".repeat(65));
    for device in &devices {
        let lower = device.name.to_lowercase();
        let marker = if lower.contains("blackhole") {
            "  ★ RECOMMENDED (app audio -> mix with mic)"
        } else if lower.contains("zoom") {
            "  ⚡ Zoom (remote audio only)"
        } else if lower.contains("teams") {
            "  ⚡ Teams (remote audio only)"
        } else {
            ""
        };
        println!(
            "  {} (ch:{}, rate:{}){}",
            device.name, device.channels, device.sample_rate, marker
        );
    }

    match find_mic_device() {
        Some(mic) => println!("\n{} Detected mic for mixing: {}", "♪".green(), mic.name),
        None => println!("\n{} No mic detected for dual-input mixing", "!".yellow()),
    }
    println!();
    Ok(())
}

async fn cmd_watch(config: AgentConfig) -> Result<()> {
    let controller = Arc::new(RecordingController::new(config));
    println!(
        "{} Watching for meetings (Ctrl+C to exit)...",
        "◉".green()
    );

    let watcher = controller.clone();
    tokio::select! {
        result = watcher.watch() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\n{} Watch stopped.", "■".yellow());
            // Leave any in-progress recording to an explicit `meeting stop`.
            Ok(())
        }
    }
}

async fn cmd_stream(
    config: AgentConfig,
    device: String,
    target: String,
    port: u16,
    mic: Option<String>,
) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();

    let sample_rate = config.sample_rate;
    let stream_name = config.stream_name.clone();
    let mic_gain = config.mic_gain;

    let target_addr = resolve_target(&target, port)?;
    tracing::info!("Resolved {} -> {}", target, target_addr);

    // cpal streams are not Send; the whole capture lives on one thread.
    let worker = std::thread::Builder::new()
        .name("vban-stream".into())
        .spawn(move || {
            stream_worker(
                &device,
                mic.as_deref(),
                target_addr,
                sample_rate,
                &stream_name,
                mic_gain,
                &worker_stop,
            )
        })
        .context("Failed to spawn stream worker")?;

    wait_for_shutdown().await;
    tracing::info!("Shutting down...");
    stop.store(true, Ordering::Relaxed);

    match worker.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("Stream worker panicked"),
    }
    tracing::info!("Sender stopped.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn resolve_target(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = format!("{}:{}", host, port)
        .to_socket_addrs()
        .with_context(|| format!("Cannot resolve {}", host))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("No address for {}", host))
}

fn stream_worker(
    device: &str,
    mic: Option<&str>,
    target: SocketAddr,
    sample_rate: u32,
    stream_name: &str,
    mic_gain: f32,
    stop: &AtomicBool,
) -> Result<()> {
    let primary = find_input_device(device)?;
    tracing::info!("Audio device: {}", primary.name);

    let mic_device = match mic {
        Some(name) => {
            let found = find_input_device(name)?;
            if is_virtual_device(&found.name) {
                tracing::warn!("Mic '{}' looks like a virtual device", found.name);
            }
            Some(found)
        }
        None => None,
    };
    if let Some(ref mic) = mic_device {
        tracing::info!("Mic for mixing: {}", mic.name);
    }

    let gain = if mic_gain > 0.0 { mic_gain } else { DEFAULT_MIC_GAIN };
    let mut capture = DualCapture::open(
        &primary,
        mic_device.as_ref(),
        sample_rate,
        MAX_SAMPLES_PER_PACKET,
        gain,
    )?;
    let mut sender = VbanSender::new(target, sample_rate, 1, stream_name)?;

    tracing::info!("Streaming... (SIGTERM to stop)");
    while !stop.load(Ordering::Relaxed) {
        match capture.next_block(Duration::from_millis(500))? {
            Some(block) => sender.send_block(&block),
            None => continue,
        }
    }
    Ok(())
}
