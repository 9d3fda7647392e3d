/*
 * Meeting Pipeline - Transcription Appliance
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

pub mod queue;
pub mod recording;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde_json::json;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::ApplianceConfig;
use crate::types::{RetranscribeRequest, StartRequest};
use crate::vban::WavCapture;
use queue::{TranscriptionQueue, WhisperCli};
use recording::{safe_wav_title, Recording, RecordingState};

/// A recording below this size at stop time never captured real audio.
const MIN_AUDIO_BYTES: u64 = 1024;

/// The active recording and its UDP capture. Exactly one may exist at a
/// time; a concurrent /start is rejected with 409.
struct ActiveRecording {
    recording: Recording,
    capture: WavCapture,
}

pub struct ApplianceState {
    config: ApplianceConfig,
    active: Mutex<Option<ActiveRecording>>,
    recent: Arc<Mutex<VecDeque<Recording>>>,
    queue: TranscriptionQueue,
}

type JsonResponse = (StatusCode, Json<serde_json::Value>);

fn detail(status: StatusCode, message: impl Into<String>) -> JsonResponse {
    (status, Json(json!({ "detail": message.into() })))
}

/// Run the appliance: HTTP server, transcription worker and the periodic
/// recordings cleanup.
pub async fn serve(config: ApplianceConfig) -> Result<()> {
    std::fs::create_dir_all(&config.recordings_dir).with_context(|| {
        format!(
            "Failed to create recordings dir {}",
            config.recordings_dir.display()
        )
    })?;

    if !config.whisper_cli.exists() {
        tracing::warn!("whisper-cli not found at {}", config.whisper_cli.display());
    }
    if !config.whisper_model.exists() {
        tracing::warn!(
            "Whisper model not found at {}",
            config.whisper_model.display()
        );
    }

    let (queue, rx) = TranscriptionQueue::new();
    let recent = Arc::new(Mutex::new(VecDeque::new()));

    let stt = Arc::new(WhisperCli {
        cli: config.whisper_cli.clone(),
        model: config.whisper_model.clone(),
        timeout: config.stt_timeout,
    });
    tokio::spawn(queue::run_worker(
        rx,
        queue.depth_counter(),
        stt,
        config.webhook_url.clone(),
        recent.clone(),
    ));
    tokio::spawn(queue::run_cleanup(
        config.recordings_dir.clone(),
        config.recording_max_age_days,
    ));

    tracing::info!("Transcriber starting on {}:{}", config.host, config.port);
    tracing::info!("  Whisper CLI:  {}", config.whisper_cli.display());
    tracing::info!("  Model:        {}", config.whisper_model.display());
    tracing::info!("  Recordings:   {}", config.recordings_dir.display());
    tracing::info!("  Webhook URL:  {}", config.webhook_url);
    tracing::info!("  VBAN port:    {}", config.vban_port);

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(ApplianceState {
        config,
        active: Mutex::new(None),
        recent,
        queue,
    });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router(state))
        .await
        .context("Appliance server failed")?;
    Ok(())
}

pub fn router(state: Arc<ApplianceState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/retranscribe", post(retranscribe))
        .route("/recordings", get(recordings))
        .with_state(state)
}

async fn status(State(state): State<Arc<ApplianceState>>) -> impl IntoResponse {
    let active = state.active.lock().await;
    let recording = active.as_ref().map(|a| a.recording.snapshot());
    let recent_count = state.recent.lock().await.len();

    Json(json!({
        "status": "ok",
        "service": "transcriber",
        "recording": recording,
        "transcription_queue_depth": state.queue.depth(),
        "disk_free_gb": disk_free_gb(&state.config.recordings_dir),
        "recording_max_age_days": state.config.recording_max_age_days,
        "recent_count": recent_count,
        "webhook_url": state.config.webhook_url,
        "vban_port": state.config.vban_port,
    }))
}

async fn start(
    State(state): State<Arc<ApplianceState>>,
    Json(req): Json<StartRequest>,
) -> JsonResponse {
    let mut active = state.active.lock().await;
    if let Some(ref current) = *active {
        if current.recording.state == RecordingState::Recording {
            return detail(
                StatusCode::CONFLICT,
                format!("Already recording: {}", current.recording.title),
            );
        }
    }

    if let Err(e) = std::fs::create_dir_all(&state.config.recordings_dir) {
        return detail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to create recordings directory: {}", e),
        );
    }

    let ts = Local::now().format("%Y%m%d-%H%M%S");
    let filename = format!("{}-{}.wav", ts, safe_wav_title(&req.title));
    let audio_path = state.config.recordings_dir.join(&filename);

    // meeting_start is captured before the UDP socket binds.
    let recording = Recording::new(&req.title, audio_path.clone());

    let capture = match WavCapture::start(
        &audio_path,
        state.config.vban_port,
        &state.config.stream_name,
    ) {
        Ok(capture) => capture,
        Err(e) => {
            return detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start recording: {:#}", e),
            );
        }
    };

    tracing::info!("Recording started: {} -> {}", req.title, audio_path.display());

    let response = json!({
        "status": "recording",
        "title": recording.title,
        "audio_path": recording.audio_path.to_string_lossy(),
        "meeting_start": recording.meeting_start,
    });
    *active = Some(ActiveRecording { recording, capture });

    (StatusCode::OK, Json(response))
}

async fn stop(State(state): State<Arc<ApplianceState>>) -> JsonResponse {
    let mut active = state.active.lock().await;
    let ActiveRecording {
        mut recording,
        capture,
    } = match active.take() {
        Some(active) if active.recording.state == RecordingState::Recording => active,
        other => {
            *active = other;
            return detail(StatusCode::NOT_FOUND, "No active recording");
        }
    };
    drop(active);

    // meeting_end is captured before the WAV finalizes.
    recording.meeting_end = Some(Utc::now());

    let stop_result = tokio::task::spawn_blocking(move || capture.stop()).await;
    match stop_result {
        Ok(Ok(packets)) => {
            tracing::info!(
                "Recording stopped: {} ({:.0}s, {} packets)",
                recording.title,
                recording.duration_seconds(),
                packets
            );
        }
        Ok(Err(e)) => tracing::error!("VBAN capture error on stop: {:#}", e),
        Err(e) => tracing::error!("VBAN capture join error: {}", e),
    }

    let audio_size = std::fs::metadata(&recording.audio_path)
        .map(|m| m.len())
        .unwrap_or(0);
    if audio_size < MIN_AUDIO_BYTES {
        recording.state = RecordingState::Failed;
        recording.error = Some("Audio file missing or too small".to_string());
        let mut recent = state.recent.lock().await;
        recent.push_front(recording);
        while recent.len() > queue::MAX_RECENT {
            recent.pop_back();
        }
        return detail(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Recording failed: no audio captured",
        );
    }

    let duration = recording.duration_seconds();
    let title = recording.title.clone();
    let audio_name = recording
        .audio_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // Visible externally as "queued" until the single worker picks it up.
    state.queue.enqueue(recording);

    (
        StatusCode::OK,
        Json(json!({
            "status": "transcribing",
            "title": title,
            "duration_seconds": (duration * 10.0).round() / 10.0,
            "message": format!("Transcription queued. Audio: {}", audio_name),
        })),
    )
}

async fn retranscribe(
    State(state): State<Arc<ApplianceState>>,
    Json(req): Json<RetranscribeRequest>,
) -> JsonResponse {
    if !valid_recording_filename(&req.filename) {
        return detail(
            StatusCode::BAD_REQUEST,
            format!("Invalid recording filename: {}", req.filename),
        );
    }

    let audio_path = state.config.recordings_dir.join(&req.filename);
    let metadata = match std::fs::metadata(&audio_path) {
        Ok(metadata) => metadata,
        Err(_) => {
            return detail(
                StatusCode::NOT_FOUND,
                format!("Recording not found: {}", req.filename),
            );
        }
    };

    let duration = wav_duration_seconds(&audio_path).unwrap_or(0.0);
    let title = title_from_filename(&req.filename);

    let mut recording = Recording::new(&title, audio_path);
    let end: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    recording.meeting_start = end - chrono::Duration::milliseconds((duration * 1000.0) as i64);
    recording.meeting_end = Some(end);

    state.queue.enqueue(recording);
    tracing::info!("Re-queued for transcription: {}", req.filename);

    (
        StatusCode::OK,
        Json(json!({
            "status": "queued",
            "title": title,
            "filename": req.filename,
            "duration_seconds": (duration * 10.0).round() / 10.0,
            "message": format!("Re-transcription queued. Audio: {}", req.filename),
        })),
    )
}

async fn recordings(State(state): State<Arc<ApplianceState>>) -> impl IntoResponse {
    let mut items = Vec::new();
    if let Some(ref active) = *state.active.lock().await {
        items.push(active.recording.snapshot());
    }
    for recording in state.recent.lock().await.iter() {
        items.push(recording.snapshot());
    }
    let total = items.len();
    Json(json!({ "recordings": items, "total": total }))
}

/// A retranscribe filename must be a plain `.wav` name inside the
/// recordings directory; anything path-like is refused.
fn valid_recording_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains('/')
        && !filename.contains('\\')
        && !filename.contains("..")
        && filename.ends_with(".wav")
}

/// Recover a display title from `YYYYMMDD-HHMMSS-some-title.wav`.
fn title_from_filename(filename: &str) -> String {
    let stem = filename.trim_end_matches(".wav");
    let re = Regex::new(r"^\d{8}-\d{6}-").expect("filename prefix regex");
    let title = re.replace(stem, "").replace('-', " ");
    if title.trim().is_empty() {
        stem.to_string()
    } else {
        title
    }
}

fn wav_duration_seconds(path: &Path) -> Option<f64> {
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(reader.duration() as f64 / spec.sample_rate as f64)
}

#[cfg(unix)]
fn disk_free_gb(path: &Path) -> f64 {
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 0.0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return 0.0;
    }
    let free = stat.f_bavail as f64 * stat.f_frsize as f64;
    (free / (1024.0 * 1024.0 * 1024.0) * 10.0).round() / 10.0
}

#[cfg(not(unix))]
fn disk_free_gb(_path: &Path) -> f64 {
    0.0
}
