/*
 * Meeting Pipeline - Transcription Queue
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
use async_trait::async_trait;
use chrono::Local;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex};

use super::recording::{Recording, RecordingState};
use crate::command::{truncate_detail, BoundedCommand};
use crate::postprocess;

/// Recent completed recordings kept for /status and /recordings.
pub const MAX_RECENT: usize = 20;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_DETAIL_MAX: usize = 500;

/// The cleanup task wakes on a coarse timer; retention is measured in days.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 3600);

/// The speech-to-text collaborator. Exactly one transcription runs at a
/// time; the single queue worker holds the only in-flight job.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<String>;
}

/// whisper.cpp CLI invocation with a per-file wall-clock deadline.
pub struct WhisperCli {
    pub cli: PathBuf,
    pub model: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl SpeechToText for WhisperCli {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        let outcome = BoundedCommand::new([
            self.cli.to_string_lossy().to_string(),
            "-m".to_string(),
            self.model.to_string_lossy().to_string(),
            "-f".to_string(),
            audio.to_string_lossy().to_string(),
            "-l".to_string(),
            "en".to_string(),
        ])
        .timeout(self.timeout)
        .label("whisper-cli")
        .run()
        .await?;

        if outcome.timed_out {
            anyhow::bail!(
                "whisper-cli timed out after {}s",
                self.timeout.as_secs()
            );
        }
        if !outcome.success() {
            anyhow::bail!(
                "whisper-cli failed: {}",
                truncate_detail(&outcome.tail, ERROR_DETAIL_MAX)
            );
        }
        let transcript = outcome.stdout.trim().to_string();
        if transcript.is_empty() {
            anyhow::bail!("whisper-cli produced empty output");
        }
        Ok(transcript)
    }
}

/// Unbounded FIFO feeding the single transcription worker. Enqueue is
/// non-blocking; depth counts jobs waiting (not the in-flight one).
#[derive(Clone)]
pub struct TranscriptionQueue {
    tx: mpsc::UnboundedSender<Recording>,
    depth: Arc<AtomicUsize>,
}

impl TranscriptionQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Recording>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                depth: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn enqueue(&self, recording: Recording) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(recording).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            tracing::error!("Transcription worker is gone; dropping job");
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn depth_counter(&self) -> Arc<AtomicUsize> {
        self.depth.clone()
    }
}

/// Drain the queue strictly in order, one job at a time. A single bad
/// recording never stops the worker.
pub async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Recording>,
    depth: Arc<AtomicUsize>,
    stt: Arc<dyn SpeechToText>,
    webhook_url: String,
    recent: Arc<Mutex<VecDeque<Recording>>>,
) {
    let client = reqwest::Client::new();

    while let Some(mut recording) = rx.recv().await {
        depth.fetch_sub(1, Ordering::Relaxed);
        recording.state = RecordingState::Transcribing;
        tracing::info!("Starting transcription: {}", recording.title);

        match process_recording(&mut recording, stt.as_ref(), &client, &webhook_url).await {
            Ok(()) => {
                recording.state = RecordingState::Completed;
                tracing::info!("Transcription complete: {}", recording.title);
            }
            Err(e) => {
                recording.state = RecordingState::Failed;
                recording.error = Some(truncate_detail(&format!("{:#}", e), ERROR_DETAIL_MAX));
                tracing::error!(
                    "Transcription failed for {}: {:#}",
                    recording.title,
                    e
                );
            }
        }

        archive(&recent, recording).await;
    }
}

async fn process_recording(
    recording: &mut Recording,
    stt: &dyn SpeechToText,
    client: &reqwest::Client,
    webhook_url: &str,
) -> Result<()> {
    let raw = stt.transcribe(&recording.audio_path).await?;

    let body = postprocess::clean_transcript(&raw);
    if body.trim().is_empty() {
        anyhow::bail!("transcript empty after post-processing");
    }

    let transcript_path = recording.audio_path.with_extension("txt");
    tokio::fs::write(&transcript_path, &body)
        .await
        .with_context(|| format!("Failed to write {}", transcript_path.display()))?;
    recording.transcript_path = Some(transcript_path);

    let full_transcript = format!("{}{}", front_matter(recording), body);
    deliver_webhook(recording, client, webhook_url, &full_transcript).await;
    Ok(())
}

/// Front matter carries the meeting's wall-clock bounds in the local
/// offset so downstream summarization can match calendar entries.
fn front_matter(recording: &Recording) -> String {
    let start = recording.meeting_start.with_timezone(&Local);
    let end = recording
        .meeting_end
        .map(|end| end.with_timezone(&Local))
        .unwrap_or(start);
    format!(
        "---\nmeeting_start: {}\nmeeting_end: {}\nrecording_source: transcriber\n---\n\n",
        start.to_rfc3339(),
        end.to_rfc3339()
    )
}

/// At-least-once intent, no automatic retry: a failed delivery leaves the
/// transcript file on disk for manual recovery and the recording still
/// completes with `webhook_sent = false`.
async fn deliver_webhook(
    recording: &mut Recording,
    client: &reqwest::Client,
    webhook_url: &str,
    full_transcript: &str,
) {
    let payload = serde_json::json!({
        "title": recording.title,
        "transcript": full_transcript,
    });

    let result = client
        .post(webhook_url)
        .timeout(WEBHOOK_TIMEOUT)
        .json(&payload)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
            recording.webhook_sent = true;
            tracing::info!("Transcript posted to webhook for: {}", recording.title);
        }
        Ok(resp) => {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(
                "Webhook returned {} for {}: {}",
                status,
                recording.title,
                truncate_detail(&text, 200)
            );
        }
        Err(e) => {
            tracing::warn!("Webhook delivery failed for {}: {}", recording.title, e);
        }
    }
}

async fn archive(recent: &Mutex<VecDeque<Recording>>, recording: Recording) {
    let mut recent = recent.lock().await;
    recent.push_front(recording);
    while recent.len() > MAX_RECENT {
        recent.pop_back();
    }
}

/// Periodically delete aged recordings and transcripts.
pub async fn run_cleanup(dir: PathBuf, max_age_days: u64) {
    let max_age = Duration::from_secs(max_age_days * 24 * 3600);
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        ticker.tick().await;
        let removed = sweep_old_recordings(&dir, max_age);
        if removed > 0 {
            tracing::info!(
                "Cleanup removed {} files older than {} days",
                removed,
                max_age_days
            );
        }
    }
}

/// Delete `.wav` and `.txt` files older than `max_age` from the
/// recordings directory. Returns the number of files removed.
pub fn sweep_old_recordings(dir: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !is_recording_artifact(&path) {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| is_expired(modified, now, max_age))
            .unwrap_or(false);
        if expired && std::fs::remove_file(&path).is_ok() {
            tracing::debug!("Removed aged recording file: {}", path.display());
            removed += 1;
        }
    }
    removed
}

fn is_recording_artifact(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("wav") | Some("txt")
    )
}

fn is_expired(modified: SystemTime, now: SystemTime, max_age: Duration) -> bool {
    now.duration_since(modified)
        .map(|age| age > max_age)
        .unwrap_or(false)
}
