/*
 * Meeting Pipeline - Shared Types
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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of the appliance's POST /start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub title: String,
}

/// Body of the appliance's POST /retranscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetranscribeRequest {
    pub filename: String,
}

/// Transcript webhook payload accepted by the ingest daemon. Unknown
/// fields are ignored; timing fields are optional and may arrive under
/// alternate key names from older producers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub transcript: String,
    #[serde(default, alias = "start_time")]
    pub meeting_start: Option<String>,
    #[serde(default, alias = "end_time")]
    pub meeting_end: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub recording_source: Option<String>,
}

/// JSON form of a Recording, used by the appliance's /status and
/// /recordings and parsed back by the capture agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSnapshot {
    pub title: String,
    pub state: String,
    pub audio_path: String,
    pub transcript_path: Option<String>,
    pub meeting_start: DateTime<Utc>,
    pub meeting_end: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub webhook_sent: bool,
}

/// The appliance's /status response, as seen by the capture agent. The
/// deserialization is tolerant of extra fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplianceStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub recording: Option<RecordingSnapshot>,
    #[serde(default)]
    pub transcription_queue_depth: usize,
    #[serde(default)]
    pub disk_free_gb: f64,
    #[serde(default)]
    pub recent_count: usize,
}

/// The appliance's POST /start success response.
#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    pub status: String,
    pub title: String,
    pub audio_path: String,
    pub meeting_start: DateTime<Utc>,
}

/// The appliance's POST /stop success response.
#[derive(Debug, Clone, Deserialize)]
pub struct StopResponse {
    pub status: String,
    pub title: String,
    pub duration_seconds: f64,
    pub message: String,
}
