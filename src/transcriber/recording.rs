/*
 * Meeting Pipeline - Recording Entity
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
use std::fmt;
use std::path::PathBuf;

use crate::types::RecordingSnapshot;

/// Lifecycle of a capture session. Strictly forward, no re-entry:
/// RECORDING -> TRANSCRIBING -> (COMPLETED | FAILED).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Recording,
    Transcribing,
    Completed,
    Failed,
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingState::Recording => write!(f, "recording"),
            RecordingState::Transcribing => write!(f, "transcribing"),
            RecordingState::Completed => write!(f, "completed"),
            RecordingState::Failed => write!(f, "failed"),
        }
    }
}

/// A single capture session: one WAV, one title, one pair of timestamps,
/// and eventually one transcript.
#[derive(Debug, Clone)]
pub struct Recording {
    pub title: String,
    pub audio_path: PathBuf,
    pub transcript_path: Option<PathBuf>,
    pub state: RecordingState,
    pub meeting_start: DateTime<Utc>,
    pub meeting_end: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub webhook_sent: bool,
}

impl Recording {
    pub fn new(title: &str, audio_path: PathBuf) -> Self {
        Self {
            title: title.to_string(),
            audio_path,
            transcript_path: None,
            state: RecordingState::Recording,
            meeting_start: Utc::now(),
            meeting_end: None,
            error: None,
            webhook_sent: false,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        match self.meeting_end {
            Some(end) => (end - self.meeting_start).num_milliseconds() as f64 / 1000.0,
            None => (Utc::now() - self.meeting_start).num_milliseconds() as f64 / 1000.0,
        }
    }

    pub fn snapshot(&self) -> RecordingSnapshot {
        RecordingSnapshot {
            title: self.title.clone(),
            state: self.state.to_string(),
            audio_path: self.audio_path.to_string_lossy().into_owned(),
            transcript_path: self
                .transcript_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            meeting_start: self.meeting_start,
            meeting_end: self.meeting_end,
            error: self.error.clone(),
            webhook_sent: self.webhook_sent,
        }
    }
}

/// Sanitize a meeting title for the recording filename: keep
/// alphanumerics, hyphens, underscores and spaces, then spaces become
/// hyphens, capped at 50 characters.
pub fn safe_wav_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | ' '))
        .collect();
    kept.trim().replace(' ', "-").chars().take(50).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_wav_title_strips_and_caps() {
        assert_eq!(safe_wav_title("Design Review"), "Design-Review");
        assert_eq!(safe_wav_title("1:1 w/ Sarah!"), "11-w-Sarah");
        let long = "x".repeat(80);
        assert_eq!(safe_wav_title(&long).len(), 50);
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RecordingState::Transcribing).unwrap(),
            "\"transcribing\""
        );
        assert_eq!(RecordingState::Failed.to_string(), "failed");
    }

    #[test]
    fn duration_uses_meeting_end() {
        let mut rec = Recording::new("t", PathBuf::from("/tmp/t.wav"));
        rec.meeting_end = Some(rec.meeting_start + chrono::Duration::seconds(12));
        assert!((rec.duration_seconds() - 12.0).abs() < 0.001);
    }
}
