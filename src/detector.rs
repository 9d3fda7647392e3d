/*
 * Meeting Pipeline - Meeting Detection
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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::BoundedCommand;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const LOG_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const AUDIO_LOG_LOOKBACK: &str = "120s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeetingApp {
    Zoom,
    Teams,
}

impl fmt::Display for MeetingApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeetingApp::Zoom => write!(f, "Zoom"),
            MeetingApp::Teams => write!(f, "Teams"),
        }
    }
}

/// Polls application and OS signals for in-progress meetings.
///
/// Start and end detection differ because the pipeline's own VBAN sender
/// keeps a physical mic active while recording, which poisons generic
/// mic-activity checks. End detection is therefore app-specific.
pub struct MeetingDetector {
    mic_active_bin: PathBuf,
}

impl MeetingDetector {
    pub fn new(mic_active_bin: PathBuf) -> Self {
        Self { mic_active_bin }
    }

    /// Zoom runs a CptHost child process only during an active meeting,
    /// which makes it usable for both start and end detection.
    pub async fn zoom_meeting_active(&self) -> bool {
        self.pgrep("CptHost").await
    }

    /// Teams start detection: the MSTeams process is running AND a
    /// physical microphone has active CoreAudio I/O. The modern Teams
    /// client exposes no meeting state via window titles and bypasses the
    /// per-app mic-usage API, so this pair of signals is the reliable
    /// start indicator.
    ///
    /// Only valid for START detection: once the VBAN sender is running it
    /// keeps the mic active and this probe always reports true.
    pub async fn teams_meeting_active(&self) -> bool {
        if !self.pgrep("MSTeams").await {
            return false;
        }
        self.physical_mic_active().await
    }

    async fn physical_mic_active(&self) -> bool {
        if !self.mic_active_bin.exists() {
            tracing::warn!(
                "mic_active helper not found at {}",
                self.mic_active_bin.display()
            );
            return false;
        }
        let outcome = BoundedCommand::new([self.mic_active_bin.to_string_lossy().to_string()])
            .timeout(PROBE_TIMEOUT)
            .label("mic_active")
            .run()
            .await;
        match outcome {
            Ok(outcome) if outcome.success() => outcome.stdout.trim() == "YES",
            Ok(_) => false,
            Err(e) => {
                tracing::debug!("mic_active check failed: {}", e);
                false
            }
        }
    }

    /// Teams end detection while recording: query the OS audio daemon's
    /// event log for the most recent `isRecording` state within a bounded
    /// lookback window. No entry in the window means the call has simply
    /// been running without an audio state change, so the meeting is
    /// treated as still active.
    pub async fn teams_audio_session_active(&self) -> bool {
        let outcome = BoundedCommand::new([
            "log",
            "show",
            "--last",
            AUDIO_LOG_LOOKBACK,
            "--predicate",
            "process == \"audiomxd\" AND eventMessage CONTAINS \"MSTeams\" AND eventMessage CONTAINS \"isRecording\"",
            "--style",
            "compact",
        ])
        .timeout(LOG_PROBE_TIMEOUT)
        .label("audiomxd-log")
        .run()
        .await;

        match outcome {
            Ok(outcome) => teams_session_from_log(&outcome.stdout),
            Err(e) => {
                tracing::debug!("audiomxd log check failed: {}", e);
                true
            }
        }
    }

    /// Start-mode detection. Zoom is checked first.
    pub async fn detect_meeting(&self) -> Option<MeetingApp> {
        if self.zoom_meeting_active().await {
            return Some(MeetingApp::Zoom);
        }
        if self.teams_meeting_active().await {
            return Some(MeetingApp::Teams);
        }
        None
    }

    /// End-mode detection for the app that originated the recording.
    pub async fn still_in_meeting(&self, app: MeetingApp) -> bool {
        match app {
            MeetingApp::Zoom => self.zoom_meeting_active().await,
            MeetingApp::Teams => self.teams_audio_session_active().await,
        }
    }

    async fn pgrep(&self, process: &str) -> bool {
        let outcome = BoundedCommand::new(["pgrep", "-x", process])
            .timeout(PROBE_TIMEOUT)
            .label("pgrep")
            .run()
            .await;
        matches!(outcome, Ok(outcome) if outcome.success())
    }
}

/// Fold the audiomxd log lines down to the most recent recording state.
/// Fail-open: an empty window reads as still-active.
fn teams_session_from_log(log_output: &str) -> bool {
    for line in log_output.lines().rev() {
        if line.contains("isRecording: true") {
            return true;
        }
        if line.contains("isRecording: false") {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_recording_state_wins() {
        let log = "\
10:00:01 audiomxd MSTeams isRecording: true
10:05:42 audiomxd MSTeams isRecording: false
";
        assert!(!teams_session_from_log(log));

        let log = "\
10:00:01 audiomxd MSTeams isRecording: false
10:05:42 audiomxd MSTeams isRecording: true
";
        assert!(teams_session_from_log(log));
    }

    #[test]
    fn empty_log_window_is_still_active() {
        assert!(teams_session_from_log(""));
        assert!(teams_session_from_log("unrelated noise\n"));
    }
}
