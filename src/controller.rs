/*
 * Meeting Pipeline - Recording Controller
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
use chrono::Local;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::audio::{find_best_device, find_mic_device, CaptureQuality};
use crate::calendar::lookup_calendar_title;
use crate::config::AgentConfig;
use crate::detector::{MeetingApp, MeetingDetector};
use crate::types::{ApplianceStatus, StartRequest, StartResponse, StopResponse};

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Time for the network stream to establish before the appliance starts
/// writing.
const STREAM_WARMUP: Duration = Duration::from_secs(3);

/// SIGTERM grace before the sender is killed outright.
const SENDER_STOP_GRACE: Duration = Duration::from_secs(2);

/// Capture-agent phase. Busy is held strictly across a start or stop
/// transition so the two can never double-invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Busy,
    Recording,
}

/// Mutable controller state, guarded by one mutex.
#[derive(Debug, Clone)]
struct Session {
    phase: Phase,
    title: Option<String>,
    app: Option<MeetingApp>,
    auto: bool,
    suppress_auto: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            title: None,
            app: None,
            auto: false,
            suppress_auto: false,
        }
    }
}

/// Orchestrates the laptop sender and the appliance API: decides when to
/// start and stop, tolerating detector false positives and the recorder's
/// own mic use.
pub struct RecordingController {
    config: AgentConfig,
    client: reqwest::Client,
    detector: MeetingDetector,
    session: Mutex<Session>,
}

impl RecordingController {
    pub fn new(config: AgentConfig) -> Self {
        let detector = MeetingDetector::new(config.mic_active_bin.clone());
        Self {
            config,
            client: reqwest::Client::new(),
            detector,
            session: Mutex::new(Session::default()),
        }
    }

    // ---------------------------------------------------------------
    // Appliance API client
    // ---------------------------------------------------------------

    pub async fn appliance_status(&self) -> Option<ApplianceStatus> {
        let url = format!("{}/status", self.config.transcriber_url);
        let response = self
            .client
            .get(&url)
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .ok()?;
        response.json().await.ok()
    }

    async fn appliance_start(&self, title: &str) -> Result<StartResponse> {
        let url = format!("{}/start", self.config.transcriber_url);
        let response = self
            .client
            .post(&url)
            .timeout(CONTROL_TIMEOUT)
            .json(&StartRequest {
                title: title.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("Cannot reach transcriber at {}", url))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            let detail: serde_json::Value = response.json().await.unwrap_or_default();
            anyhow::bail!(
                "Already recording: {}",
                detail
                    .get("detail")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
            );
        }
        if !response.status().is_success() {
            anyhow::bail!("Appliance /start returned {}", response.status());
        }
        response
            .json()
            .await
            .context("Invalid /start response from appliance")
    }

    async fn appliance_stop(&self) -> Result<Option<StopResponse>> {
        let url = format!("{}/stop", self.config.transcriber_url);
        let response = self
            .client
            .post(&url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Cannot reach transcriber at {}", url))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("Appliance /stop returned {}", response.status());
        }
        Ok(Some(
            response
                .json()
                .await
                .context("Invalid /stop response from appliance")?,
        ))
    }

    // ---------------------------------------------------------------
    // Title resolution: explicit > calendar > "<App> Meeting ts"
    // ---------------------------------------------------------------

    pub fn resolve_title(&self, explicit: Option<String>, app_label: &str) -> String {
        if let Some(title) = explicit {
            return title;
        }
        if let Some(title) =
            lookup_calendar_title(&self.config.calendar_org, Local::now().naive_local())
        {
            tracing::info!("Calendar match: '{}'", title);
            return title;
        }
        format!(
            "{} Meeting {}",
            app_label,
            Local::now().format("%Y-%m-%d %H:%M")
        )
    }

    // ---------------------------------------------------------------
    // Start / stop protocol
    // ---------------------------------------------------------------

    /// Atomic start across machines: check the appliance, start the local
    /// sender, let the stream establish, then ask the appliance to record.
    /// Any failure tears the sender back down and returns to idle.
    pub async fn start(
        &self,
        title: String,
        device: Option<String>,
        mic: Option<String>,
        app: Option<MeetingApp>,
        auto: bool,
    ) -> Result<StartResponse> {
        {
            let mut session = self.session.lock().await;
            if session.phase != Phase::Idle {
                anyhow::bail!("Start ignored: controller is {:?}", session.phase);
            }
            session.phase = Phase::Busy;
        }

        let result = self
            .start_inner(&title, device.as_deref(), mic.as_deref())
            .await;

        let mut session = self.session.lock().await;
        match result {
            Ok(response) => {
                session.phase = Phase::Recording;
                session.title = Some(title.clone());
                session.app = app;
                session.auto = auto;
                tracing::info!("Recording started: '{}'", title);
                Ok(response)
            }
            Err(e) => {
                session.phase = Phase::Idle;
                Err(e)
            }
        }
    }

    async fn start_inner(
        &self,
        title: &str,
        device: Option<&str>,
        mic: Option<&str>,
    ) -> Result<StartResponse> {
        let status = self
            .appliance_status()
            .await
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Cannot reach transcriber at {}. Is it running?",
                    self.config.transcriber_url
                )
            })?;
        if let Some(recording) = status.recording {
            anyhow::bail!(
                "Already recording: {} (started {})",
                recording.title,
                recording.meeting_start
            );
        }

        let (device_name, quality) = match device {
            Some(name) => {
                let quality = if name.to_lowercase().contains("blackhole") {
                    CaptureQuality::Full
                } else {
                    CaptureQuality::Partial
                };
                (name.to_string(), quality)
            }
            None => {
                let (best, quality) = find_best_device().ok_or_else(|| {
                    anyhow::anyhow!(
                        "No suitable audio device found. Install BlackHole 2ch or specify with -d"
                    )
                })?;
                (best.name, quality)
            }
        };

        if quality == CaptureQuality::Partial {
            tracing::warn!(
                "Using {} - only remote participants will be captured",
                device_name
            );
        }

        // Mic mixing only makes sense on top of routed app audio.
        let mic_name = if quality == CaptureQuality::Full {
            mic.map(str::to_string)
                .or_else(|| find_mic_device().map(|d| d.name))
        } else {
            None
        };

        sender::start(&self.config, &device_name, mic_name.as_deref())?;
        sleep(STREAM_WARMUP).await;

        match self.appliance_start(title).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::error!("Failed to start recording on appliance: {:#}", e);
                sender::stop(&self.config);
                Err(e)
            }
        }
    }

    /// Stop protocol: the appliance is asked first, then the sender is
    /// torn down. A remote failure never blocks local teardown.
    pub async fn stop(&self, manual: bool) -> Result<Option<StopResponse>> {
        let auto = {
            let mut session = self.session.lock().await;
            if session.phase == Phase::Busy {
                anyhow::bail!("Stop ignored: controller is busy");
            }
            session.phase = Phase::Busy;
            session.auto
        };

        // A manual stop of an auto-started session latches suppress-auto
        // only while the underlying meeting is still running.
        let suppress = manual && auto && self.detector.detect_meeting().await.is_some();

        let result = self.appliance_stop().await;
        if let Err(ref e) = result {
            tracing::warn!("Appliance stop failed (continuing teardown): {:#}", e);
        }

        sender::stop(&self.config);

        let mut session = self.session.lock().await;
        let title = session.title.take();
        session.phase = Phase::Idle;
        session.app = None;
        session.auto = false;
        if suppress {
            session.suppress_auto = true;
            tracing::info!("Suppressing auto-restart until meeting ends");
        }

        match result {
            Ok(Some(response)) => {
                tracing::info!(
                    "Recording stopped: '{}' ({:.1}s)",
                    title.unwrap_or_default(),
                    response.duration_seconds
                );
                Ok(Some(response))
            }
            Ok(None) => {
                tracing::warn!("No active recording on appliance");
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    // ---------------------------------------------------------------
    // Auto-detect loop
    // ---------------------------------------------------------------

    /// Poll the detector and drive recording automatically. Runs until
    /// cancelled; a bad poll never stops the loop.
    pub async fn watch(&self) -> Result<()> {
        tracing::info!(
            "Detection loop active (poll interval {:?})",
            self.config.poll_interval
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                tracing::error!("Poll error: {:#}", e);
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let (phase, auto, app, suppress) = {
            let session = self.session.lock().await;
            (
                session.phase,
                session.auto,
                session.app,
                session.suppress_auto,
            )
        };

        if phase == Phase::Busy {
            return Ok(());
        }

        if phase == Phase::Recording {
            if !auto {
                return Ok(());
            }
            // End detection listens only to the originating app: our own
            // sender keeps the mic active, so a generic probe would see
            // "Teams" even during a Zoom recording.
            let Some(app) = app else { return Ok(()) };
            if !self.detector.still_in_meeting(app).await {
                tracing::info!("Meeting ended (was: {})", app);
                let _ = self.stop(false).await;
            }
            return Ok(());
        }

        let meeting_app = self.detector.detect_meeting().await;

        match meeting_app {
            Some(app) if !suppress => {
                tracing::info!("Meeting detected: {}", app);
                let title = self.resolve_title(None, &app.to_string());
                if let Err(e) = self.start(title, None, None, Some(app), true).await {
                    tracing::error!("Auto-start failed: {:#}", e);
                }
            }
            Some(_) => {
                // User manually stopped; wait for the meeting to end.
            }
            None => {
                if suppress {
                    tracing::info!("Meeting ended, clearing auto-suppress");
                    self.session.lock().await.suppress_auto = false;
                }
            }
        }
        Ok(())
    }
}

/// Management of the detached sender process. The pid file lets a fresh
/// controller adopt or terminate an orphaned sender after a crash.
pub mod sender {
    use super::*;
    use std::process::{Command, Stdio};

    /// Check the pid file for a live sender. A stale file is removed.
    pub fn running(pid_file: &Path) -> Option<i32> {
        let content = std::fs::read_to_string(pid_file).ok()?;
        let pid: i32 = content.trim().parse().ok()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            let _ = std::fs::remove_file(pid_file);
            None
        }
    }

    /// Spawn `meeting stream` as a detached child and record its pid.
    /// An already-running sender is adopted as-is.
    pub fn start(config: &AgentConfig, device: &str, mic: Option<&str>) -> Result<i32> {
        if let Some(pid) = running(&config.pid_file) {
            tracing::info!("VBAN sender already running (PID {})", pid);
            return Ok(pid);
        }

        let exe = std::env::current_exe().context("Cannot locate own executable")?;
        let log = std::fs::File::create(&config.sender_log_file)
            .with_context(|| format!("Cannot open {}", config.sender_log_file.display()))?;
        let log_err = log.try_clone().context("Cannot clone sender log handle")?;

        let mut cmd = Command::new(exe);
        cmd.arg("stream")
            .arg("-d")
            .arg(device)
            .arg("-t")
            .arg(&config.pilot_host)
            .arg("-p")
            .arg(config.vban_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(mic) = mic {
            cmd.arg("--mic").arg(mic);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Detach from the controlling terminal.
            cmd.process_group(0);
        }

        let child = cmd.spawn().context("Failed to spawn VBAN sender")?;
        let pid = child.id() as i32;
        std::fs::write(&config.pid_file, pid.to_string())
            .with_context(|| format!("Cannot write {}", config.pid_file.display()))?;

        let mode = match mic {
            Some(mic) => format!("mixed ({} + {})", device, mic),
            None => device.to_string(),
        };
        tracing::info!("VBAN sender started (PID {}) -> {}", pid, mode);
        Ok(pid)
    }

    /// Graceful SIGTERM with a bounded grace period, then SIGKILL.
    pub fn stop(config: &AgentConfig) {
        let Some(pid) = running(&config.pid_file) else {
            tracing::info!("No VBAN sender running");
            return;
        };

        terminate(pid);
        let deadline = std::time::Instant::now() + SENDER_STOP_GRACE;
        while process_alive(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(200));
        }
        if process_alive(pid) {
            tracing::warn!("Sender did not exit after SIGTERM, killing (PID {})", pid);
            kill(pid);
        }

        let _ = std::fs::remove_file(&config.pid_file);
        tracing::info!("VBAN sender stopped (PID {})", pid);
    }

    #[cfg(unix)]
    fn process_alive(pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(unix)]
    fn terminate(pid: i32) {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }

    #[cfg(unix)]
    fn kill(pid: i32) {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn process_alive(_pid: i32) -> bool {
        false
    }

    #[cfg(not(unix))]
    fn terminate(_pid: i32) {}

    #[cfg(not(unix))]
    fn kill(_pid: i32) {}

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn stale_pid_file_is_removed() {
            let dir = tempfile::tempdir().unwrap();
            let pid_file = dir.path().join("sender.pid");
            // A pid that cannot exist.
            std::fs::write(&pid_file, "999999999").unwrap();
            assert_eq!(running(&pid_file), None);
            assert!(!pid_file.exists());
        }

        #[test]
        fn missing_pid_file_means_not_running() {
            let dir = tempfile::tempdir().unwrap();
            assert_eq!(running(&dir.path().join("absent.pid")), None);
        }

        #[test]
        fn own_pid_is_alive() {
            let dir = tempfile::tempdir().unwrap();
            let pid_file = dir.path().join("sender.pid");
            std::fs::write(&pid_file, std::process::id().to_string()).unwrap();
            assert_eq!(running(&pid_file), Some(std::process::id() as i32));
        }
    }
}
