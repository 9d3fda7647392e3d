/*
 * Meeting Pipeline - Configuration
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
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or_else(|_| {
        if let Some(rest) = default.strip_prefix("~/") {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(rest)
        } else {
            PathBuf::from(default)
        }
    })
}

/// Capture-agent configuration, from environment variables (with .env
/// support).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub transcriber_url: String,
    pub pilot_host: String,
    pub vban_port: u16,
    pub stream_name: String,
    pub sample_rate: u32,
    pub mic_gain: f32,
    pub poll_interval: Duration,
    pub calendar_org: PathBuf,
    pub pid_file: PathBuf,
    pub sender_log_file: PathBuf,
    pub mic_active_bin: PathBuf,
}

impl AgentConfig {
    pub fn load() -> Self {
        dotenv::dotenv().ok();

        let pilot_host = env_string("PILOT_HOST", "pilot");
        let transcriber_url = env::var("TRANSCRIBER_URL").unwrap_or_else(|_| {
            let host = env_string("TRANSCRIBER_HOST", &pilot_host);
            let port = env_or::<u16>("TRANSCRIBER_PORT", 8000);
            format!("http://{}:{}", host, port)
        });

        Self {
            transcriber_url,
            pilot_host,
            vban_port: env_or("VBAN_PORT", 6980),
            stream_name: env_string("VBAN_STREAM_NAME", "MeetingAudio"),
            sample_rate: env_or("AUDIO_SAMPLE_RATE", 48000),
            mic_gain: env_or("MIC_GAIN", 1.0),
            poll_interval: Duration::from_secs(env_or("MEETING_POLL_INTERVAL", 5)),
            calendar_org: env_path("MEETING_CALENDAR_ORG", "~/gtd/outlook.org"),
            pid_file: env_path("MEETING_PID_FILE", "/tmp/meeting-vban-sender.pid"),
            sender_log_file: env_path("MEETING_LOG_FILE", "/tmp/meeting-vban-sender.log"),
            mic_active_bin: env_path("MIC_ACTIVE_BIN", "/usr/local/bin/mic_active"),
        }
    }
}

/// Transcription-appliance configuration, from environment variables.
#[derive(Debug, Clone)]
pub struct ApplianceConfig {
    pub host: String,
    pub port: u16,
    pub recordings_dir: PathBuf,
    pub whisper_cli: PathBuf,
    pub whisper_model: PathBuf,
    pub webhook_url: String,
    pub vban_port: u16,
    pub stream_name: String,
    pub recording_max_age_days: u64,
    pub stt_timeout: Duration,
}

impl ApplianceConfig {
    pub fn load() -> Self {
        dotenv::dotenv().ok();

        Self {
            host: env_string("TRANSCRIBER_HOST", "0.0.0.0"),
            port: env_or("TRANSCRIBER_PORT", 8000),
            recordings_dir: env_path("RECORDINGS_DIR", "~/transcriber/recordings"),
            whisper_cli: env_path("WHISPER_CLI", "~/whisper.cpp/build/bin/whisper-cli"),
            whisper_model: env_path("WHISPER_MODEL", "~/whisper.cpp/models/ggml-large-v3.bin"),
            webhook_url: env_string("WEBHOOK_URL", "http://localhost:9876/webhook"),
            vban_port: env_or("VBAN_PORT", 6980),
            stream_name: env_string("VBAN_STREAM_NAME", "MeetingAudio"),
            recording_max_age_days: env_or("RECORDING_MAX_AGE_DAYS", 7),
            stt_timeout: Duration::from_secs(env_or("STT_TIMEOUT_SECS", 600)),
        }
    }
}

/// Ingest daemon configuration, loaded from a YAML file named by the
/// WEBHOOK_CONFIG environment variable (default `config.yaml`).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerSection,
    pub data_repo: Option<String>,
    pub git: GitSection,
    pub sync: SyncSection,
    pub processing: ProcessingSection,
    pub github: GithubSection,
    pub hooks: HooksSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9876,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitSection {
    pub auto_commit: bool,
    pub auto_push: bool,
    pub repository_url: Option<String>,
    pub branch: String,
    pub remote: String,
    pub commit_message_template: String,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            auto_commit: false,
            auto_push: false,
            repository_url: None,
            branch: "main".to_string(),
            remote: "origin".to_string(),
            commit_message_template: "Add transcript: {title}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// None defers to git.auto_push (a safe pull-before-push default).
    pub enabled: Option<bool>,
    pub on_startup: bool,
    pub before_accepting_webhooks: bool,
    pub poll_interval_seconds: f64,
    pub ff_only: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            enabled: None,
            on_startup: true,
            before_accepting_webhooks: true,
            poll_interval_seconds: 0.0,
            ff_only: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProcessingSection {
    pub standalone: StandaloneSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StandaloneSection {
    pub enabled: bool,
    pub command: String,
    pub working_directory: String,
    pub timeout_seconds: u64,
    #[serde(rename = "async")]
    pub run_async: bool,
}

impl Default for StandaloneSection {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "run-summarization --git".to_string(),
            working_directory: ".".to_string(),
            timeout_seconds: 1800,
            run_async: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GithubSection {
    pub workflow_dispatch: WorkflowDispatchSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowDispatchSection {
    pub enabled: bool,
    pub repo: Option<String>,
    pub workflow: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub inputs: HashMap<String, serde_json::Value>,
}

impl Default for WorkflowDispatchSection {
    fn default() -> Self {
        Self {
            enabled: false,
            repo: None,
            workflow: None,
            git_ref: "main".to_string(),
            inputs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HooksSection {
    pub on_new_commits: HookSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HookSection {
    pub enabled: bool,
    pub command: Option<String>,
    pub working_directory: String,
    pub timeout_seconds: u64,
}

impl Default for HookSection {
    fn default() -> Self {
        Self {
            enabled: false,
            command: None,
            working_directory: ".".to_string(),
            timeout_seconds: 600,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn load_from_env() -> Result<Self> {
        let path = env::var("WEBHOOK_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        Self::load(Path::new(&path))
    }

    pub fn repo_dir(&self) -> PathBuf {
        PathBuf::from(self.data_repo.as_deref().unwrap_or("."))
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync.enabled.unwrap_or(self.git.auto_push)
    }

    /// Normalize a configured repository URL: bare `github.com/...` forms
    /// gain an https scheme.
    pub fn repository_url(&self) -> Option<String> {
        let url = self.git.repository_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(url.to_string())
        } else if url.starts_with("github.com/") {
            Some(format!("https://{}", url))
        } else {
            Some(url.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_config_defaults() {
        let config: DaemonConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9876);
        assert!(!config.git.auto_commit);
        assert_eq!(config.git.branch, "main");
        assert_eq!(config.git.remote, "origin");
        assert_eq!(config.git.commit_message_template, "Add transcript: {title}");
        assert!(config.sync.ff_only);
        assert!(!config.sync_enabled());
        assert!(!config.processing.standalone.enabled);
        assert!(!config.processing.standalone.run_async);
        assert_eq!(config.hooks.on_new_commits.timeout_seconds, 600);
    }

    #[test]
    fn sync_enabled_defaults_to_auto_push() {
        let config: DaemonConfig = serde_yaml::from_str("git:\n  auto_push: true\n").unwrap();
        assert!(config.sync_enabled());

        let config: DaemonConfig =
            serde_yaml::from_str("git:\n  auto_push: true\nsync:\n  enabled: false\n").unwrap();
        assert!(!config.sync_enabled());
    }

    #[test]
    fn parses_nested_sections() {
        let yaml = "\
server:
  host: 0.0.0.0
  port: 19876
data_repo: /tmp/notes
git:
  auto_commit: true
  repository_url: github.com/owner/notes
processing:
  standalone:
    enabled: true
    command: \"uv run summarize --git\"
    async: true
github:
  workflow_dispatch:
    enabled: true
    repo: owner/processor
    workflow: process.yml
    inputs:
      foo: bar
";
        let config: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 19876);
        assert_eq!(config.repo_dir(), PathBuf::from("/tmp/notes"));
        assert!(config.git.auto_commit);
        assert_eq!(
            config.repository_url().as_deref(),
            Some("https://github.com/owner/notes")
        );
        assert!(config.processing.standalone.run_async);
        assert_eq!(
            config.github.workflow_dispatch.inputs.get("foo"),
            Some(&serde_json::Value::String("bar".to_string()))
        );
    }
}
