/*
 * Meeting Pipeline - Workspace Sync Core
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
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::command::{split_command, truncate_detail, BoundedCommand, CommandOutcome};
use crate::config::DaemonConfig;

const GIT_QUICK_TIMEOUT: Duration = Duration::from_secs(10);
const GIT_PULL_TIMEOUT: Duration = Duration::from_secs(60);
const GIT_PUSH_TIMEOUT: Duration = Duration::from_secs(120);
const GIT_CLONE_TIMEOUT: Duration = Duration::from_secs(120);
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(20);
const DETAIL_MAX: usize = 500;

/// Git-backed single-writer store. All mutating HTTP endpoints and the
/// background sync serialize through `lock`; only one
/// commit+push+dispatch sequence is in flight at a time.
pub struct Workspace {
    config: DaemonConfig,
    pub lock: Mutex<()>,
    processing_in_flight: AtomicBool,
    client: reqwest::Client,
}

impl Workspace {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
            processing_in_flight: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn repo_path(&self) -> PathBuf {
        let dir = self.config.repo_dir();
        dir.canonicalize().unwrap_or(dir)
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.repo_path().join("inbox")
    }

    pub fn calendar_path(&self) -> PathBuf {
        self.repo_path().join("calendar.org")
    }

    async fn run_git(&self, args: &[&str], timeout: Duration) -> Result<CommandOutcome> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        BoundedCommand::new(argv)
            .cwd(self.repo_path())
            .timeout(timeout)
            .label("git")
            .run()
            .await
    }

    /// Clone the data repo if the workspace has no repository metadata.
    /// Idempotent; an existing checkout is left alone.
    pub async fn ensure_checkout(&self) -> Result<()> {
        let repo_path = self.repo_path();
        if repo_path.join(".git").exists() {
            return Ok(());
        }

        let clone_url = self.config.repository_url().ok_or_else(|| {
            anyhow::anyhow!(
                "Data repo not found at {} and no git.repository_url configured for auto-clone",
                repo_path.display()
            )
        })?;

        let parent = repo_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        tracing::info!("Cloning data repo into {}...", repo_path.display());
        let outcome = BoundedCommand::new([
            "git".to_string(),
            "clone".to_string(),
            "--branch".to_string(),
            self.config.git.branch.clone(),
            "--single-branch".to_string(),
            clone_url,
            repo_path.to_string_lossy().into_owned(),
        ])
        .cwd(parent)
        .timeout(GIT_CLONE_TIMEOUT)
        .label("git-clone")
        .run()
        .await?;

        if !outcome.success() {
            anyhow::bail!("git clone failed: {}", outcome.tail.trim());
        }
        Ok(())
    }

    async fn head_sha(&self) -> Option<String> {
        let outcome = self
            .run_git(&["rev-parse", "HEAD"], GIT_QUICK_TIMEOUT)
            .await
            .ok()?;
        if !outcome.success() {
            return None;
        }
        let sha = outcome.stdout.trim().to_string();
        if sha.is_empty() {
            None
        } else {
            Some(sha)
        }
    }

    /// Fast-forward pull from the configured remote/branch. Returns
    /// (changed, message); pull failures are reported, not raised.
    pub async fn sync(&self) -> Result<(bool, String)> {
        if !self.config.sync_enabled() {
            return Ok((false, "sync disabled".to_string()));
        }

        self.ensure_checkout().await?;
        let before = self.head_sha().await;

        let mut args = vec!["pull"];
        if self.config.sync.ff_only {
            args.push("--ff-only");
        }
        args.push(self.config.git.remote.as_str());
        args.push(self.config.git.branch.as_str());

        let outcome = self.run_git(&args, GIT_PULL_TIMEOUT).await?;
        if !outcome.success() {
            return Ok((false, format!("git pull failed: {}", outcome.tail.trim())));
        }

        let after = self.head_sha().await;
        let changed = matches!((&before, &after), (Some(b), Some(a)) if b != a);
        let message = if changed {
            "pulled new commits"
        } else {
            "already up to date"
        };
        Ok((changed, message.to_string()))
    }

    /// Stage and commit one file. The file must resolve inside the
    /// workspace root; anything else is refused.
    pub async fn commit(&self, file: &Path, title: &str) -> (bool, String) {
        let repo_path = self.repo_path();
        let file_abs = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
        let rel_path = match file_abs.strip_prefix(&repo_path) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                return (
                    false,
                    format!("File path is outside repository: {}", file_abs.display()),
                );
            }
        };

        let rel = rel_path.to_string_lossy().into_owned();
        match self.run_git(&["add", rel.as_str()], GIT_QUICK_TIMEOUT).await {
            Ok(outcome) if outcome.success() => {
                tracing::info!("Git added: {}", rel);
            }
            Ok(outcome) => return (false, format!("Git add failed: {}", outcome.tail.trim())),
            Err(e) => return (false, format!("Git add failed: {:#}", e)),
        }

        let message = self
            .config
            .git
            .commit_message_template
            .replace("{title}", title);
        match self
            .run_git(&["commit", "-m", message.as_str()], GIT_QUICK_TIMEOUT)
            .await
        {
            Ok(outcome) if outcome.success() => {
                tracing::info!("Git committed: {}", message);
                (true, "Committed to repository".to_string())
            }
            Ok(outcome) => (false, format!("Git commit failed: {}", outcome.tail.trim())),
            Err(e) => (false, format!("Git commit failed: {:#}", e)),
        }
    }

    /// Sync first (to avoid rejection), then push the configured branch.
    pub async fn push(&self) -> (bool, String) {
        if !self.config.git.auto_push {
            return (true, "Push disabled in config".to_string());
        }

        match self.sync().await {
            Ok((changed, message)) => {
                tracing::info!("Sync before push: {}", message);
                if changed && self.config.hooks.on_new_commits.enabled {
                    let (ok, hook_msg) = self.run_hook_on_new_commits().await;
                    if !ok {
                        tracing::warn!("{}", hook_msg);
                    }
                }
            }
            Err(e) => tracing::warn!("Sync before push failed: {:#}", e),
        }

        let args = [
            "push",
            self.config.git.remote.as_str(),
            self.config.git.branch.as_str(),
        ];
        match self.run_git(&args, GIT_PUSH_TIMEOUT).await {
            Ok(outcome) if outcome.success() => {
                let target = format!("{}/{}", self.config.git.remote, self.config.git.branch);
                tracing::info!("Git pushed to {}", target);
                (true, format!("Pushed to {}", target))
            }
            Ok(outcome) => (false, format!("Git push failed: {}", outcome.tail.trim())),
            Err(e) => (false, format!("Git push failed: {:#}", e)),
        }
    }

    /// Run the configured hook after new commits arrive from the remote.
    pub async fn run_hook_on_new_commits(&self) -> (bool, String) {
        let hook = &self.config.hooks.on_new_commits;
        if !hook.enabled {
            return (false, "hook disabled".to_string());
        }
        let Some(ref command) = hook.command else {
            return (false, "hook enabled but no command configured".to_string());
        };

        let working_dir = self.repo_path().join(&hook.working_directory);
        let _ = std::fs::create_dir_all(&working_dir);

        let argv = split_command(command);
        if argv.is_empty() {
            return (false, "hook enabled but no command configured".to_string());
        }
        tracing::info!("Running hook: {:?} (cwd={})", argv, working_dir.display());

        match BoundedCommand::new(argv)
            .cwd(working_dir)
            .timeout(Duration::from_secs(hook.timeout_seconds))
            .label("hook")
            .run()
            .await
        {
            Ok(outcome) if outcome.success() => (true, "hook completed".to_string()),
            Ok(outcome) if outcome.timed_out => (
                false,
                format!("hook timed out after {}s", hook.timeout_seconds),
            ),
            Ok(outcome) => {
                let stderr = outcome.tail.trim().to_string();
                let detail = if stderr.is_empty() {
                    "non-zero exit".to_string()
                } else {
                    stderr
                };
                (false, format!("hook failed: {}", detail))
            }
            Err(e) => (false, format!("hook failed: {:#}", e)),
        }
    }

    /// Remote dispatch: trigger the configured workflow over the GitHub
    /// Actions API with a token from the environment.
    pub async fn dispatch_workflow(&self, reason: &str) -> (bool, String) {
        let dispatch = &self.config.github.workflow_dispatch;
        if !dispatch.enabled {
            return (false, "workflow dispatch disabled".to_string());
        }
        let (Some(repo), Some(workflow)) = (&dispatch.repo, &dispatch.workflow) else {
            return (
                false,
                "workflow dispatch enabled but repo/workflow not configured".to_string(),
            );
        };
        let Ok(token) = std::env::var("GH_TOKEN") else {
            return (false, "GH_TOKEN not set".to_string());
        };

        let url = format!(
            "https://api.github.com/repos/{}/actions/workflows/{}/dispatches",
            repo, workflow
        );
        let payload = serde_json::json!({
            "ref": dispatch.git_ref,
            "inputs": dispatch.inputs,
        });

        tracing::info!("Dispatching workflow {} ({})", workflow, reason);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "meetingnotesd")
            .timeout(DISPATCH_TIMEOUT)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) if matches!(resp.status().as_u16(), 200 | 201 | 204) => {
                (true, "workflow dispatch triggered".to_string())
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                (
                    false,
                    format!(
                        "workflow dispatch failed ({}): {}",
                        status,
                        truncate_detail(text.trim(), DETAIL_MAX)
                    ),
                )
            }
            Err(e) => (false, format!("workflow dispatch failed: {}", e)),
        }
    }

    /// Standalone processing: run the local summarization command against
    /// the workspace, streaming its output and enforcing the configured
    /// deadline.
    pub async fn run_standalone_processing(&self) -> (bool, String) {
        let standalone = &self.config.processing.standalone;
        if !standalone.enabled {
            return (false, "standalone processing disabled".to_string());
        }
        let argv = split_command(&standalone.command);
        if argv.is_empty() {
            return (
                false,
                "standalone enabled but no command configured".to_string(),
            );
        }

        let working_dir = if Path::new(&standalone.working_directory).is_absolute() {
            PathBuf::from(&standalone.working_directory)
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(&standalone.working_directory)
        };
        let _ = std::fs::create_dir_all(&working_dir);

        tracing::info!(
            "Running standalone processing: {:?} (cwd={}, WORKSPACE_DIR={})",
            argv,
            working_dir.display(),
            self.repo_path().display()
        );

        let outcome = BoundedCommand::new(argv)
            .cwd(working_dir)
            .env("WORKSPACE_DIR", self.repo_path().to_string_lossy())
            .timeout(Duration::from_secs(standalone.timeout_seconds))
            .label("standalone")
            .run()
            .await;

        match outcome {
            Ok(outcome) if outcome.timed_out => (
                false,
                format!(
                    "standalone processing timed out after {}s",
                    standalone.timeout_seconds
                ),
            ),
            Ok(outcome) if outcome.success() => {
                tracing::info!(
                    "Standalone processing completed in {}s",
                    outcome.elapsed.as_secs()
                );
                (true, "standalone processing completed".to_string())
            }
            Ok(outcome) => {
                let detail = if outcome.tail.trim().is_empty() {
                    "non-zero exit".to_string()
                } else {
                    truncate_detail(outcome.tail.trim(), DETAIL_MAX)
                };
                (
                    false,
                    format!(
                        "standalone processing failed (exit {}, {}s): {}",
                        outcome
                            .exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "?".to_string()),
                        outcome.elapsed.as_secs(),
                        detail
                    ),
                )
            }
            Err(e) => (false, format!("standalone processing failed: {:#}", e)),
        }
    }

    /// Fire-and-forget standalone processing. If a run is already in
    /// flight, skip: the running pass will pick up any new inbox files.
    pub fn run_standalone_processing_async(self: &Arc<Self>) {
        if self.processing_in_flight.swap(true, Ordering::SeqCst) {
            tracing::info!("Processing already in progress, skipping (new files will be picked up)");
            return;
        }

        let workspace = self.clone();
        tokio::spawn(async move {
            let _guard = workspace.lock.lock().await;
            let (ok, message) = workspace.run_standalone_processing().await;
            if ok {
                tracing::info!("Background processing succeeded: {}", message);
                if workspace.config.git.auto_push {
                    let (push_ok, push_msg) = workspace.push().await;
                    if push_ok {
                        tracing::info!("Background push succeeded: {}", push_msg);
                    } else {
                        tracing::error!("Background push failed: {}", push_msg);
                    }
                }
            } else {
                tracing::error!("Background processing failed: {}", message);
            }
            workspace.processing_in_flight.store(false, Ordering::SeqCst);
        });
        tracing::info!("Started background processing task");
    }

    /// Background poll loop re-running sync at the configured interval,
    /// with the on-new-commits hook on change. A bad poll never stops the
    /// loop.
    pub fn spawn_background_sync(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.config.sync.poll_interval_seconds;
        if !self.config.sync_enabled() || interval <= 0.0 {
            return None;
        }

        let workspace = self.clone();
        Some(tokio::spawn(async move {
            tracing::info!("Background sync started (interval={}s)", interval);
            loop {
                tokio::time::sleep(Duration::from_secs_f64(interval)).await;
                let _guard = workspace.lock.lock().await;
                match workspace.sync().await {
                    Ok((true, message)) => {
                        tracing::info!("Background sync: {}", message);
                        let (ok, hook_msg) = workspace.run_hook_on_new_commits().await;
                        if !ok {
                            tracing::warn!("{}", hook_msg);
                        }
                    }
                    Ok((false, message)) => tracing::debug!("Background sync: {}", message),
                    Err(e) => tracing::warn!("Background sync error: {:#}", e),
                }
            }
        }))
    }
}
