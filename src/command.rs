/*
 * Meeting Pipeline - Bounded Command Runner
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
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::sleep;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TAIL_LINES: usize = 50;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// The uniform subprocess wrapper used for STT, git, detector probes,
/// hooks and standalone processing: argv + cwd + env + deadline, with
/// line-by-line output streaming into the log and a bounded tail kept for
/// error reporting.
pub struct BoundedCommand {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Duration,
    tail_lines: usize,
    label: String,
}

#[derive(Debug)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub tail: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

impl BoundedCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        let label = argv.first().cloned().unwrap_or_default();
        Self {
            argv,
            cwd: None,
            envs: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            tail_lines: DEFAULT_TAIL_LINES,
            label,
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Run the command to completion or deadline. The process is killed on
    /// deadline; the outcome then carries `timed_out = true`.
    pub async fn run(self) -> Result<CommandOutcome> {
        let program = self
            .argv
            .first()
            .ok_or_else(|| anyhow::anyhow!("Empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let tail = Arc::new(Mutex::new(VecDeque::<String>::new()));
        let line_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let stdout_buf = stdout_buf.clone();
            let tail = tail.clone();
            let line_count = line_count.clone();
            let label = self.label.clone();
            let tail_lines = self.tail_lines;
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{}] {}", label, line);
                    if let Ok(mut buf) = stdout_buf.lock() {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                    push_tail(&tail, tail_lines, line);
                    line_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tail = tail.clone();
            let line_count = line_count.clone();
            let label = self.label.clone();
            let tail_lines = self.tail_lines;
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{}] {}", label, line);
                    push_tail(&tail, tail_lines, line);
                    line_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }));
        }

        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);
        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        progress.tick().await; // consume the immediate first tick

        let (exit_code, timed_out) = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.context("Failed to wait for child")?;
                    break (status.code(), false);
                }
                _ = &mut deadline => {
                    tracing::warn!(
                        "[{}] deadline of {:?} exceeded, killing",
                        self.label, self.timeout
                    );
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break (None, true);
                }
                _ = progress.tick() => {
                    tracing::info!(
                        "[{}] ... still running ({}s, {} lines)",
                        self.label,
                        start.elapsed().as_secs(),
                        line_count.load(std::sync::atomic::Ordering::Relaxed)
                    );
                }
            }
        };

        // The pipes close when the process exits; let the readers drain.
        for reader in readers {
            let _ = reader.await;
        }

        let stdout = stdout_buf
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default();
        let tail = tail
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();

        Ok(CommandOutcome {
            exit_code,
            stdout,
            tail,
            elapsed: start.elapsed(),
            timed_out,
        })
    }
}

fn push_tail(tail: &Mutex<VecDeque<String>>, cap: usize, line: String) {
    if let Ok(mut tail) = tail.lock() {
        if tail.len() >= cap {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Split a configured command string into argv, honoring single and double
/// quotes the way the daemon's YAML config expects.
pub fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Truncate an error detail for cross-machine propagation.
pub fn truncate_detail(detail: &str, max: usize) -> String {
    if detail.len() <= max {
        detail.to_string()
    } else {
        let mut cut = max;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &detail[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = BoundedCommand::new(["sh", "-c", "echo one; echo two"])
            .run()
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout, "one\ntwo\n");
        assert_eq!(outcome.tail, "one\ntwo");
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let outcome = BoundedCommand::new(["sh", "-c", "echo oops >&2; exit 3"])
            .run()
            .await
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.tail, "oops");
    }

    #[tokio::test]
    async fn kills_on_deadline() {
        let outcome = BoundedCommand::new(["sh", "-c", "sleep 10"])
            .timeout(Duration::from_millis(200))
            .run()
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn passes_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = BoundedCommand::new(["sh", "-c", "pwd; echo $MARKER"])
            .cwd(dir.path())
            .env("MARKER", "hello")
            .run()
            .await
            .unwrap();
        assert!(outcome.success());
        assert!(outcome.stdout.contains("hello"));
    }

    #[test]
    fn split_command_honors_quotes() {
        assert_eq!(
            split_command("run-summarization --git"),
            vec!["run-summarization", "--git"]
        );
        assert_eq!(
            split_command("sh -c 'echo hook ran'"),
            vec!["sh", "-c", "echo hook ran"]
        );
        assert_eq!(
            split_command("cmd \"two words\" three"),
            vec!["cmd", "two words", "three"]
        );
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn truncate_detail_caps_length() {
        assert_eq!(truncate_detail("short", 500), "short");
        let long = "x".repeat(600);
        let truncated = truncate_detail(&long, 500);
        assert_eq!(truncated.len(), 503);
        assert!(truncated.ends_with("..."));
    }
}
