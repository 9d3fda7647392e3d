/*
 * Meeting Pipeline - Workspace Sync Integration Tests
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

use std::path::Path;
use std::process::Command;

use meeting_pipeline::config::DaemonConfig;
use meeting_pipeline::workspace::Workspace;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git not available");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git not available");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Initialize a repository with an inbox and a first commit.
fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@test.invalid"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::create_dir_all(dir.join("inbox")).unwrap();
    std::fs::write(dir.join("inbox/.gitkeep"), "").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "Initial"]);
}

fn config_for(repo: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.data_repo = Some(repo.to_string_lossy().into_owned());
    config.git.auto_commit = true;
    config.git.repository_url = Some("https://github.com/test/repo.git".to_string());
    config.sync.enabled = Some(true);
    config
}

#[tokio::test]
async fn ensure_checkout_is_a_noop_on_existing_repo() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let workspace = Workspace::new(config_for(&repo));
    workspace.ensure_checkout().await.unwrap();
    // Second call is also a no-op.
    workspace.ensure_checkout().await.unwrap();
    assert!(repo.join(".git").exists());
}

#[tokio::test]
async fn ensure_checkout_fails_without_repository_url() {
    let tmp = tempfile::tempdir().unwrap();
    let missing = tmp.path().join("new-data-repo");

    let mut config = config_for(&missing);
    config.git.repository_url = None;

    let workspace = Workspace::new(config);
    let err = workspace.ensure_checkout().await.unwrap_err();
    assert!(err.to_string().contains("repository_url"));
}

#[tokio::test]
async fn sync_reports_disabled() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let mut config = config_for(&repo);
    config.sync.enabled = Some(false);
    config.git.auto_push = false;

    let workspace = Workspace::new(config);
    let (changed, message) = workspace.sync().await.unwrap();
    assert!(!changed);
    assert!(message.contains("disabled"));
}

#[tokio::test]
async fn sync_reports_up_to_date() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let bare = tmp.path().join("bare.git");
    git(
        tmp.path(),
        &[
            "clone",
            "--bare",
            repo.to_str().unwrap(),
            bare.to_str().unwrap(),
        ],
    );
    git(&repo, &["remote", "add", "origin", bare.to_str().unwrap()]);

    let workspace = Workspace::new(config_for(&repo));
    let (changed, message) = workspace.sync().await.unwrap();
    assert!(!changed);
    assert!(message.contains("up to date"));
}

#[tokio::test]
async fn sync_pulls_new_commits() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let bare = tmp.path().join("bare.git");
    git(
        tmp.path(),
        &[
            "clone",
            "--bare",
            repo.to_str().unwrap(),
            bare.to_str().unwrap(),
        ],
    );
    git(&repo, &["remote", "add", "origin", bare.to_str().unwrap()]);

    // A second working copy pushes a commit to the bare remote.
    let second = tmp.path().join("second");
    git(
        tmp.path(),
        &[
            "clone",
            bare.to_str().unwrap(),
            second.to_str().unwrap(),
        ],
    );
    git(&second, &["config", "user.email", "test@test.invalid"]);
    git(&second, &["config", "user.name", "Test"]);
    std::fs::write(second.join("newfile.txt"), "hello").unwrap();
    git(&second, &["add", "newfile.txt"]);
    git(&second, &["commit", "-m", "New commit"]);
    git(&second, &["push", "origin", "main"]);

    let workspace = Workspace::new(config_for(&repo));
    let (changed, message) = workspace.sync().await.unwrap();
    assert!(changed, "sync should report new commits: {}", message);
    assert!(message.contains("new commits"));
    assert!(repo.join("newfile.txt").exists());
}

#[tokio::test]
async fn commit_uses_message_template() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let file = repo.join("inbox/test-transcript.txt");
    std::fs::write(&file, "Test transcript content").unwrap();

    let mut config = config_for(&repo);
    config.git.commit_message_template = "Add: {title}".to_string();
    let workspace = Workspace::new(config);

    let (ok, message) = workspace.commit(&file, "Test Meeting").await;
    assert!(ok, "commit failed: {}", message);

    let log = git_stdout(&repo, &["log", "--oneline", "-1"]);
    assert!(log.contains("Add: Test Meeting"));
}

#[tokio::test]
async fn commit_refuses_file_outside_workspace() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let outside = tmp.path().join("outside.txt");
    std::fs::write(&outside, "Outside content").unwrap();

    let workspace = Workspace::new(config_for(&repo));
    let (ok, message) = workspace.commit(&outside, "Outside").await;
    assert!(!ok);
    assert!(message.to_lowercase().contains("outside"));
}

#[tokio::test]
async fn hook_disabled_by_default() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let workspace = Workspace::new(config_for(&repo));
    let (ok, message) = workspace.run_hook_on_new_commits().await;
    assert!(!ok);
    assert!(message.contains("disabled"));
}

#[tokio::test]
async fn hook_runs_configured_command() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let mut config = config_for(&repo);
    config.hooks.on_new_commits.enabled = true;
    config.hooks.on_new_commits.command = Some("sh -c 'echo hook-ran > hook-output.txt'".into());
    let workspace = Workspace::new(config);

    let (ok, message) = workspace.run_hook_on_new_commits().await;
    assert!(ok, "hook failed: {}", message);
    assert!(message.contains("completed"));
    assert!(repo.join("hook-output.txt").exists());
}

#[tokio::test]
async fn hook_reports_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let mut config = config_for(&repo);
    config.hooks.on_new_commits.enabled = true;
    config.hooks.on_new_commits.command = Some("false".into());
    let workspace = Workspace::new(config);

    let (ok, message) = workspace.run_hook_on_new_commits().await;
    assert!(!ok);
    assert!(message.contains("failed"));
}

#[tokio::test]
async fn workflow_dispatch_disabled_by_default() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let workspace = Workspace::new(config_for(&repo));
    let (ok, message) = workspace.dispatch_workflow("test").await;
    assert!(!ok);
    assert!(message.contains("disabled"));
}

#[tokio::test]
async fn standalone_processing_runs_with_workspace_env() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let mut config = config_for(&repo);
    config.processing.standalone.enabled = true;
    config.processing.standalone.working_directory = tmp.path().to_string_lossy().into_owned();
    config.processing.standalone.command =
        "sh -c 'echo $WORKSPACE_DIR > workspace-dir.txt'".to_string();
    let workspace = Workspace::new(config);

    let (ok, message) = workspace.run_standalone_processing().await;
    assert!(ok, "standalone failed: {}", message);

    let recorded = std::fs::read_to_string(tmp.path().join("workspace-dir.txt")).unwrap();
    assert!(recorded.trim().ends_with("data-repo"));
}

#[tokio::test]
async fn standalone_processing_reports_failure_tail() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("data-repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_repo(&repo);

    let mut config = config_for(&repo);
    config.processing.standalone.enabled = true;
    config.processing.standalone.working_directory = tmp.path().to_string_lossy().into_owned();
    config.processing.standalone.command = "sh -c 'echo boom; exit 2'".to_string();
    let workspace = Workspace::new(config);

    let (ok, message) = workspace.run_standalone_processing().await;
    assert!(!ok);
    assert!(message.contains("exit 2"));
    assert!(message.contains("boom"));
}
