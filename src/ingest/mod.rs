/*
 * Meeting Pipeline - Ingest Daemon
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

pub mod transcript;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Local;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::types::WebhookPayload;
use crate::workspace::Workspace;
use transcript::{generate_filename, has_front_matter, inject_front_matter, unique_path};

/// 256 KiB covers very long meetings.
pub const MAX_TRANSCRIPT_SIZE: usize = 256 * 1024;
/// 1 MiB is plenty for a calendar file.
pub const MAX_CALENDAR_SIZE: usize = 1024 * 1024;

pub struct DaemonState {
    pub workspace: Arc<Workspace>,
}

type JsonResponse = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, message: impl Into<String>) -> JsonResponse {
    (
        status,
        Json(json!({ "status": "error", "message": message.into() })),
    )
}

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/webhook", post(webhook))
        .route("/calendar", post(calendar))
        .with_state(state)
}

/// Run the ingest daemon HTTP server. Startup sync is the binary's job so
/// that `--sync-once` can reuse it.
pub async fn serve(state: Arc<DaemonState>) -> Result<()> {
    let config = state.workspace.config().clone();
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("meetingnotesd listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .context("Ingest server failed")?;
    Ok(())
}

async fn health(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    let config = state.workspace.config();
    let standalone = &config.processing.standalone;
    let dispatch = &config.github.workflow_dispatch;
    let processing_mode = if standalone.enabled { "standalone" } else { "relay" };

    Json(json!({
        "status": "ok",
        "service": "meetingnotesd",
        "inbox_dir": state.workspace.inbox_path().to_string_lossy(),
        "repository": state.workspace.repo_path().to_string_lossy(),
        "port": config.server.port,
        "endpoints": {
            "health": "/",
            "transcript": "/webhook",
            "calendar": "/calendar",
        },
        "processing_mode": processing_mode,
        "sync": {
            "enabled": config.sync_enabled(),
            "poll_interval_seconds": config.sync.poll_interval_seconds,
        },
        "standalone": {
            "enabled": standalone.enabled,
            "command": if standalone.enabled { Some(standalone.command.clone()) } else { None },
        },
        "relay": {
            "workflow_dispatch_enabled": dispatch.enabled,
            "repo": if dispatch.enabled { dispatch.repo.clone() } else { None },
            "workflow": if dispatch.enabled { dispatch.workflow.clone() } else { None },
        },
    }))
}

fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false)
}

fn is_plain_text_content(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/plain"))
        .unwrap_or(false)
}

/// Validate a webhook body: JSON with non-empty `title` and `transcript`.
/// Returns the payload (typed optional fields) plus the raw strings, or a
/// ready-to-send 400.
fn validate_webhook(headers: &HeaderMap, body: &Bytes) -> Result<(WebhookPayload, String, String), JsonResponse> {
    if !is_json_content(headers) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Content-Type must be application/json",
        ));
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload"))?;

    let title = match value.get("title").and_then(Value::as_str) {
        Some(title) => title.to_string(),
        None => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Missing required field: 'title'",
            ));
        }
    };
    let transcript = match value.get("transcript").and_then(Value::as_str) {
        Some(transcript) => transcript.to_string(),
        None => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Missing required field: 'transcript'",
            ));
        }
    };
    if transcript.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Transcript cannot be empty",
        ));
    }

    let payload: WebhookPayload = serde_json::from_value(value).unwrap_or_default();
    Ok((payload, title, transcript))
}

async fn webhook(
    State(state): State<Arc<DaemonState>>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResponse {
    let (payload, title, mut transcript) = match validate_webhook(&headers, &body) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    // Inject front matter for bare transcripts; the appliance sends its
    // own header and is left untouched.
    if !has_front_matter(&transcript) {
        transcript = inject_front_matter(&payload, &transcript, Local::now());
    }

    let transcript_size = transcript.len();
    if transcript_size > MAX_TRANSCRIPT_SIZE {
        tracing::warn!(
            "Transcript too large ({} bytes) for title: {}",
            transcript_size,
            title
        );
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Transcript too large ({} bytes). Maximum size is {} bytes (256KB).",
                transcript_size, MAX_TRANSCRIPT_SIZE
            ),
        );
    }

    let workspace = state.workspace.clone();
    let config = workspace.config().clone();
    let _guard = workspace.lock.lock().await;

    if config.sync_enabled() && config.sync.before_accepting_webhooks {
        match workspace.sync().await {
            Ok((changed, message)) => {
                tracing::info!("Pre-webhook sync: {}", message);
                if changed {
                    let (ok, hook_msg) = workspace.run_hook_on_new_commits().await;
                    if !ok {
                        tracing::warn!("{}", hook_msg);
                    }
                }
            }
            Err(e) => tracing::warn!("Pre-webhook sync failed: {:#}", e),
        }
    }

    let inbox = workspace.inbox_path();
    if let Err(e) = std::fs::create_dir_all(&inbox) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", e),
        );
    }

    let filename = generate_filename(&title, Local::now());
    let filepath = unique_path(&inbox, &filename);
    let filename = filepath
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(filename);

    if let Err(e) = std::fs::write(&filepath, &transcript) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", e),
        );
    }
    tracing::info!("Successfully wrote transcript to: {}", filepath.display());

    let mut response = json!({
        "status": "success",
        "filename": filename,
        "message": "Transcript queued for processing",
    });

    if !config.git.auto_commit {
        response["git"] = json!({
            "enabled": false,
            "message": "Git operations disabled in config",
        });
        tracing::info!("Git operations disabled, skipping commit");
        return (StatusCode::OK, Json(response));
    }

    tracing::info!("Initiating git commit...");
    if config.sync_enabled() {
        if let Err(e) = workspace.ensure_checkout().await {
            tracing::warn!("ensure_checkout before commit failed: {:#}", e);
        }
    }

    let (commit_ok, commit_msg) = workspace.commit(&filepath, &title).await;
    response["git"] = json!({
        "enabled": true,
        "committed": commit_ok,
        "message": commit_msg,
    });

    if !commit_ok {
        // File was saved but git failed - still a success with a warning.
        response["warning"] = json!("File saved but git commit failed");
        tracing::warn!("Git commit failed but file was saved: {}", commit_msg);
        return (StatusCode::OK, Json(response));
    }

    if config.processing.standalone.enabled {
        if config.processing.standalone.run_async {
            workspace.run_standalone_processing_async();
            response["processing"] = json!({
                "mode": "standalone",
                "async": true,
                "message": "Processing started in background",
            });
        } else {
            let (proc_ok, proc_msg) = workspace.run_standalone_processing().await;
            response["processing"] = json!({
                "mode": "standalone",
                "async": false,
                "success": proc_ok,
                "message": proc_msg,
            });
            // Push inbox and processing results together.
            if proc_ok && config.git.auto_push {
                let (push_ok, push_msg) = workspace.push().await;
                response["git"]["pushed"] = json!(push_ok);
                response["git"]["push_message"] = json!(push_msg);
                if !push_ok {
                    tracing::warn!("Push after standalone processing failed: {}", push_msg);
                }
            }
        }
    } else if config.git.auto_push {
        // Relay mode: push immediately so the remote workflow can see the
        // file; a failed push skips the dispatch.
        let (push_ok, push_msg) = workspace.push().await;
        response["git"]["pushed"] = json!(push_ok);
        response["git"]["push_message"] = json!(push_msg);
        if !push_ok {
            tracing::warn!("Push failed: {}", push_msg);
            response["processing"] = json!({
                "mode": "relay",
                "workflow_dispatch": {
                    "enabled": config.github.workflow_dispatch.enabled,
                    "success": false,
                    "message": "Skipped: push failed",
                }
            });
        } else {
            let reason = format!("webhook:{}", filename);
            let (dispatch_ok, dispatch_msg) = workspace.dispatch_workflow(&reason).await;
            response["processing"] = json!({
                "mode": "relay",
                "workflow_dispatch": {
                    "enabled": config.github.workflow_dispatch.enabled,
                    "success": dispatch_ok,
                    "message": dispatch_msg,
                }
            });
        }
    } else {
        // Push disabled: dispatch anyway, the workflow may not find the file.
        let reason = format!("webhook:{}", filename);
        let (dispatch_ok, dispatch_msg) = workspace.dispatch_workflow(&reason).await;
        response["processing"] = json!({
            "mode": "relay",
            "workflow_dispatch": {
                "enabled": config.github.workflow_dispatch.enabled,
                "success": dispatch_ok,
                "message": dispatch_msg,
            }
        });
    }

    (StatusCode::OK, Json(response))
}

/// The two bodies /calendar accepts, resolved at the parse boundary.
enum CalendarBody {
    Json(String),
    PlainText(String),
}

fn parse_calendar_body(headers: &HeaderMap, body: &Bytes) -> Result<CalendarBody, JsonResponse> {
    if is_json_content(headers) {
        let value: Value = serde_json::from_slice(body)
            .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload"))?;
        let content = value
            .get("calendar")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                error_response(StatusCode::BAD_REQUEST, "Missing required field: 'calendar'")
            })?;
        Ok(CalendarBody::Json(content.to_string()))
    } else if is_plain_text_content(headers) {
        let content = String::from_utf8_lossy(body).into_owned();
        Ok(CalendarBody::PlainText(content))
    } else {
        Err(error_response(
            StatusCode::BAD_REQUEST,
            "Content-Type must be application/json or text/plain",
        ))
    }
}

async fn calendar(
    State(state): State<Arc<DaemonState>>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResponse {
    let content = match parse_calendar_body(&headers, &body) {
        Ok(CalendarBody::Json(content)) | Ok(CalendarBody::PlainText(content)) => content,
        Err(response) => return response,
    };

    if content.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Calendar content cannot be empty");
    }

    let content_size = content.len();
    if content_size > MAX_CALENDAR_SIZE {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Calendar too large ({} bytes). Maximum size is {} bytes.",
                content_size, MAX_CALENDAR_SIZE
            ),
        );
    }

    let workspace = state.workspace.clone();
    let config = workspace.config().clone();
    let _guard = workspace.lock.lock().await;

    if config.sync_enabled() && config.sync.before_accepting_webhooks {
        match workspace.sync().await {
            Ok((_, message)) => tracing::info!("Pre-calendar sync: {}", message),
            Err(e) => tracing::warn!("Pre-calendar sync failed: {:#}", e),
        }
    }

    let calendar_path = workspace.calendar_path();
    if let Err(e) = std::fs::write(&calendar_path, &content) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", e),
        );
    }
    tracing::info!(
        "Updated calendar: {} ({} bytes)",
        calendar_path.display(),
        content_size
    );

    let mut response = json!({
        "status": "success",
        "message": "Calendar updated",
        "size": content_size,
    });

    if config.git.auto_commit {
        if config.sync_enabled() {
            if let Err(e) = workspace.ensure_checkout().await {
                tracing::warn!("ensure_checkout before commit failed: {:#}", e);
            }
        }

        let (commit_ok, commit_msg) = workspace.commit(&calendar_path, "Calendar update").await;
        response["git"] = json!({
            "committed": commit_ok,
            "message": commit_msg,
        });

        if commit_ok && config.git.auto_push {
            let (push_ok, push_msg) = workspace.push().await;
            response["git"]["pushed"] = json!(push_ok);
            response["git"]["push_message"] = json!(push_msg);
        }
    }

    (StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers
    }

    fn text_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "text/plain; charset=utf-8".parse().unwrap(),
        );
        headers
    }

    #[test]
    fn webhook_requires_json_content_type() {
        let err = validate_webhook(&text_headers(), &Bytes::from_static(b"{}")).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn webhook_names_the_missing_field() {
        let body = Bytes::from_static(br#"{"transcript": "text"}"#);
        let err = validate_webhook(&json_headers(), &body).unwrap_err();
        assert!(err.1 .0["message"]
            .as_str()
            .unwrap()
            .contains("'title'"));

        let body = Bytes::from_static(br#"{"title": "t"}"#);
        let err = validate_webhook(&json_headers(), &body).unwrap_err();
        assert!(err.1 .0["message"]
            .as_str()
            .unwrap()
            .contains("'transcript'"));
    }

    #[test]
    fn webhook_rejects_empty_transcript() {
        let body = Bytes::from_static(br#"{"title": "t", "transcript": "   "}"#);
        let err = validate_webhook(&json_headers(), &body).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(err.1 .0["message"].as_str().unwrap().contains("empty"));
    }

    #[test]
    fn webhook_accepts_optional_timing_fields() {
        let body = Bytes::from_static(
            br#"{"title": "t", "transcript": "body", "duration": 60, "unknown_field": 1}"#,
        );
        let (payload, title, transcript) = validate_webhook(&json_headers(), &body).unwrap();
        assert_eq!(title, "t");
        assert_eq!(transcript, "body");
        assert_eq!(payload.duration, Some(60.0));
    }

    #[test]
    fn calendar_body_sum_type() {
        let body = Bytes::from_static(br#"{"calendar": "* Meeting <2026-01-22 Thu 10:00-11:00>"}"#);
        match parse_calendar_body(&json_headers(), &body).unwrap() {
            CalendarBody::Json(content) => assert!(content.starts_with("* Meeting")),
            CalendarBody::PlainText(_) => panic!("expected json body"),
        }

        let body = Bytes::from_static(b"* Meeting <2026-01-22 Thu>");
        match parse_calendar_body(&text_headers(), &body).unwrap() {
            CalendarBody::PlainText(content) => assert!(content.starts_with("* Meeting")),
            CalendarBody::Json(_) => panic!("expected plain text body"),
        }
    }

    #[test]
    fn calendar_rejects_other_content_types() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/xml".parse().unwrap());
        let err = parse_calendar_body(&headers, &Bytes::from_static(b"x")).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn calendar_requires_calendar_field_in_json() {
        let err =
            parse_calendar_body(&json_headers(), &Bytes::from_static(br#"{"other": 1}"#))
                .unwrap_err();
        assert!(err.1 .0["message"].as_str().unwrap().contains("'calendar'"));
    }

}
