/*
 * Meeting Pipeline - Transcript Intake Helpers
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

use chrono::{DateTime, Duration, Local};
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::types::WebhookPayload;

const MAX_SLUG_LEN: usize = 50;

/// Sanitize a meeting title into a URL-safe slug: lowercase, whitespace
/// to hyphens, everything outside [a-z0-9_-] removed, hyphen runs
/// collapsed, trimmed, capped at 50 chars, `untitled` when nothing
/// survives. Idempotent.
pub fn sanitize_slug(title: &str) -> String {
    let whitespace = Regex::new(r"\s+").expect("whitespace regex");
    let invalid = Regex::new(r"[^a-z0-9_-]").expect("invalid-chars regex");
    let hyphens = Regex::new(r"-+").expect("hyphen-run regex");

    let mut slug = title.to_lowercase().trim().to_string();
    slug = whitespace.replace_all(&slug, "-").into_owned();
    slug = invalid.replace_all(&slug, "").into_owned();
    slug = hyphens.replace_all(&slug, "-").into_owned();
    slug = slug.trim_matches('-').to_string();

    if slug.len() > MAX_SLUG_LEN {
        let mut cut = MAX_SLUG_LEN;
        while !slug.is_char_boundary(cut) {
            cut -= 1;
        }
        slug.truncate(cut);
        slug = slug.trim_end_matches('-').to_string();
    }

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Inbox filename: `YYYYMMDD-HHMMSS-<slug>.txt`.
pub fn generate_filename(title: &str, now: DateTime<Local>) -> String {
    format!(
        "{}-{}.txt",
        now.format("%Y%m%d-%H%M%S"),
        sanitize_slug(title)
    )
}

/// Resolve a unique path for `filename` inside `dir`, appending a counter
/// before the extension when two webhooks collide on the same second and
/// slug.
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (base, ext) = match filename.rsplit_once('.') {
        Some((base, ext)) => (base.to_string(), format!(".{}", ext)),
        None => (filename.to_string(), String::new()),
    };
    let mut counter = 1;
    loop {
        let candidate = dir.join(format!("{}-{}{}", base, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// A transcript already carries a header when its first non-whitespace
/// characters are `---`.
pub fn has_front_matter(transcript: &str) -> bool {
    transcript.trim_start().starts_with("---")
}

/// Synthesize a key/value front-matter header for a transcript that
/// arrived bare.
///
/// Timing preference: explicit payload fields, then estimates derived
/// from `duration`, then the receipt time as `meeting_end`. The source
/// defaults to `macwhisper` (the historical bare-transcript producer).
pub fn inject_front_matter(
    payload: &WebhookPayload,
    transcript: &str,
    now: DateTime<Local>,
) -> String {
    let mut fields: Vec<(&str, String)> = Vec::new();

    let mut meeting_start = payload.meeting_start.clone();
    let mut meeting_end = payload.meeting_end.clone();

    if let Some(duration) = payload.duration {
        let duration = Duration::seconds(duration as i64);
        if meeting_start.is_none() && meeting_end.is_none() {
            meeting_start = Some((now - duration).to_rfc3339());
            meeting_end = Some(now.to_rfc3339());
        } else if meeting_end.is_none() {
            if let Some(start) = meeting_start
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                meeting_end = Some((start + duration).to_rfc3339());
            }
        }
    }

    if meeting_start.is_none() && meeting_end.is_none() {
        meeting_end = Some(now.to_rfc3339());
    }

    if let Some(start) = meeting_start {
        fields.push(("meeting_start", start));
    }
    if let Some(end) = meeting_end {
        fields.push(("meeting_end", end));
    }
    fields.push((
        "recording_source",
        payload
            .recording_source
            .clone()
            .unwrap_or_else(|| "macwhisper".to_string()),
    ));
    fields.push(("received_at", now.to_rfc3339()));

    let mut header = String::from("---\n");
    for (key, value) in fields {
        header.push_str(&format!("{}: {}\n", key, value));
    }
    header.push_str("---\n\n");
    header + transcript
}
