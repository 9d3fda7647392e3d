/*
 * Meeting Pipeline - Calendar Consumption
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

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use std::path::Path;

/// Nothing ever starts more than 5 minutes early.
const EARLY_WINDOW_SECS: i64 = 300;
/// More than 25 minutes past the start, assume a spontaneous meeting.
const LATE_WINDOW_SECS: i64 = 1500;

/// One top-level calendar entry:
/// `* Title <YYYY-MM-DD Day [HH:MM-HH:MM]>` followed by a property block.
/// Entries without times are all-day.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntry {
    pub title: String,
    pub date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub participants: Vec<String>,
    pub meeting_links: Vec<String>,
}

fn heading_re() -> Regex {
    Regex::new(r"^\* (.+?) <(\d{4}-\d{2}-\d{2}) \w{3}(?: (\d{2}:\d{2})-(\d{2}:\d{2}))?>")
        .expect("calendar heading regex")
}

fn participants_re() -> Regex {
    Regex::new(r":PARTICIPANTS:\s*(.+)").expect("participants regex")
}

fn email_re() -> Regex {
    Regex::new(r"\s*<[^>]+>\s*").expect("email regex")
}

fn link_re() -> Regex {
    Regex::new(r"\[\[(https://[^\]]+)\]\[[^\]]*\]\]").expect("link regex")
}

/// Parse a calendar.org document into entries. The parser is tolerant:
/// malformed headings are skipped, times and participants are optional.
pub fn parse_calendar_org(content: &str) -> Vec<CalendarEntry> {
    let heading = heading_re();
    let participants = participants_re();
    let email = email_re();
    let link = link_re();

    let mut entries: Vec<CalendarEntry> = Vec::new();

    for line in content.lines() {
        if let Some(caps) = heading.captures(line) {
            let date = match NaiveDate::parse_from_str(&caps[2], "%Y-%m-%d") {
                Ok(date) => date,
                Err(_) => continue,
            };
            let parse_time =
                |idx: usize| -> Option<NaiveTime> {
                    caps.get(idx)
                        .and_then(|m| NaiveTime::parse_from_str(m.as_str(), "%H:%M").ok())
                };
            entries.push(CalendarEntry {
                title: caps[1].trim().to_string(),
                date,
                start_time: parse_time(3),
                end_time: parse_time(4),
                participants: Vec::new(),
                meeting_links: Vec::new(),
            });
            continue;
        }

        // Body lines attach to the most recent entry.
        let Some(entry) = entries.last_mut() else {
            continue;
        };
        if let Some(caps) = participants.captures(line) {
            for raw in caps[1].split(',') {
                let name = email.replace_all(raw, "").trim().to_string();
                if !name.is_empty() {
                    entry.participants.push(name);
                }
            }
        }
        for caps in link.captures_iter(line) {
            entry.meeting_links.push(caps[1].to_string());
        }
    }

    entries
}

/// Find the best matching calendar entry title for `now`: today's entry
/// whose start is at most 5 minutes ahead or 25 minutes behind, closest
/// start wins.
pub fn best_title_for(entries: &[CalendarEntry], now: NaiveDateTime) -> Option<String> {
    let today = now.date();
    let mut best: Option<(i64, &CalendarEntry)> = None;

    for entry in entries {
        if entry.date != today {
            continue;
        }
        let Some(start_time) = entry.start_time else {
            continue;
        };
        let start = entry.date.and_time(start_time);
        let delta = (now - start).num_seconds();
        if delta < -EARLY_WINDOW_SECS || delta > LATE_WINDOW_SECS {
            continue;
        }
        let abs_delta = delta.abs();
        if best.map(|(d, _)| abs_delta < d).unwrap_or(true) {
            best = Some((abs_delta, entry));
        }
    }

    best.map(|(_, entry)| entry.title.clone())
}

/// Look up the current meeting title from a calendar.org file. Returns
/// None when the file is absent or unreadable.
pub fn lookup_calendar_title(path: &Path, now: NaiveDateTime) -> Option<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!("Cannot read calendar file {}: {}", path.display(), e);
            return None;
        }
    };
    best_title_for(&parse_calendar_org(&content), now)
}
