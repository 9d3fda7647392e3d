/*
 * Meeting Pipeline - Transcript Post-Processing
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

use regex::Regex;

/// Gap between consecutive segments above which a paragraph break is
/// inserted, in seconds.
const SEGMENT_GAP_SECONDS: f64 = 2.0;

/// Runs of identical lines at or above this length are treated as whisper
/// hallucinations and removed.
const HALLUCINATION_RUN_LEN: usize = 3;

const SPEAKER_TURN_MARKER: &str = "[SPEAKER_TURN]";
const SPEAKER_TURN_SHORT: &str = "[S]";

fn timestamp_re() -> Regex {
    // Lines look like: [00:01:02.345 --> 00:01:04.500]   text
    Regex::new(
        r"^\[(\d{2}):(\d{2}):(\d{2})\.(\d{3}) --> (\d{2}):(\d{2}):(\d{2})\.(\d{3})\]\s*(.*)$",
    )
    .expect("timestamp regex")
}

/// A transcript line split into its optional timing and its text.
struct Segment<'a> {
    start: Option<f64>,
    end: Option<f64>,
    text: &'a str,
}

fn parse_segment<'a>(re: &Regex, line: &'a str) -> Segment<'a> {
    if let Some(caps) = re.captures(line) {
        let secs = |h: usize, m: usize, s: usize, ms: usize| -> Option<f64> {
            let h: f64 = caps.get(h)?.as_str().parse().ok()?;
            let m: f64 = caps.get(m)?.as_str().parse().ok()?;
            let s: f64 = caps.get(s)?.as_str().parse().ok()?;
            let ms: f64 = caps.get(ms)?.as_str().parse().ok()?;
            Some(h * 3600.0 + m * 60.0 + s + ms / 1000.0)
        };
        if let Some(text) = caps.get(9) {
            return Segment {
                start: secs(1, 2, 3, 4),
                end: secs(5, 6, 7, 8),
                text: text.as_str(),
            };
        }
    }
    Segment {
        start: None,
        end: None,
        text: line,
    }
}

/// Clean raw STT output: drop hallucinated repetition, then fold
/// timestamps into plain prose.
pub fn clean_transcript(raw: &str) -> String {
    fold_timestamps(&filter_hallucinations(raw))
}

/// Remove hallucinated repetition from raw STT output.
///
/// Consecutive lines are grouped by their normalized text (timestamp
/// prefix stripped, whitespace trimmed). A run of identical non-empty
/// text of length >= 3 is dropped entirely; shorter runs are legitimate
/// conversation ("yeah" / "yeah") and kept verbatim. Blank lines pass
/// through and never count toward a run.
pub fn filter_hallucinations(raw: &str) -> String {
    let re = timestamp_re();
    let mut out: Vec<&str> = Vec::new();
    let mut run: Vec<&str> = Vec::new();
    let mut run_key = String::new();

    fn flush<'a>(run: &mut Vec<&'a str>, key: &str, out: &mut Vec<&'a str>) {
        if run.len() >= HALLUCINATION_RUN_LEN {
            tracing::warn!(
                "Dropping hallucinated run: {:?} repeated {} times",
                key,
                run.len()
            );
        } else {
            out.append(run);
        }
        run.clear();
    }

    for line in raw.lines() {
        let normalized = parse_segment(&re, line).text.trim().to_string();
        if normalized.is_empty() {
            flush(&mut run, &run_key, &mut out);
            run_key.clear();
            out.push(line);
            continue;
        }
        if normalized == run_key {
            run.push(line);
        } else {
            flush(&mut run, &run_key, &mut out);
            run_key = normalized;
            run.push(line);
        }
    }
    flush(&mut run, &run_key, &mut out);

    out.join("\n")
}

/// Fold timestamped segments into plain text.
///
/// The `[start --> end]` prefix is dropped, `[SPEAKER_TURN]` markers are
/// shortened to `[S]`, a blank line is inserted where the gap between
/// consecutive segments exceeds 2s, and runs of 3+ blank lines collapse
/// to 2.
pub fn fold_timestamps(input: &str) -> String {
    let re = timestamp_re();
    let mut lines: Vec<String> = Vec::new();
    let mut prev_end: Option<f64> = None;

    for line in input.lines() {
        let segment = parse_segment(&re, line);
        if let (Some(prev), Some(start)) = (prev_end, segment.start) {
            if start - prev > SEGMENT_GAP_SECONDS {
                lines.push(String::new());
            }
        }
        if segment.end.is_some() {
            prev_end = segment.end;
        }
        lines.push(segment.text.replace(SPEAKER_TURN_MARKER, SPEAKER_TURN_SHORT));
    }

    let mut out: Vec<String> = Vec::new();
    let mut blanks = 0usize;
    for line in lines {
        if line.trim().is_empty() {
            blanks += 1;
            if blanks <= 2 {
                out.push(String::new());
            }
        } else {
            blanks = 0;
            out.push(line);
        }
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(i: usize, text: &str) -> String {
        let start = i as f64;
        let end = start + 0.9;
        format!(
            "[00:00:{:02}.000 --> 00:00:{:02}.{:03}]   {}",
            start as usize,
            end as usize,
            ((end.fract()) * 1000.0).round() as usize,
            text
        )
    }

    #[test]
    fn run_of_three_dropped_run_of_two_kept() {
        // S4: [A],[A],[A],[B],[C],[C] -> [B],[C],[C]
        let input = [
            ts(0, "[A]"),
            ts(1, "[A]"),
            ts(2, "[A]"),
            ts(3, "[B]"),
            ts(4, "[C]"),
            ts(5, "[C]"),
        ]
        .join("\n");

        let filtered = filter_hallucinations(&input);
        let lines: Vec<&str> = filtered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("[B]"));
        assert!(lines[1].ends_with("[C]"));
        assert!(lines[2].ends_with("[C]"));
    }

    #[test]
    fn run_boundary_exactly_two_is_kept() {
        let input = [ts(0, "yeah"), ts(1, "yeah")].join("\n");
        let filtered = filter_hallucinations(&input);
        assert_eq!(filtered.lines().count(), 2);
    }

    #[test]
    fn run_boundary_exactly_three_is_dropped() {
        let input = [ts(0, "yeah"), ts(1, "yeah"), ts(2, "yeah")].join("\n");
        let filtered = filter_hallucinations(&input);
        assert_eq!(filtered.lines().count(), 0);
    }

    #[test]
    fn long_run_dropped_entirely() {
        let mut parts: Vec<String> = (0..10).map(|i| ts(i, "Thanks for watching!")).collect();
        parts.push(ts(10, "Real content"));
        let filtered = filter_hallucinations(&parts.join("\n"));
        assert_eq!(filtered.lines().count(), 1);
        assert!(filtered.contains("Real content"));
    }

    #[test]
    fn blank_lines_never_count_toward_a_run() {
        // Two identical lines separated by a blank stay two separate
        // groups, each below the drop threshold.
        let input = [ts(0, "hello"), String::new(), ts(1, "hello"), ts(2, "hello")].join("\n");
        let filtered = filter_hallucinations(&input);
        assert_eq!(filtered.lines().filter(|l| l.contains("hello")).count(), 3);
    }

    #[test]
    fn normalization_ignores_timestamps_and_whitespace() {
        let input = [
            "[00:00:01.000 --> 00:00:02.000]   same text",
            "[00:00:05.000 --> 00:00:06.000] same text  ",
            "[00:00:09.000 --> 00:00:10.000]    same text",
        ]
        .join("\n");
        assert_eq!(filter_hallucinations(&input).lines().count(), 0);
    }

    #[test]
    fn folding_strips_timestamps_and_shortens_markers() {
        let input = ts(0, "[SPEAKER_TURN] Hello there");
        let folded = fold_timestamps(&input);
        assert_eq!(folded, "[S] Hello there");
    }

    #[test]
    fn folding_inserts_break_on_gap() {
        let input = [
            "[00:00:01.000 --> 00:00:02.000]   before the pause",
            "[00:00:07.000 --> 00:00:08.000]   after the pause",
        ]
        .join("\n");
        let folded = fold_timestamps(&input);
        assert_eq!(folded, "before the pause\n\nafter the pause");
    }

    #[test]
    fn folding_no_break_within_gap_threshold() {
        let input = [
            "[00:00:01.000 --> 00:00:02.000]   first",
            "[00:00:03.500 --> 00:00:04.000]   second",
        ]
        .join("\n");
        assert_eq!(fold_timestamps(&input), "first\nsecond");
    }

    #[test]
    fn folding_collapses_blank_runs() {
        let input = "one\n\n\n\n\ntwo";
        assert_eq!(fold_timestamps(input), "one\n\ntwo");
    }

    #[test]
    fn folding_passes_plain_lines_through() {
        assert_eq!(fold_timestamps("no timing here"), "no timing here");
    }

    #[test]
    fn clean_transcript_end_to_end() {
        let input = [
            ts(0, "Thank you."),
            ts(1, "Thank you."),
            ts(2, "Thank you."),
            ts(3, "We should ship."),
            "[00:00:10.000 --> 00:00:11.000]   [SPEAKER_TURN] Agreed.".to_string(),
        ]
        .join("\n");
        let cleaned = clean_transcript(&input);
        assert_eq!(cleaned, "We should ship.\n\n[S] Agreed.");
    }
}
