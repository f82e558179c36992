//! Classification of the test tool's text stream.
//!
//! The tool interleaves three kinds of output:
//! - bare percentage lines (`"45%"`) for the stage currently running
//! - status announcements wrapped in `+++` markers
//! - free-form text
//!
//! Percentages are stage-local. `overall_percentage` maps them onto the whole
//! batch using the `(current/total)` counter found in the current status line.

use once_cell::sync::Lazy;
use regex::Regex;

static STATUS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+\+\+(.*)\+\+\+").expect("Invalid status regex"));
static POSITION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+)/(\d+)\)").expect("Invalid position regex"));

/// One classified line of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolLine {
    /// Stage-local percentage in [0, 100]
    Percentage(u32),
    /// Status announcement text (markers removed)
    Status(String),
    /// Anything else, terminator removed
    Log(String),
    /// Blank line, nothing to record
    Empty,
}

/// Strip exactly one line terminator (`\n` or `\r\n`).
fn strip_terminator(raw: &str) -> &str {
    let line = raw.strip_suffix('\n').unwrap_or(raw);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Classify a line, with or without its trailing newline.
///
/// A percentage is a 2-4 character body (after the terminator) made of digits
/// followed by `%`, i.e. the tool's `2 < len <= 5` trailer including `\n`.
pub fn classify(raw: &str) -> ToolLine {
    let line = strip_terminator(raw);

    if (2..=4).contains(&line.len()) && line.ends_with('%') {
        let digits = &line[..line.len() - 1];
        if digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(value) = digits.parse::<u32>() {
                if value <= 100 {
                    return ToolLine::Percentage(value);
                }
            }
        }
    }

    if let Some(caps) = STATUS_REGEX.captures(line) {
        return ToolLine::Status(caps[1].trim().to_string());
    }

    if line.trim().is_empty() {
        ToolLine::Empty
    } else {
        ToolLine::Log(line.to_string())
    }
}

/// Extract `(current, total)` from a status line such as `Running perf (2/4)`.
pub fn stage_position(status: &str) -> Option<(u32, u32)> {
    let caps = POSITION_REGEX.captures(status)?;
    let current = caps[1].parse::<u32>().ok()?;
    let total = caps[2].parse::<u32>().ok()?;
    if total == 0 || current == 0 || current > total {
        return None;
    }
    Some((current, total))
}

/// Combine a stage-local percentage with the position in the current status.
///
/// `absolute = (current-1)/total + stage_local/100/total`, floored at 1 once the
/// stage has started and capped at 100. Without a position in the status the
/// stage-local value is used as is.
pub fn overall_percentage(status: &str, stage_local: u32) -> u32 {
    let stage_local = stage_local.min(100);
    match stage_position(status) {
        Some((current, total)) => {
            // integer form of floor(((current-1) + local/100) / total * 100)
            let scaled = (u64::from(current - 1) * 100 + u64::from(stage_local)) / u64::from(total);
            (scaled as u32).max(1).min(100)
        }
        None => stage_local,
    }
}
