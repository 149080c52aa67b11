//! Staleness classification for advertised reset times.
//!
//! Detectors re-scan persisted transcripts and can resurface a rate-limit
//! message whose reset already happened hours ago. Without this filter the
//! scheduler would re-arm a countdown for an event that no longer matters
//! and produce spurious resume attempts indefinitely.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

/// Clock forms seen in rate-limit banners: "3am", "11:30pm", "14:00".
fn clock_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\s*$").unwrap()
    })
}

/// Parse an advertised reset time.
///
/// Accepted forms, in order:
/// - RFC 3339 / ISO 8601 (`2026-08-27T18:00:00Z`, with offset)
/// - naive `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD HH:MM:SS` (taken as UTC)
/// - unix epoch seconds or milliseconds
/// - bare clock (`3am`, `11:30pm`, `14:00`), resolved to its next local
///   occurrence: today if still ahead, otherwise tomorrow
pub fn parse_reset_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(n) = raw.parse::<i64>() {
        // 13+ digit values are milliseconds, shorter ones seconds
        let t = if n.abs() >= 100_000_000_000 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        };
        return t;
    }

    parse_clock_form(raw, Local::now())
}

/// Resolve a bare clock form against a reference local time.
fn parse_clock_form(raw: &str, now: DateTime<Local>) -> Option<DateTime<Utc>> {
    let caps = clock_regex().captures(raw)?;

    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps
        .get(2)
        .map(|m| m.as_str().parse().ok())
        .unwrap_or(Some(0))?;
    let meridiem = caps.get(3).map(|m| m.as_str().to_ascii_lowercase());

    match meridiem.as_deref() {
        Some("am") => {
            if hour == 12 {
                hour = 0;
            }
        }
        Some("pm") => {
            if hour != 12 {
                hour += 12;
            }
        }
        _ => {}
    }
    if hour > 23 || minute > 59 {
        return None;
    }

    let today = now.date_naive().and_hms_opt(hour, minute, 0)?;
    // earliest() is None only inside a DST gap; treat that as unparsable
    let candidate = Local.from_local_datetime(&today).earliest()?;

    let resolved = if candidate > now {
        candidate
    } else {
        candidate + chrono::Duration::days(1)
    };
    Some(resolved.with_timezone(&Utc))
}

/// Classify an advertised reset time as stale.
///
/// Unparsable or missing => stale. At least `threshold` in the past => stale
/// (the boundary itself counts). Future, or in the past by strictly less
/// than `threshold` => actionable.
pub fn is_stale(reset_time: &str, threshold: Duration) -> bool {
    match parse_reset_time(reset_time) {
        Some(t) => is_stale_at(t, Utc::now(), threshold),
        None => true,
    }
}

/// Staleness rule against an explicit "now" (testable core).
fn is_stale_at(reset_time: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let age_ms = now.signed_duration_since(reset_time).num_milliseconds();
    // Clamp instead of truncating: a huge threshold must mean "never stale",
    // not wrap negative and mark everything stale
    let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
    age_ms >= threshold_ms
}
