//! Post-delivery verification against the session transcript.
//!
//! A resume that "sent" is not necessarily a resume that landed. After
//! delivery we watch the transcript file for evidence of post-resume
//! activity: new bytes appended past the length snapshotted at delivery
//! time. The wait is a series of short bounded checks, never one blocking
//! sleep, so the daemon stays responsive to a stop signal mid-window.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::log::log_info;

/// Outcome of one verification window (transient, not persisted).
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub verified: bool,
    pub method: &'static str,
    pub checked_at: DateTime<Utc>,
}

/// Current transcript length; 0 if missing. Snapshot this at delivery time.
pub fn snapshot_len(transcript: &Path) -> u64 {
    std::fs::metadata(transcript).map(|m| m.len()).unwrap_or(0)
}

/// Poll the transcript every `poll` for up to `window`, looking for bytes
/// appended past `baseline_len`. A shrunk file (rotation/truncation) resets
/// the baseline; subsequent growth still counts as evidence.
///
/// Returns unverified if the window elapses, or early if `running` clears.
pub fn verify_resume_by_transcript(
    transcript: &Path,
    baseline_len: u64,
    window: Duration,
    poll: Duration,
    running: &AtomicBool,
) -> VerificationResult {
    let started = Instant::now();
    let mut baseline = baseline_len;

    while running.load(Ordering::Acquire) && started.elapsed() < window {
        let len = snapshot_len(transcript);
        if len > baseline {
            log_info("verify", "evidence", &format!(
                "Transcript grew {} -> {} bytes after {:?}",
                baseline, len, started.elapsed()
            ));
            return VerificationResult {
                verified: true,
                method: "transcript",
                checked_at: Utc::now(),
            };
        }
        if len < baseline {
            // Truncated or rotated; re-anchor so the next append counts
            baseline = len;
        }

        // Sleep in small increments to honor the running flag
        let mut remaining = poll.min(window.saturating_sub(started.elapsed()));
        while running.load(Ordering::Acquire) && remaining > Duration::ZERO {
            let step = remaining.min(Duration::from_millis(100));
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }

    VerificationResult {
        verified: false,
        method: "transcript",
        checked_at: Utc::now(),
    }
}
