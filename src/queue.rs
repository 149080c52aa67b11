//! Durable, file-backed queue of rate-limit detection events.
//!
//! The queue document is JSON, replaced atomically (write-to-temp, then
//! rename) so a reader can never observe a truncated write. A missing or
//! unparsable document is an empty queue, not an error: the detector
//! re-scans transcripts and will re-report anything that still matters,
//! so availability wins over strict durability here.
//!
//! Entries are never deleted. Terminal (completed/failed) entries stay
//! behind for audit and analytics, and still participate in dedup: the
//! detector re-scans transcripts, so the same reset_time resurfacing after
//! a completed resume must not re-queue the event.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::log::{log_info, log_warn};
use crate::stale;

/// Current queue document schema version.
const SCHEMA_VERSION: u32 = 2;

/// Per-process suffix so ids minted in the same millisecond stay unique.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Lifecycle status of a detection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Detected, not yet armed
    Pending,
    /// Countdown armed by the scheduler
    Waiting,
    /// Resume attempt in flight
    Active,
    /// Resume delivered (committed before verification finishes)
    Completed,
    /// Stale, or retries exhausted
    Failed,
}

impl EventStatus {
    /// Terminal entries are kept for audit but excluded from scheduling.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "pending",
            EventStatus::Waiting => "waiting",
            EventStatus::Active => "active",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One observed rate-limit signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: String,
    /// Raw advertised reset time. Parsing is deferred to the staleness guard
    /// so an unparsable value survives for audit instead of being rejected at ingest.
    pub reset_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pid: Option<u32>,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Detector ingest payload. Field names match what the detector emits,
/// hence `claude_pid` rather than `source_pid`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Detection {
    pub reset_time: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub claude_pid: Option<u32>,
}

/// The persisted queue document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub version: u32,
    pub queue: Vec<DetectionEvent>,
    #[serde(default)]
    pub last_hook_run: Option<DateTime<Utc>>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            queue: Vec::new(),
            last_hook_run: None,
        }
    }
}

/// File-backed event queue. Exclusively owns persisted detection state.
pub struct EventQueue {
    path: PathBuf,
    state: QueueState,
}

impl EventQueue {
    /// Open the queue at the configured path.
    pub fn open() -> Self {
        Self::open_at(crate::paths::queue_path())
    }

    /// Open the queue at a specific path (for testing).
    pub fn open_at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_state(&path);
        Self { path, state }
    }

    /// Re-read the backing document so entries persisted by another process
    /// (the detect CLI runs alongside the daemon) become visible. The armed
    /// countdown is recomputed from this state, so a fresher detection with
    /// an earlier reset takes over on the next pass.
    pub fn reload(&mut self) {
        self.state = read_state(&self.path);
    }

    /// All entries, insertion order.
    pub fn entries(&self) -> &[DetectionEvent] {
        &self.state.queue
    }

    /// Timestamp of the last detector hook run, if any.
    pub fn last_hook_run(&self) -> Option<DateTime<Utc>> {
        self.state.last_hook_run
    }

    /// Insert a new detection unless any entry with the same reset_time
    /// already exists, terminal or not. Returns the new entry's id, or None
    /// for the dedup no-op.
    ///
    /// Redundant detector calls are expected (transcripts get re-scanned),
    /// so the duplicate case is not an error.
    pub fn add_detection(&mut self, detection: &Detection) -> Result<Option<String>> {
        let duplicate = self
            .state
            .queue
            .iter()
            .any(|e| e.reset_time == detection.reset_time);
        if duplicate {
            log_info("queue", "add.duplicate", &format!(
                "Detection for reset_time={} already queued", detection.reset_time
            ));
            self.state.last_hook_run = Some(Utc::now());
            self.persist()?;
            return Ok(None);
        }

        let id = mint_id();
        let event = DetectionEvent {
            id: id.clone(),
            reset_time: detection.reset_time.clone(),
            timezone: detection.timezone.clone(),
            message: detection.message.clone(),
            detected_at: Utc::now(),
            source_pid: detection.claude_pid,
            status: EventStatus::Pending,
            completed_at: None,
        };
        self.state.queue.push(event);
        self.state.last_hook_run = Some(Utc::now());
        self.persist()?;
        Ok(Some(id))
    }

    /// Entry with status pending or waiting whose reset_time parses earliest.
    /// Unparsable reset times sort last; the scheduler fails them as stale on selection.
    pub fn get_next_pending(&self) -> Option<DetectionEvent> {
        self.state
            .queue
            .iter()
            .filter(|e| matches!(e.status, EventStatus::Pending | EventStatus::Waiting))
            .min_by_key(|e| match stale::parse_reset_time(&e.reset_time) {
                Some(t) => (0u8, t.timestamp_millis()),
                None => (1u8, i64::MAX),
            })
            .cloned()
    }

    /// Transition an entry's status. Stamps completed_at on completion.
    /// Returns false if the id is unknown.
    pub fn update_entry_status(&mut self, id: &str, status: EventStatus) -> Result<bool> {
        let Some(entry) = self.state.queue.iter_mut().find(|e| e.id == id) else {
            log_warn("queue", "update.unknown_id", &format!("No entry with id={}", id));
            return Ok(false);
        };
        entry.status = status;
        if status == EventStatus::Completed {
            entry.completed_at = Some(Utc::now());
        }
        self.persist()?;
        Ok(true)
    }

    /// Mark live entries whose reset_time is at least `threshold` in the past
    /// (or unparsable) as failed. Returns how many were reset.
    pub fn reset_stale_entries(&mut self, threshold: Duration) -> Result<usize> {
        let mut count = 0;
        for entry in &mut self.state.queue {
            if !entry.status.is_terminal() && stale::is_stale(&entry.reset_time, threshold) {
                entry.status = EventStatus::Failed;
                count += 1;
            }
        }
        if count > 0 {
            self.persist()?;
        }
        Ok(count)
    }

    /// Read-modify-write with an atomic replace. The document is re-read
    /// first and entries another process persisted since our last load are
    /// merged back in by id, so two writers cannot erase each other's
    /// detections; the temp+rename step keeps readers from ever observing
    /// a truncated document.
    fn persist(&mut self) -> Result<()> {
        let disk = read_state(&self.path);
        for entry in disk.queue {
            if !self.state.queue.iter().any(|e| e.id == entry.id) {
                self.state.queue.push(entry);
            }
        }
        if disk.last_hook_run > self.state.last_hook_run {
            self.state.last_hook_run = disk.last_hook_run;
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Load queue state at open time, applying crash recovery: an entry left
/// active was mid-attempt when the daemon died, and the single-flight flag
/// did not survive, so re-deliver it. Duplicate delivery to an
/// already-resumed session is a benign no-op.
fn load_state(path: &Path) -> QueueState {
    let mut state = read_state(path);
    for entry in &mut state.queue {
        if entry.status == EventStatus::Active {
            log_info("queue", "load.demote_active", &format!(
                "Entry {} was active at shutdown, demoting to pending", entry.id
            ));
            entry.status = EventStatus::Pending;
        }
    }
    state
}

/// Read the document as-is. Missing, corrupt, or partially-written
/// documents all yield an empty queue; the state rebuilds on the next write.
fn read_state(path: &Path) -> QueueState {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return QueueState::default(),
    };

    let value: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(_) => {
            log_warn("queue", "load.corrupt", &format!(
                "Unparsable queue document at {}, starting empty", path.display()
            ));
            return QueueState::default();
        }
    };

    let mut state = if value.get("queue").map(Value::is_array).unwrap_or(false) {
        match serde_json::from_value::<QueueState>(value) {
            Ok(s) => s,
            Err(e) => {
                log_warn("queue", "load.schema", &format!(
                    "Queue document failed schema parse ({}), starting empty", e
                ));
                QueueState::default()
            }
        }
    } else {
        migrate_legacy(&value)
    };

    state.version = SCHEMA_VERSION;
    state
}

/// Pure migration from the legacy single-slot document:
/// `{detected, reset_time, timezone, message, last_detected, claude_pid}`.
/// A legacy doc with `detected=false` or no reset_time migrates to an empty queue.
fn migrate_legacy(value: &Value) -> QueueState {
    let detected = value.get("detected").and_then(Value::as_bool).unwrap_or(false);
    let reset_time = value.get("reset_time").and_then(Value::as_str);

    let (Some(reset_time), true) = (reset_time, detected) else {
        return QueueState::default();
    };

    let detected_at = value
        .get("last_detected")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let event = DetectionEvent {
        id: mint_id(),
        reset_time: reset_time.to_string(),
        timezone: value.get("timezone").and_then(Value::as_str).map(String::from),
        message: value.get("message").and_then(Value::as_str).map(String::from),
        detected_at,
        source_pid: value
            .get("claude_pid")
            .and_then(Value::as_u64)
            .map(|p| p as u32),
        status: EventStatus::Pending,
        completed_at: None,
    };

    log_info("queue", "load.migrated", "Migrated legacy single-slot document to queue schema");

    QueueState {
        version: SCHEMA_VERSION,
        queue: vec![event],
        last_hook_run: None,
    }
}

/// Millisecond timestamp plus per-process counter.
fn mint_id() -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", Utc::now().timestamp_millis(), counter)
}
