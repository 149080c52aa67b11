//! Dashboard broadcast collaborator.
//!
//! The coordinator announces every state transition here. The "dashboard"
//! side is whatever reads the status file (CLI `autoresume status`, an
//! external viewer); it has no write path back into the core. Writes use
//! the same atomic temp+rename replace as the queue so readers never see
//! a torn document.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::log::log_warn;
use crate::queue::DetectionEvent;

/// Latest broadcast, persisted for display.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusDoc {
    /// Coordinator state name (idle, attempting, delivered, verifying, ...)
    pub state: String,
    pub updated_at: Option<DateTime<Utc>>,
    /// Summary of the event the state refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
    /// Most recent discrete broadcast (detection, delivery, verification...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<BroadcastEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub kind: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Writes state transitions to the status file. Fire-and-forget.
pub struct StatusBroadcaster {
    path: PathBuf,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::at(crate::paths::status_path())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Announce a coordinator state transition.
    pub fn broadcast_status(&self, state: &str, event: Option<&DetectionEvent>) {
        let mut doc = self.read();
        doc.state = state.to_string();
        doc.updated_at = Some(Utc::now());
        doc.event_id = event.map(|e| e.id.clone());
        doc.reset_time = event.map(|e| e.reset_time.clone());
        self.write(&doc);
    }

    /// Announce a discrete event (detection arrived, delivery outcome, ...).
    pub fn broadcast_event(&self, kind: &str, payload: Value) {
        let mut doc = self.read();
        doc.last_event = Some(BroadcastEvent {
            kind: kind.to_string(),
            payload,
            at: Utc::now(),
        });
        self.write(&doc);
    }

    /// Current document; missing or torn files read as default.
    pub fn read(&self) -> StatusDoc {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn write(&self, doc: &StatusDoc) {
        if let Err(e) = self.try_write(doc) {
            // Display-only collaborator: never let it fail the coordinator
            log_warn("status", "write.fail", &format!("{}", e));
        }
    }

    fn try_write(&self, doc: &StatusDoc) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventStatus;
    use tempfile::TempDir;

    fn event() -> DetectionEvent {
        DetectionEvent {
            id: "abc-1".to_string(),
            reset_time: "2026-08-27T18:00:00Z".to_string(),
            timezone: None,
            message: None,
            detected_at: Utc::now(),
            source_pid: None,
            status: EventStatus::Active,
            completed_at: None,
        }
    }

    #[test]
    fn status_roundtrips_through_file() {
        let dir = TempDir::new().unwrap();
        let b = StatusBroadcaster::at(dir.path().join("status.json"));

        b.broadcast_status("attempting", Some(&event()));
        let doc = b.read();
        assert_eq!(doc.state, "attempting");
        assert_eq!(doc.event_id.as_deref(), Some("abc-1"));
        assert!(doc.updated_at.is_some());
    }

    #[test]
    fn event_broadcast_preserves_state() {
        let dir = TempDir::new().unwrap();
        let b = StatusBroadcaster::at(dir.path().join("status.json"));

        b.broadcast_status("verifying", Some(&event()));
        b.broadcast_event("delivery", serde_json::json!({"tier": "multiplexer"}));

        let doc = b.read();
        assert_eq!(doc.state, "verifying");
        let last = doc.last_event.unwrap();
        assert_eq!(last.kind, "delivery");
        assert_eq!(last.payload["tier"], "multiplexer");
    }

    #[test]
    fn missing_file_reads_default() {
        let dir = TempDir::new().unwrap();
        let b = StatusBroadcaster::at(dir.path().join("status.json"));
        let doc = b.read();
        assert_eq!(doc.state, "");
        assert!(doc.last_event.is_none());
    }
}
