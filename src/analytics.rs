//! SQLite analytics recorder.
//!
//! Appends one row per detection and per resume outcome so usage patterns
//! (when limits hit, how often resumes verify) can be mined later. Callers
//! treat every method as fire-and-forget: the coordinator logs failures and
//! moves on.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params};

use crate::queue::DetectionEvent;

/// Database handle for analytics operations
pub struct Analytics {
    conn: Connection,
}

impl Analytics {
    /// Open the analytics database at the configured path.
    pub fn open() -> Result<Self> {
        let path = crate::paths::events_db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open_at(&path)
    }

    /// Open the analytics database at a specific path (for testing)
    pub fn open_at(db_path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL so the CLI can read while the daemon writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                event_id TEXT,
                reset_time TEXT,
                outcome TEXT,
                data TEXT
            )",
            [],
        )?;

        Ok(Self { conn })
    }

    /// Record an observed rate limit at detection time.
    pub fn record_rate_limit(&self, event: &DetectionEvent) -> Result<()> {
        let data = serde_json::json!({
            "message": event.message,
            "timezone": event.timezone,
            "source_pid": event.source_pid,
            "detected_at": event.detected_at.to_rfc3339(),
        });
        self.insert("rate_limit", &event.id, &event.reset_time, None, &data.to_string())
    }

    /// Record a resume attempt's terminal outcome.
    /// `outcome` is one of: delivered, verified, unverified, failed.
    pub fn record_resume(&self, event: &DetectionEvent, outcome: &str) -> Result<()> {
        let data = serde_json::json!({
            "detected_at": event.detected_at.to_rfc3339(),
            "completed_at": event.completed_at.map(|t| t.to_rfc3339()),
        });
        self.insert("resume", &event.id, &event.reset_time, Some(outcome), &data.to_string())
    }

    fn insert(
        &self,
        kind: &str,
        event_id: &str,
        reset_time: &str,
        outcome: Option<&str>,
        data: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (timestamp, kind, event_id, reset_time, outcome, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                kind,
                event_id,
                reset_time,
                outcome,
                data
            ],
        )?;
        Ok(())
    }

    /// Count rows of one kind (CLI status display, tests).
    pub fn count(&self, kind: &str) -> Result<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
