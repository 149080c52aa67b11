//! Simple file-based logging for autoresume
//!
//! Logs to <base_dir>/logs/autoresume.log in JSONL format:
//! ISO 8601 timestamps, level, subsystem, event, message.
//! The daemon shares a terminal-adjacent world with the watched session,
//! so nothing is ever written to stdout/stderr from here.

use chrono::Utc;
use serde::Serialize;
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;

/// Log entry structure for safe JSON serialization
#[derive(Serialize)]
struct LogEntry<'a> {
    ts: String,
    level: String,
    subsystem: &'a str,
    event: &'a str,
    msg: &'a str,
}

/// Log a message to the autoresume log file
pub fn log(level: &str, subsystem: &str, event: &str, message: &str) {
    // Logging must never panic; skip if config was not initialized (unit tests).
    let Some(config) = crate::config::Config::try_get() else {
        return;
    };
    let path = config.base_dir.join("logs").join("autoresume.log");

    // Ensure directory exists
    if let Some(parent) = path.parent() {
        let _ = create_dir_all(parent);
    }

    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let entry = LogEntry {
        ts: timestamp,
        level: level.to_uppercase(),
        subsystem,
        event,
        msg: message,
    };

    // Serialize with serde_json for proper escaping
    let log_line = match serde_json::to_string(&entry) {
        Ok(line) => line,
        Err(_) => return, // Silently fail on serialization error
    };

    // Append to file
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        let _ = writeln!(file, "{}", log_line);
    }
}

/// Log info message
pub fn log_info(subsystem: &str, event: &str, message: &str) {
    log("info", subsystem, event, message);
}

/// Log warning message
pub fn log_warn(subsystem: &str, event: &str, message: &str) {
    log("warn", subsystem, event, message);
}

/// Log error message
pub fn log_error(subsystem: &str, event: &str, message: &str) {
    log("error", subsystem, event, message);
}
