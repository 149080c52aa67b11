//! Centralized path resolution for autoresume
//!
//! Single source of truth for all autoresume directory and file paths.
//! Respects AUTORESUME_DIR env var for dev/worktrees, falls back to ~/.autoresume.

use std::path::PathBuf;
use crate::config::Config;

/// Get the autoresume base directory.
///
/// Uses centralized Config (AUTORESUME_DIR env var or ~/.autoresume fallback).
pub fn base_dir() -> PathBuf {
    Config::get().base_dir
}

/// Get the queue document path (base_dir/queue.json)
pub fn queue_path() -> PathBuf {
    base_dir().join("queue.json")
}

/// Get the log file path (base_dir/logs/autoresume.log)
pub fn log_path() -> PathBuf {
    base_dir().join("logs").join("autoresume.log")
}

/// Get the analytics database path (base_dir/events.db)
pub fn events_db_path() -> PathBuf {
    base_dir().join("events.db")
}

/// Get the daemon PID file path (base_dir/autoresume.pid)
pub fn pid_path() -> PathBuf {
    base_dir().join("autoresume.pid")
}

/// Get the wake port file path (base_dir/wake.port)
/// Written by the daemon on startup, read by detect/trigger to poke it awake.
pub fn wake_port_path() -> PathBuf {
    base_dir().join("wake.port")
}

/// Get the status broadcast file path (base_dir/status.json)
pub fn status_path() -> PathBuf {
    base_dir().join("status.json")
}

/// Get the hooks directory (base_dir/hooks)
/// Each hook point is a subdirectory holding executables.
pub fn hooks_dir() -> PathBuf {
    base_dir().join("hooks")
}
