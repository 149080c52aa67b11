//! Configuration loaded from environment variables at startup.
//!
//! Centralizes all AUTORESUME_* env var access into a single Config struct,
//! providing a single source of truth with fail-fast validation.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Global configuration instance, lazily initialized and resettable for tests.
static CONFIG: Mutex<Option<Config>> = Mutex::new(None);

/// Configuration loaded from AUTORESUME_* environment variables.
///
/// All environment variable access should go through this struct
/// rather than calling env::var directly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base directory (AUTORESUME_DIR or ~/.autoresume)
    pub base_dir: PathBuf,
    /// Text injected to resume the session (AUTORESUME_PROMPT, default "continue")
    pub resume_prompt: String,
    /// Program name used to filter delivery targets (AUTORESUME_PROGRAM, default "claude")
    pub program: String,
    /// Seconds to wait past the advertised reset before resuming (AUTORESUME_POST_RESET_DELAY_SEC)
    pub post_reset_delay_sec: u64,
    /// Maximum delivery/verification retries per event (AUTORESUME_MAX_RETRIES)
    pub max_retries: u32,
    /// Verification window in seconds (AUTORESUME_VERIFY_WINDOW_SEC)
    pub verify_window_sec: u64,
    /// Poll interval for verification and idle checks, seconds (AUTORESUME_CHECK_INTERVAL_SEC)
    pub check_interval_sec: u64,
    /// Detections whose reset time is older than this are stale (AUTORESUME_STALE_THRESHOLD_HOURS)
    pub stale_threshold_hours: u64,
    /// Optional pseudo-terminal device for the direct-write tier (AUTORESUME_PTY_DEVICE)
    pub pty_device: Option<PathBuf>,
    /// Optional transcript file the verifier watches (AUTORESUME_TRANSCRIPT)
    pub transcript_path: Option<PathBuf>,
}

impl Config {
    /// Initialize global config from environment variables (call once at startup).
    /// Can be called multiple times - subsequent calls are no-ops.
    pub fn init() {
        let mut config = CONFIG.lock().unwrap();
        if config.is_none() {
            *config = Some(Self::from_env());
        }
    }

    /// Get a copy of the global config (must call init() first).
    /// Panics if init() was not called.
    pub fn get() -> Config {
        CONFIG
            .lock()
            .unwrap()
            .clone()
            .expect("Config::init() must be called before Config::get()")
    }

    /// Get a copy of the global config if initialized.
    /// Used by logging, which must never panic.
    pub fn try_get() -> Option<Config> {
        CONFIG.lock().ok().and_then(|c| c.clone())
    }

    /// Reset global config (test-only).
    /// Allows tests to reinitialize config with different env vars.
    #[cfg(test)]
    pub fn reset() {
        *CONFIG.lock().unwrap() = None;
    }

    /// Stale threshold as a Duration. Saturates so an absurd env value
    /// cannot overflow the multiply.
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_hours.saturating_mul(3600))
    }

    /// Verification window as a Duration.
    pub fn verify_window(&self) -> Duration {
        Duration::from_secs(self.verify_window_sec)
    }

    /// Poll interval as a Duration.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_sec)
    }

    /// Load configuration from environment variables
    fn from_env() -> Self {
        use std::env;

        // AUTORESUME_DIR: custom directory or ~/.autoresume
        let base_dir = if let Ok(dir) = env::var("AUTORESUME_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".autoresume")
        } else {
            PathBuf::from(".autoresume")
        };

        let resume_prompt = env::var("AUTORESUME_PROMPT")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "continue".to_string());

        let program = env::var("AUTORESUME_PROGRAM")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "claude".to_string());

        let post_reset_delay_sec = env_u64("AUTORESUME_POST_RESET_DELAY_SEC", 5);
        let max_retries = env_u64("AUTORESUME_MAX_RETRIES", 3) as u32;
        let verify_window_sec = env_u64("AUTORESUME_VERIFY_WINDOW_SEC", 30);
        let check_interval_sec = env_u64("AUTORESUME_CHECK_INTERVAL_SEC", 2).max(1);
        let stale_threshold_hours = env_u64("AUTORESUME_STALE_THRESHOLD_HOURS", 6).max(1);

        let pty_device = env::var("AUTORESUME_PTY_DEVICE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let transcript_path = env::var("AUTORESUME_TRANSCRIPT")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Self {
            base_dir,
            resume_prompt,
            program,
            post_reset_delay_sec,
            max_retries,
            verify_window_sec,
            check_interval_sec,
            stale_threshold_hours,
            pty_device,
            transcript_path,
        }
    }
}

/// Parse a u64 env var, falling back to the default on absence or garbage.
fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
