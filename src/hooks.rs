//! Extension hooks: user-supplied executables invoked at fixed points.
//!
//! Layout: <base_dir>/hooks/<point>/* — any executable file in a hook
//! point's directory runs when that point fires, receiving the event
//! payload as JSON on stdin. Invocations are bounded by a per-hook timeout
//! and isolated: one faulty or hung hook is killed and logged, and the
//! remaining hooks still run.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use wait_timeout::ChildExt;

use crate::log::{log_info, log_warn};

const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed capability set of hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    RateLimitDetected,
    ResumeSent,
    StatusChange,
    DaemonStart,
    DaemonStop,
}

impl HookPoint {
    /// Directory name under hooks/ for this point.
    pub fn dir_name(self) -> &'static str {
        match self {
            HookPoint::RateLimitDetected => "on-rate-limit-detected",
            HookPoint::ResumeSent => "on-resume-sent",
            HookPoint::StatusChange => "on-status-change",
            HookPoint::DaemonStart => "on-daemon-start",
            HookPoint::DaemonStop => "on-daemon-stop",
        }
    }
}

/// Discovers and invokes hook executables for one autoresume directory.
pub struct HookRegistry {
    dir: PathBuf,
    timeout: Duration,
}

impl HookRegistry {
    /// Registry over the configured hooks directory.
    pub fn new() -> Self {
        Self::at(crate::paths::hooks_dir(), HOOK_TIMEOUT)
    }

    /// Registry over a specific directory with a specific timeout (for testing).
    pub fn at(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { dir: dir.into(), timeout }
    }

    /// Executable files registered for a hook point, sorted by name.
    pub fn discover(&self, point: HookPoint) -> Vec<PathBuf> {
        let dir = self.dir.join(point.dir_name());
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut hooks: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_executable(p))
            .collect();
        hooks.sort();
        hooks
    }

    /// Fire a hook point with a JSON payload. Never fails the caller:
    /// each hook's outcome is logged and the rest proceed regardless.
    pub fn fire(&self, point: HookPoint, payload: &Value) {
        let hooks = self.discover(point);
        if hooks.is_empty() {
            return;
        }

        let json = payload.to_string();
        for hook in hooks {
            match self.run_hook(&hook, &json) {
                Ok(()) => log_info("hooks", "fired", &format!(
                    "{} <- {}", hook.display(), point.dir_name()
                )),
                Err(e) => log_warn("hooks", "failed", &format!(
                    "{} ({}): {}", hook.display(), point.dir_name(), e
                )),
            }
        }
    }

    /// Run one hook with the payload on stdin, bounded by the registry timeout.
    fn run_hook(&self, hook: &Path, payload: &str) -> Result<()> {
        use std::io::Write;

        let mut child = Command::new(hook)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", hook.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            // Hook may exit without reading; ignore the broken pipe
            let _ = stdin.write_all(payload.as_bytes());
        }

        match child.wait_timeout(self.timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => bail!("exited with {}", status),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("timed out after {:?}", self.timeout);
            }
        }
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_hook(dir: &Path, point: HookPoint, name: &str, script: &str) -> PathBuf {
        let hook_dir = dir.join(point.dir_name());
        std::fs::create_dir_all(&hook_dir).unwrap();
        let path = hook_dir.join(name);
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn discover_empty_when_no_hooks_dir() {
        let dir = TempDir::new().unwrap();
        let registry = HookRegistry::at(dir.path(), HOOK_TIMEOUT);
        assert!(registry.discover(HookPoint::DaemonStart).is_empty());
    }

    #[test]
    fn discover_skips_non_executable_files() {
        let dir = TempDir::new().unwrap();
        let hook_dir = dir.path().join(HookPoint::ResumeSent.dir_name());
        std::fs::create_dir_all(&hook_dir).unwrap();
        std::fs::write(hook_dir.join("README.md"), "not a hook").unwrap();
        write_hook(dir.path(), HookPoint::ResumeSent, "notify.sh", "#!/bin/sh\nexit 0\n");

        let registry = HookRegistry::at(dir.path(), HOOK_TIMEOUT);
        let hooks = registry.discover(HookPoint::ResumeSent);
        assert_eq!(hooks.len(), 1);
        assert!(hooks[0].ends_with("notify.sh"));
    }

    #[test]
    fn hook_receives_payload_on_stdin() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("received.json");
        write_hook(
            dir.path(),
            HookPoint::RateLimitDetected,
            "capture.sh",
            &format!("#!/bin/sh\ncat > {}\n", out.display()),
        );

        let registry = HookRegistry::at(dir.path(), HOOK_TIMEOUT);
        registry.fire(
            HookPoint::RateLimitDetected,
            &serde_json::json!({"reset_time": "6pm"}),
        );

        let received = std::fs::read_to_string(&out).unwrap();
        assert!(received.contains("6pm"));
    }

    #[test]
    fn failing_hook_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("second-ran");
        write_hook(dir.path(), HookPoint::StatusChange, "a-fails.sh", "#!/bin/sh\nexit 1\n");
        write_hook(
            dir.path(),
            HookPoint::StatusChange,
            "b-runs.sh",
            &format!("#!/bin/sh\ntouch {}\n", out.display()),
        );

        let registry = HookRegistry::at(dir.path(), HOOK_TIMEOUT);
        registry.fire(HookPoint::StatusChange, &serde_json::json!({}));
        assert!(out.exists());
    }

    #[test]
    fn hung_hook_is_killed_at_timeout() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("after-hang");
        write_hook(dir.path(), HookPoint::DaemonStop, "a-hang.sh", "#!/bin/sh\nsleep 30\n");
        write_hook(
            dir.path(),
            HookPoint::DaemonStop,
            "b-after.sh",
            &format!("#!/bin/sh\ntouch {}\n", out.display()),
        );

        let registry = HookRegistry::at(dir.path(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        registry.fire(HookPoint::DaemonStop, &serde_json::json!({}));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(out.exists());
    }
}
