//! Desktop notification collaborator.
//!
//! Fire-and-forget: every failure here is logged and swallowed, because a
//! broken notifier must never perturb coordinator state.
//!
//! Uses platform-appropriate tools: `osascript` on macOS, `notify-send`
//! elsewhere. Each call is bounded so a hung helper cannot stall the daemon.

use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::log::log_warn;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Rate limit observed; countdown begins.
pub fn notify_rate_limit(reset_display: &str) {
    send(
        "autoresume: rate limited",
        &format!("Session rate limited. Resuming after {}.", reset_display),
    );
}

/// Resume keystroke delivered.
pub fn notify_resume(session: Option<&str>) {
    let body = match session {
        Some(s) => format!("Resume sent to session {}.", s),
        None => "Resume sent.".to_string(),
    };
    send("autoresume: resumed", &body);
}

/// Retries exhausted or delivery never found a target.
pub fn notify_failure(reason: &str) {
    send("autoresume: resume failed", reason);
}

/// Send a desktop notification, best-effort.
fn send(title: &str, body: &str) {
    let result = if cfg!(target_os = "macos") {
        send_macos(title, body)
    } else {
        send_linux(title, body)
    };

    if let Err(e) = result {
        log_warn("notify", "send.fail", &e);
    }
}

fn send_linux(title: &str, body: &str) -> Result<(), String> {
    let mut cmd = Command::new("notify-send");
    cmd.arg("--app-name=autoresume").arg(title).arg(body);
    run_silent(cmd, "notify-send")
}

fn send_macos(title: &str, body: &str) -> Result<(), String> {
    let script = format!(
        r#"display notification "{}" with title "{}""#,
        escape(body),
        escape(title)
    );
    let mut cmd = Command::new("osascript");
    cmd.arg("-e").arg(&script);
    run_silent(cmd, "osascript")
}

fn run_silent(mut cmd: Command, name: &str) -> Result<(), String> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("{} failed to spawn: {}", name, e))?;

    match child.wait_timeout(NOTIFY_TIMEOUT) {
        Ok(Some(status)) if status.success() => Ok(()),
        Ok(Some(status)) => Err(format!("{} exited with: {}", name, status)),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(format!("{} timed out", name))
        }
        Err(e) => Err(format!("{} wait failed: {}", name, e)),
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
