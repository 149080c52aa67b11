//! Tiered keystroke delivery for the resume prompt.
//!
//! Tiers are tried strictly in priority order and each one re-discovers its
//! targets on every attempt — terminal topology changes between attempts, so
//! discovery results are never cached across calls:
//!
//! 1. Multiplexer tier: every tmux pane hosting the target program, each
//!    pane sent independently; one pane failing does not abort the others.
//! 2. Pseudo-terminal tier: direct write to a known pty device.
//! 3. Keystroke tier: synthetic keyboard events via the host OS
//!    (System Events on macOS, xdotool elsewhere).
//!
//! Delivery returns as soon as any tier reports success. Every subprocess
//! call is individually bounded; an unbounded wait here is a defect.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use wait_timeout::ChildExt;

use crate::config::Config;
use crate::log::{log_info, log_warn};

/// Bound on a single tmux/osascript/xdotool invocation.
const TIER_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback tier identity, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierName {
    Multiplexer,
    Pty,
    Keystroke,
}

impl TierName {
    pub fn as_str(self) -> &'static str {
        match self {
            TierName::Multiplexer => "multiplexer",
            TierName::Pty => "pty",
            TierName::Keystroke => "keystroke",
        }
    }
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An addressable endpoint for keystroke injection (one tmux pane, typically).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    /// Opaque identifier (tmux pane id, device path, window name)
    pub target: String,
    /// Owning process id, when discovery can tell
    pub pid: Option<u32>,
    /// Running program name, used for target filtering
    pub command: String,
}

/// Per-target outcome of one delivery attempt.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub target: String,
    pub ok: bool,
    pub detail: String,
}

/// What one tier did: which targets it found and whether any received the text.
#[derive(Debug, Clone)]
pub struct TierOutcome {
    pub tier: TierName,
    pub targets: Vec<TargetOutcome>,
    pub delivered: bool,
}

/// Aggregate result of a full tiered delivery pass (transient, not persisted).
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    /// Every tier actually invoked this attempt, in order
    pub tiers_attempted: Vec<TierName>,
    /// Per-target outcomes across all invoked tiers
    pub targets: Vec<TargetOutcome>,
    /// True if at least one target in at least one tier succeeded
    pub success: bool,
}

/// One fallback mechanism. Each attempt call re-discovers targets.
pub trait DeliveryTier {
    fn name(&self) -> TierName;
    fn attempt(&mut self, resume_text: &str) -> TierOutcome;
}

/// Try tiers in priority order, short-circuiting on the first success.
///
/// `tiers_attempted` records every tier that actually ran, including ones
/// that found zero targets. Overall success is false only if every tier
/// both ran and failed or found nothing.
pub fn deliver_resume(resume_text: &str, tiers: &mut [Box<dyn DeliveryTier>]) -> DeliveryAttempt {
    let mut attempt = DeliveryAttempt {
        tiers_attempted: Vec::new(),
        targets: Vec::new(),
        success: false,
    };

    for tier in tiers.iter_mut() {
        log_info("delivery", "tier.try", tier.name().as_str());
        let outcome = tier.attempt(resume_text);
        attempt.tiers_attempted.push(outcome.tier);
        attempt.targets.extend(outcome.targets.iter().cloned());

        log_info("delivery", "tier.result", &format!(
            "tier={} targets={} delivered={}",
            outcome.tier,
            outcome.targets.len(),
            outcome.delivered
        ));

        if outcome.delivered {
            attempt.success = true;
            break;
        }
    }

    attempt
}

/// Build the real tier chain from configuration.
pub fn default_tiers(config: &Config) -> Vec<Box<dyn DeliveryTier>> {
    vec![
        Box::new(MultiplexerTier::new(&config.program)),
        Box::new(PtyTier::new(config.pty_device.clone())),
        Box::new(KeystrokeTier::new()),
    ]
}

/// Run a command with piped output, bounded by `timeout`.
/// On timeout the child is killed and reaped.
fn run_bounded(mut command: Command, timeout: Duration) -> Result<(bool, String)> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to spawn {:?}", command.get_program()))?;

    match child.wait_timeout(timeout)? {
        Some(status) => {
            let mut stdout = String::new();
            if let Some(mut pipe) = child.stdout.take() {
                let _ = pipe.read_to_string(&mut stdout);
            }
            Ok((status.success(), stdout))
        }
        None => {
            let _ = child.kill();
            let _ = child.wait();
            bail!("command timed out after {:?}", timeout);
        }
    }
}

// ---- Tier 1: multiplexed terminal (tmux) ----

/// Sends the resume text to every tmux pane running the target program.
pub struct MultiplexerTier {
    program: String,
    timeout: Duration,
}

impl MultiplexerTier {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            timeout: TIER_COMMAND_TIMEOUT,
        }
    }

    /// List every pane across every session, with pid and running command.
    fn discover(&self) -> Vec<DeliveryTarget> {
        let mut cmd = Command::new("tmux");
        cmd.args([
            "list-panes",
            "-a",
            "-F",
            "#{pane_id}\t#{pane_pid}\t#{pane_current_command}",
        ]);

        let output = match run_bounded(cmd, self.timeout) {
            Ok((true, stdout)) => stdout,
            Ok((false, _)) => return Vec::new(), // no server running
            Err(e) => {
                log_warn("delivery", "tmux.discover_fail", &format!("{}", e));
                return Vec::new();
            }
        };

        output
            .lines()
            .filter_map(parse_pane_line)
            .filter(|t| t.command == self.program)
            .collect()
    }

    /// Send text then Enter to one pane. `-l` sends the text literally so
    /// prompt content can't be interpreted as key names.
    fn send_to_pane(&self, pane: &str, text: &str) -> Result<()> {
        let mut send_text = Command::new("tmux");
        send_text.args(["send-keys", "-t", pane, "-l", text]);
        let (ok, _) = run_bounded(send_text, self.timeout)?;
        if !ok {
            bail!("tmux send-keys text failed for {}", pane);
        }

        let mut send_enter = Command::new("tmux");
        send_enter.args(["send-keys", "-t", pane, "Enter"]);
        let (ok, _) = run_bounded(send_enter, self.timeout)?;
        if !ok {
            bail!("tmux send-keys Enter failed for {}", pane);
        }
        Ok(())
    }
}

impl DeliveryTier for MultiplexerTier {
    fn name(&self) -> TierName {
        TierName::Multiplexer
    }

    fn attempt(&mut self, resume_text: &str) -> TierOutcome {
        let panes = self.discover();
        let mut targets = Vec::with_capacity(panes.len());

        for pane in &panes {
            match self.send_to_pane(&pane.target, resume_text) {
                Ok(()) => targets.push(TargetOutcome {
                    target: pane.target.clone(),
                    ok: true,
                    detail: match pane.pid {
                        Some(pid) => format!("sent to pane running {} (pid {})", pane.command, pid),
                        None => format!("sent to pane running {}", pane.command),
                    },
                }),
                Err(e) => targets.push(TargetOutcome {
                    target: pane.target.clone(),
                    ok: false,
                    detail: e.to_string(),
                }),
            }
        }

        let delivered = targets.iter().any(|t| t.ok);
        TierOutcome {
            tier: TierName::Multiplexer,
            targets,
            delivered,
        }
    }
}

/// Parse one `pane_id \t pane_pid \t pane_current_command` line.
fn parse_pane_line(line: &str) -> Option<DeliveryTarget> {
    let mut parts = line.split('\t');
    let target = parts.next()?.trim();
    if target.is_empty() {
        return None;
    }
    let pid = parts.next()?.trim().parse::<u32>().ok();
    let command = parts.next()?.trim();
    Some(DeliveryTarget {
        target: target.to_string(),
        pid,
        command: command.to_string(),
    })
}

// ---- Tier 2: pseudo-terminal device ----

/// Writes the resume text directly to a known pty device.
pub struct PtyTier {
    device: Option<PathBuf>,
}

impl PtyTier {
    pub fn new(device: Option<PathBuf>) -> Self {
        Self { device }
    }

    fn write_device(device: &PathBuf, text: &str) -> Result<()> {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(device)
            .with_context(|| format!("Failed to open {}", device.display()))?;
        f.write_all(text.as_bytes())?;
        f.write_all(b"\r")?;
        f.flush()?;
        Ok(())
    }
}

impl DeliveryTier for PtyTier {
    fn name(&self) -> TierName {
        TierName::Pty
    }

    fn attempt(&mut self, resume_text: &str) -> TierOutcome {
        let Some(device) = self.device.clone() else {
            // No device configured: tier ran, found nothing
            return TierOutcome {
                tier: TierName::Pty,
                targets: Vec::new(),
                delivered: false,
            };
        };

        let name = device.display().to_string();
        let outcome = match Self::write_device(&device, resume_text) {
            Ok(()) => TargetOutcome {
                target: name,
                ok: true,
                detail: "wrote to pty device".to_string(),
            },
            Err(e) => TargetOutcome {
                target: name,
                ok: false,
                detail: e.to_string(),
            },
        };

        let delivered = outcome.ok;
        TierOutcome {
            tier: TierName::Pty,
            targets: vec![outcome],
            delivered,
        }
    }
}

// ---- Tier 3: platform keystroke injection (last resort) ----

/// Sends synthetic keyboard events to the foreground window.
pub struct KeystrokeTier {
    timeout: Duration,
}

impl KeystrokeTier {
    pub fn new() -> Self {
        Self {
            timeout: TIER_COMMAND_TIMEOUT,
        }
    }

    fn inject(&self, text: &str) -> Result<String> {
        if cfg!(target_os = "macos") {
            let script = format!(
                r#"tell application "System Events" to keystroke "{}""#,
                escape_applescript(text)
            );
            let mut type_cmd = Command::new("osascript");
            type_cmd.args(["-e", &script]);
            let (ok, _) = run_bounded(type_cmd, self.timeout)?;
            if !ok {
                bail!("osascript keystroke failed");
            }

            let mut enter_cmd = Command::new("osascript");
            enter_cmd.args(["-e", r#"tell application "System Events" to key code 36"#]);
            let (ok, _) = run_bounded(enter_cmd, self.timeout)?;
            if !ok {
                bail!("osascript key code 36 failed");
            }
            Ok("system-events".to_string())
        } else {
            let mut type_cmd = Command::new("xdotool");
            type_cmd.args(["type", "--clearmodifiers", text]);
            let (ok, _) = run_bounded(type_cmd, self.timeout)?;
            if !ok {
                bail!("xdotool type failed");
            }

            let mut enter_cmd = Command::new("xdotool");
            enter_cmd.args(["key", "Return"]);
            let (ok, _) = run_bounded(enter_cmd, self.timeout)?;
            if !ok {
                bail!("xdotool key Return failed");
            }
            Ok("xdotool".to_string())
        }
    }
}

impl DeliveryTier for KeystrokeTier {
    fn name(&self) -> TierName {
        TierName::Keystroke
    }

    fn attempt(&mut self, resume_text: &str) -> TierOutcome {
        let outcome = match self.inject(resume_text) {
            Ok(target) => TargetOutcome {
                target,
                ok: true,
                detail: "synthetic keystrokes sent".to_string(),
            },
            Err(e) => TargetOutcome {
                target: if cfg!(target_os = "macos") {
                    "system-events".to_string()
                } else {
                    "xdotool".to_string()
                },
                ok: false,
                detail: e.to_string(),
            },
        };

        let delivered = outcome.ok;
        TierOutcome {
            tier: TierName::Keystroke,
            targets: vec![outcome],
            delivered,
        }
    }
}

/// Escape a string for embedding in a double-quoted AppleScript literal.
fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted tier for composing fallback scenarios.
    struct FakeTier {
        name: TierName,
        targets: Vec<TargetOutcome>,
        delivered: bool,
    }

    impl FakeTier {
        fn new(name: TierName, delivered: bool, targets: Vec<TargetOutcome>) -> Self {
            Self { name, targets, delivered }
        }

        fn empty(name: TierName) -> Self {
            Self::new(name, false, vec![])
        }

        fn succeeding(name: TierName, target: &str) -> Self {
            Self::new(name, true, vec![TargetOutcome {
                target: target.to_string(),
                ok: true,
                detail: "ok".to_string(),
            }])
        }
    }

    impl DeliveryTier for FakeTier {
        fn name(&self) -> TierName {
            self.name
        }

        fn attempt(&mut self, _resume_text: &str) -> TierOutcome {
            TierOutcome {
                tier: self.name,
                targets: self.targets.clone(),
                delivered: self.delivered,
            }
        }
    }

    #[test]
    fn first_tier_success_short_circuits() {
        let mut tiers: Vec<Box<dyn DeliveryTier>> = vec![
            Box::new(FakeTier::succeeding(TierName::Multiplexer, "%1")),
            Box::new(FakeTier::succeeding(TierName::Pty, "/dev/ttys001")),
        ];
        let attempt = deliver_resume("continue", &mut tiers);
        assert!(attempt.success);
        assert_eq!(attempt.tiers_attempted, vec![TierName::Multiplexer]);
        assert_eq!(attempt.targets.len(), 1);
    }

    #[test]
    fn empty_discovery_falls_through_to_last_resort() {
        // Scenario: first two tiers find zero targets, last resort works
        let mut tiers: Vec<Box<dyn DeliveryTier>> = vec![
            Box::new(FakeTier::empty(TierName::Multiplexer)),
            Box::new(FakeTier::empty(TierName::Pty)),
            Box::new(FakeTier::succeeding(TierName::Keystroke, "xdotool")),
        ];
        let attempt = deliver_resume("continue", &mut tiers);
        assert!(attempt.success);
        assert_eq!(
            attempt.tiers_attempted,
            vec![TierName::Multiplexer, TierName::Pty, TierName::Keystroke]
        );
    }

    #[test]
    fn all_tiers_failing_is_overall_failure() {
        let mut tiers: Vec<Box<dyn DeliveryTier>> = vec![
            Box::new(FakeTier::empty(TierName::Multiplexer)),
            Box::new(FakeTier::empty(TierName::Pty)),
            Box::new(FakeTier::new(TierName::Keystroke, false, vec![TargetOutcome {
                target: "xdotool".to_string(),
                ok: false,
                detail: "xdotool type failed".to_string(),
            }])),
        ];
        let attempt = deliver_resume("continue", &mut tiers);
        assert!(!attempt.success);
        assert_eq!(attempt.tiers_attempted.len(), 3);
        assert_eq!(attempt.targets.len(), 1);
    }

    #[test]
    fn partial_target_failure_is_tier_success() {
        // One pane failing does not abort the tier
        let mut tiers: Vec<Box<dyn DeliveryTier>> = vec![
            Box::new(FakeTier::new(TierName::Multiplexer, true, vec![
                TargetOutcome { target: "%1".into(), ok: false, detail: "gone".into() },
                TargetOutcome { target: "%2".into(), ok: true, detail: "ok".into() },
            ])),
            Box::new(FakeTier::succeeding(TierName::Pty, "/dev/ttys001")),
        ];
        let attempt = deliver_resume("continue", &mut tiers);
        assert!(attempt.success);
        assert_eq!(attempt.tiers_attempted, vec![TierName::Multiplexer]);
        assert_eq!(attempt.targets.len(), 2);
    }

    // ---- pane line parsing ----

    #[test]
    fn parse_pane_line_full() {
        let t = parse_pane_line("%3\t12345\tclaude").unwrap();
        assert_eq!(t.target, "%3");
        assert_eq!(t.pid, Some(12345));
        assert_eq!(t.command, "claude");
    }

    #[test]
    fn parse_pane_line_bad_pid_is_none_pid() {
        let t = parse_pane_line("%3\tzzz\tclaude").unwrap();
        assert_eq!(t.pid, None);
    }

    #[test]
    fn parse_pane_line_rejects_short_lines() {
        assert!(parse_pane_line("").is_none());
        assert!(parse_pane_line("%3").is_none());
        assert!(parse_pane_line("%3\t123").is_none());
    }

    // ---- applescript escaping ----

    #[test]
    fn escape_applescript_quotes_and_backslashes() {
        assert_eq!(escape_applescript(r#"say "hi"\now"#), r#"say \"hi\"\\now"#);
        assert_eq!(escape_applescript("plain"), "plain");
    }

    #[test]
    fn pty_tier_without_device_finds_nothing() {
        let mut tier = PtyTier::new(None);
        let outcome = tier.attempt("continue");
        assert!(!outcome.delivered);
        assert!(outcome.targets.is_empty());
    }
}
