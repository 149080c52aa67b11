//! Resume orchestration: the single-flight attempt loop.
//!
//! Exactly one resume attempt may be in flight at a time, process-wide.
//! The busy flag is claimed with a compare-exchange and released by an
//! RAII guard, so every exit path (including retry exhaustion and early
//! staleness bailout) leaves the coordinator reusable.
//!
//! Delivery success commits the event as completed BEFORE verification
//! runs. Verification is diagnostic: an unverified delivery triggers
//! in-memory retries and, on exhaustion, a failure notification, but the
//! entry stays completed because the text may well have landed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::analytics::Analytics;
use crate::config::Config;
use crate::delivery::{self, DeliveryTier};
use crate::hooks::{HookPoint, HookRegistry};
use crate::log::{log_info, log_warn};
use crate::notify;
use crate::queue::{DetectionEvent, EventQueue, EventStatus};
use crate::retry::RetryPolicy;
use crate::stale;
use crate::status::StatusBroadcaster;
use crate::verify;

/// Why a resume attempt ended without a delivery.
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("reset time {0:?} is past the staleness threshold")]
    DetectionStale(String),
    #[error("no delivery tier reached a target after {0} attempt(s)")]
    RetryExhausted(u32),
}

/// How a completed attempt loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Another attempt was already in flight; nothing was done
    Busy,
    /// Delivered, and the transcript showed post-resume activity
    Verified,
    /// Delivered, but no transcript evidence within the window
    Unverified,
}

/// Notification label for the session a resume went to. The detected
/// rate-limit message is not a session identity; the source pid is.
fn session_label(event: &DetectionEvent) -> Option<String> {
    event.source_pid.map(|pid| format!("pid {}", pid))
}

/// Releases the single-flight flag when dropped.
struct FlightGuard {
    flag: Arc<AtomicBool>,
}

impl FlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Drives one event through deliver, commit, verify, retry.
pub struct ResumeCoordinator {
    busy: Arc<AtomicBool>,
    status: StatusBroadcaster,
    hooks: HookRegistry,
    policy: RetryPolicy,
}

impl ResumeCoordinator {
    pub fn new() -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            status: StatusBroadcaster::new(),
            hooks: HookRegistry::new(),
            policy: RetryPolicy::default(),
        }
    }

    /// Coordinator wired to explicit collaborators (for testing).
    #[cfg(test)]
    fn with_parts(status: StatusBroadcaster, hooks: HookRegistry, policy: RetryPolicy) -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            status,
            hooks,
            policy,
        }
    }

    /// True while a resume attempt is in flight. The scheduler checks this
    /// before arming a countdown for the next pending event.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run the full attempt loop for one event using the real tier chain.
    pub fn attempt_resume(
        &mut self,
        queue: &mut EventQueue,
        event: &DetectionEvent,
        running: &AtomicBool,
    ) -> Result<ResumeOutcome, ResumeError> {
        let config = Config::get();
        let mut tiers = delivery::default_tiers(&config);
        self.attempt_with_tiers(queue, event, running, &config, &mut tiers)
    }

    /// Attempt loop with an injected tier chain. Tiers re-discover targets
    /// on every call, so the same chain serves all retries.
    fn attempt_with_tiers(
        &mut self,
        queue: &mut EventQueue,
        event: &DetectionEvent,
        running: &AtomicBool,
        config: &Config,
        tiers: &mut [Box<dyn DeliveryTier>],
    ) -> Result<ResumeOutcome, ResumeError> {
        let Some(_guard) = FlightGuard::acquire(&self.busy) else {
            log_info(
                "coordinator",
                "attempt.busy",
                &format!("Attempt already in flight, skipping event {}", event.id),
            );
            return Ok(ResumeOutcome::Busy);
        };

        // Last-moment staleness check: the countdown may have been armed
        // hours ago on a reset time that has since aged out.
        if stale::is_stale(&event.reset_time, config.stale_threshold()) {
            if let Err(e) = queue.update_entry_status(&event.id, EventStatus::Failed) {
                log_warn("coordinator", "queue.persist", &e.to_string());
            }
            self.fire_status_change(event, EventStatus::Failed);
            self.status.broadcast_status("idle", None);
            return Err(ResumeError::DetectionStale(event.reset_time.clone()));
        }

        if let Err(e) = queue.update_entry_status(&event.id, EventStatus::Active) {
            log_warn("coordinator", "queue.persist", &e.to_string());
        }
        self.status.broadcast_status("attempting", Some(event));

        let mut attempt_no: u32 = 0;
        loop {
            let baseline = config
                .transcript_path
                .as_deref()
                .map(verify::snapshot_len);

            log_info(
                "coordinator",
                "attempt.deliver",
                &format!("Event {} delivery attempt {}", event.id, attempt_no + 1),
            );
            let attempt = delivery::deliver_resume(&config.resume_prompt, tiers);

            if attempt.success {
                // Commit before verification: the text is in the terminal,
                // so a crash from here on must not cause a duplicate send.
                if let Err(e) = queue.update_entry_status(&event.id, EventStatus::Completed) {
                    log_warn("coordinator", "queue.persist", &e.to_string());
                }
                self.fire_status_change(event, EventStatus::Completed);
                self.status.broadcast_status("delivered", Some(event));
                self.hooks.fire(
                    HookPoint::ResumeSent,
                    &json!({
                        "event_id": event.id,
                        "reset_time": event.reset_time,
                        "attempt": attempt_no + 1,
                        "tiers": attempt
                            .tiers_attempted
                            .iter()
                            .map(|t| t.as_str())
                            .collect::<Vec<_>>(),
                    }),
                );
                notify::notify_resume(session_label(event).as_deref());
                self.record_outcome(config, event, "delivered");

                match (config.transcript_path.as_deref(), baseline) {
                    (Some(transcript), Some(baseline)) => {
                        self.status.broadcast_status("verifying", Some(event));
                        let result = verify::verify_resume_by_transcript(
                            transcript,
                            baseline,
                            config.verify_window(),
                            config.check_interval(),
                            running,
                        );
                        if result.verified {
                            log_info(
                                "coordinator",
                                "verify.ok",
                                &format!(
                                    "Event {} verified via {} at {}",
                                    event.id,
                                    result.method,
                                    result.checked_at.to_rfc3339()
                                ),
                            );
                            self.record_outcome(config, event, "verified");
                            self.status.broadcast_status("idle", None);
                            return Ok(ResumeOutcome::Verified);
                        }

                        attempt_no += 1;
                        if self.policy.should_retry(attempt_no, config.max_retries)
                            && running.load(Ordering::Acquire)
                        {
                            log_warn(
                                "coordinator",
                                "verify.miss",
                                &format!(
                                    "No transcript activity for event {}, retrying ({}/{})",
                                    event.id, attempt_no, config.max_retries
                                ),
                            );
                            self.pause(self.policy.next_delay(attempt_no), running);
                            continue;
                        }

                        // Entry stays completed: unverified is a diagnostic
                        // outcome, not proof the resume never landed.
                        self.record_outcome(config, event, "unverified");
                        notify::notify_failure(&format!(
                            "Resume sent but unverified after {} attempt(s)",
                            attempt_no
                        ));
                        self.status.broadcast_status("idle", None);
                        return Ok(ResumeOutcome::Unverified);
                    }
                    _ => {
                        // No transcript configured; delivery is the best
                        // evidence available.
                        self.status.broadcast_status("idle", None);
                        return Ok(ResumeOutcome::Unverified);
                    }
                }
            }

            attempt_no += 1;
            if self.policy.should_retry(attempt_no, config.max_retries)
                && running.load(Ordering::Acquire)
            {
                log_warn(
                    "coordinator",
                    "deliver.miss",
                    &format!(
                        "No tier delivered for event {}, retrying ({}/{})",
                        event.id, attempt_no, config.max_retries
                    ),
                );
                self.pause(self.policy.next_delay(attempt_no), running);
                continue;
            }

            if let Err(e) = queue.update_entry_status(&event.id, EventStatus::Failed) {
                log_warn("coordinator", "queue.persist", &e.to_string());
            }
            self.fire_status_change(event, EventStatus::Failed);
            self.record_outcome(config, event, "failed");
            notify::notify_failure(&format!(
                "Could not reach any terminal after {} attempt(s)",
                attempt_no
            ));
            self.status.broadcast_status("idle", None);
            return Err(ResumeError::RetryExhausted(attempt_no));
        }
    }

    /// Entry reached a terminal status; tell subscribed hooks.
    fn fire_status_change(&self, event: &DetectionEvent, status: EventStatus) {
        self.hooks.fire(
            HookPoint::StatusChange,
            &json!({
                "event_id": event.id,
                "reset_time": event.reset_time,
                "status": status.to_string(),
            }),
        );
    }

    /// Backoff sleep in short increments so a stop signal cuts it short.
    fn pause(&self, delay: Duration, running: &AtomicBool) {
        let mut remaining = delay;
        while running.load(Ordering::Acquire) && remaining > Duration::ZERO {
            let step = remaining.min(Duration::from_millis(100));
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }

    /// Analytics writes never gate the attempt loop.
    fn record_outcome(&self, config: &Config, event: &DetectionEvent, outcome: &str) {
        match Analytics::open_at(&config.base_dir.join("events.db")) {
            Ok(analytics) => {
                if let Err(e) = analytics.record_resume(event, outcome) {
                    log_warn("coordinator", "analytics", &e.to_string());
                }
            }
            Err(e) => log_warn("coordinator", "analytics", &e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{TierName, TierOutcome};
    use crate::queue::Detection;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct ScriptedTier {
        name: TierName,
        // One entry per call; out of script means fail
        script: Vec<bool>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedTier {
        fn new(name: TierName, script: Vec<bool>) -> Box<dyn DeliveryTier> {
            Self::counted(name, script).0
        }

        /// Tier plus a shared call counter, for asserting retry behavior.
        fn counted(name: TierName, script: Vec<bool>) -> (Box<dyn DeliveryTier>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let tier = Box::new(Self {
                name,
                script,
                calls: Arc::clone(&calls),
            });
            (tier, calls)
        }
    }

    impl DeliveryTier for ScriptedTier {
        fn name(&self) -> TierName {
            self.name
        }

        fn attempt(&mut self, _resume_text: &str) -> TierOutcome {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            let delivered = self.script.get(call).copied().unwrap_or(false);
            TierOutcome {
                tier: self.name,
                targets: Vec::new(),
                delivered,
            }
        }
    }

    fn test_config(dir: &TempDir, transcript: Option<PathBuf>) -> Config {
        Config {
            base_dir: dir.path().to_path_buf(),
            resume_prompt: "continue".to_string(),
            program: "claude".to_string(),
            post_reset_delay_sec: 0,
            max_retries: 2,
            verify_window_sec: 0,
            check_interval_sec: 1,
            stale_threshold_hours: 6,
            pty_device: None,
            transcript_path: transcript,
        }
    }

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            initial: 0.0,
            multiplier: 2.0,
            maximum: 0.0,
        }
    }

    fn coordinator(dir: &TempDir) -> ResumeCoordinator {
        ResumeCoordinator::with_parts(
            StatusBroadcaster::at(dir.path().join("status.json")),
            HookRegistry::at(dir.path().join("hooks"), Duration::from_secs(1)),
            instant_policy(),
        )
    }

    fn seeded_queue(dir: &TempDir, reset_time: &str) -> (EventQueue, DetectionEvent) {
        let mut queue = EventQueue::open_at(dir.path().join("queue.json"));
        queue
            .add_detection(&Detection {
                reset_time: reset_time.to_string(),
                ..Detection::default()
            })
            .unwrap();
        let event = queue.get_next_pending().unwrap();
        (queue, event)
    }

    fn future_reset() -> String {
        (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339()
    }

    fn running() -> AtomicBool {
        AtomicBool::new(true)
    }

    fn status_of(queue: &EventQueue, id: &str) -> EventStatus {
        queue
            .entries()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.status)
            .unwrap()
    }

    #[test]
    fn successful_delivery_commits_completed() {
        let dir = TempDir::new().unwrap();
        let (mut queue, event) = seeded_queue(&dir, &future_reset());
        let mut coord = coordinator(&dir);
        let mut tiers = vec![ScriptedTier::new(TierName::Multiplexer, vec![true])];

        let outcome = coord
            .attempt_with_tiers(
                &mut queue,
                &event,
                &running(),
                &test_config(&dir, None),
                &mut tiers,
            )
            .unwrap();

        assert_eq!(outcome, ResumeOutcome::Unverified);
        assert_eq!(status_of(&queue, &event.id), EventStatus::Completed);
        assert!(!coord.is_busy());
    }

    #[test]
    fn busy_coordinator_skips_second_attempt() {
        let dir = TempDir::new().unwrap();
        let (mut queue, event) = seeded_queue(&dir, &future_reset());
        let mut coord = coordinator(&dir);
        coord.busy.store(true, Ordering::Release);

        let mut tiers = vec![ScriptedTier::new(TierName::Multiplexer, vec![true])];
        let outcome = coord
            .attempt_with_tiers(
                &mut queue,
                &event,
                &running(),
                &test_config(&dir, None),
                &mut tiers,
            )
            .unwrap();

        assert_eq!(outcome, ResumeOutcome::Busy);
        // Untouched: a busy skip must not change entry state
        assert_eq!(status_of(&queue, &event.id), EventStatus::Pending);
    }

    #[test]
    fn stale_event_fails_without_delivery() {
        let dir = TempDir::new().unwrap();
        let old = (chrono::Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
        let (mut queue, event) = seeded_queue(&dir, &old);
        let mut coord = coordinator(&dir);
        let mut tiers = vec![ScriptedTier::new(TierName::Multiplexer, vec![true])];

        let err = coord
            .attempt_with_tiers(
                &mut queue,
                &event,
                &running(),
                &test_config(&dir, None),
                &mut tiers,
            )
            .unwrap_err();

        assert!(matches!(err, ResumeError::DetectionStale(_)));
        assert_eq!(status_of(&queue, &event.id), EventStatus::Failed);
        assert!(!coord.is_busy());
    }

    #[test]
    fn delivery_exhaustion_marks_failed() {
        let dir = TempDir::new().unwrap();
        let (mut queue, event) = seeded_queue(&dir, &future_reset());
        let mut coord = coordinator(&dir);
        // Never delivers on any call
        let mut tiers = vec![ScriptedTier::new(TierName::Multiplexer, vec![])];

        let err = coord
            .attempt_with_tiers(
                &mut queue,
                &event,
                &running(),
                &test_config(&dir, None),
                &mut tiers,
            )
            .unwrap_err();

        assert!(matches!(err, ResumeError::RetryExhausted(2)));
        assert_eq!(status_of(&queue, &event.id), EventStatus::Failed);
        assert!(!coord.is_busy());
    }

    #[test]
    fn delivery_failure_retries_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let (mut queue, event) = seeded_queue(&dir, &future_reset());
        let mut coord = coordinator(&dir);
        let (tier, calls) = ScriptedTier::counted(TierName::Multiplexer, vec![false, true]);
        let mut tiers = vec![tier];

        let outcome = coord
            .attempt_with_tiers(
                &mut queue,
                &event,
                &running(),
                &test_config(&dir, None),
                &mut tiers,
            )
            .unwrap();

        assert_eq!(outcome, ResumeOutcome::Unverified);
        assert_eq!(status_of(&queue, &event.id), EventStatus::Completed);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn unverified_exhaustion_keeps_completed() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("transcript.jsonl");
        std::fs::write(&transcript, "before\n").unwrap();

        let (mut queue, event) = seeded_queue(&dir, &future_reset());
        let mut coord = coordinator(&dir);
        // Succeeds every time, but the transcript never grows
        let (tier, calls) = ScriptedTier::counted(
            TierName::Multiplexer,
            vec![true, true, true],
        );
        let mut tiers = vec![tier];

        let outcome = coord
            .attempt_with_tiers(
                &mut queue,
                &event,
                &running(),
                &test_config(&dir, Some(transcript)),
                &mut tiers,
            )
            .unwrap();

        assert_eq!(outcome, ResumeOutcome::Unverified);
        assert_eq!(status_of(&queue, &event.id), EventStatus::Completed);
        // Unverified deliveries are re-sent until the retry budget is spent
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(!coord.is_busy());
    }

    #[test]
    fn transcript_growth_verifies() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("transcript.jsonl");
        std::fs::write(&transcript, "before\n").unwrap();

        let (mut queue, event) = seeded_queue(&dir, &future_reset());
        let mut coord = coordinator(&dir);
        let mut tiers = vec![ScriptedTier::new(TierName::Multiplexer, vec![true])];

        let transcript_clone = transcript.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&transcript_clone)
                .unwrap();
            use std::io::Write;
            writeln!(f, "assistant turn").unwrap();
        });

        let mut config = test_config(&dir, Some(transcript));
        config.verify_window_sec = 5;
        let outcome = coord
            .attempt_with_tiers(&mut queue, &event, &running(), &config, &mut tiers)
            .unwrap();
        writer.join().unwrap();

        assert_eq!(outcome, ResumeOutcome::Verified);
        assert_eq!(status_of(&queue, &event.id), EventStatus::Completed);
    }

    #[test]
    fn session_label_comes_from_pid_not_message() {
        let mut event = DetectionEvent {
            id: "t".to_string(),
            reset_time: "2026-08-27T18:00:00Z".to_string(),
            timezone: None,
            message: Some("You have hit your usage limit.".to_string()),
            detected_at: chrono::Utc::now(),
            source_pid: Some(4242),
            status: EventStatus::Pending,
            completed_at: None,
        };
        assert_eq!(session_label(&event), Some("pid 4242".to_string()));

        event.source_pid = None;
        assert_eq!(session_label(&event), None);
    }
}
