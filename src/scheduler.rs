//! Countdown scheduler: decides when the next resume fires.
//!
//! The daemon loop asks `evaluate` what to do, then either parks on the
//! wake port, counts down, discards a stale entry, or hands a due event
//! to the coordinator. A wake mid-countdown forces re-evaluation, so a
//! fresher detection with an earlier reset replaces the armed wait
//! without cancelling anything already in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use serde_json::json;

use crate::config::Config;
use crate::coordinator::{ResumeCoordinator, ResumeError};
use crate::hooks::{HookPoint, HookRegistry};
use crate::log::{log_info, log_warn};
use crate::queue::{DetectionEvent, EventQueue, EventStatus};
use crate::stale;
use crate::status::StatusBroadcaster;
use crate::wake::WakeServer;

/// Longest single park/countdown slice. Keeps staleness re-checked and
/// wake-port writes bounded even if no wake ever arrives.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(60);

/// What the scheduler should do next.
#[derive(Debug)]
pub enum Directive {
    /// Queue has no live entries; park until a wake
    Park,
    /// An entry is armed and not yet due
    Countdown {
        event: DetectionEvent,
        remaining: Duration,
    },
    /// An entry is due now
    Fire(DetectionEvent),
    /// An entry aged past the staleness threshold before firing
    Discard(DetectionEvent),
}

/// When a detection should fire: advertised reset plus the settle delay.
pub fn fire_time(event: &DetectionEvent, post_reset_delay: Duration) -> Option<DateTime<Utc>> {
    let reset = stale::parse_reset_time(&event.reset_time)?;
    Some(reset + chrono::Duration::from_std(post_reset_delay).unwrap_or_default())
}

/// Pure scheduling decision for the given clock reading.
pub fn evaluate(queue: &EventQueue, now: DateTime<Utc>, config: &Config) -> Directive {
    let Some(event) = queue.get_next_pending() else {
        return Directive::Park;
    };

    // Staleness wins over due-ness: a reset hours in the past means the
    // session was almost certainly resumed by hand long ago.
    if stale::is_stale(&event.reset_time, config.stale_threshold()) {
        return Directive::Discard(event);
    }

    // Unparsable times are stale by definition, so parse cannot fail here,
    // but a default keeps the decision total.
    let due = fire_time(&event, Duration::from_secs(config.post_reset_delay_sec))
        .unwrap_or(now);

    if due <= now {
        Directive::Fire(event)
    } else {
        let remaining = (due - now).to_std().unwrap_or(Duration::ZERO);
        Directive::Countdown { event, remaining }
    }
}

/// Owns the queue and drives events through the coordinator.
pub struct Scheduler {
    queue: EventQueue,
    coordinator: ResumeCoordinator,
    status: StatusBroadcaster,
    hooks: HookRegistry,
}

impl Scheduler {
    pub fn new(queue: EventQueue, coordinator: ResumeCoordinator) -> Self {
        Self {
            queue,
            coordinator,
            status: StatusBroadcaster::new(),
            hooks: HookRegistry::new(),
        }
    }

    /// Main countdown loop. Returns when `running` clears.
    pub fn run(&mut self, wake: &WakeServer, running: &AtomicBool) {
        let config = Config::get();
        self.status.broadcast_status("idle", None);

        while running.load(Ordering::Acquire) {
            // Detections land from other processes (the detect CLI); re-read
            // the document every pass so a wake actually sees the new entry
            self.queue.reload();
            match evaluate(&self.queue, Utc::now(), &config) {
                Directive::Park => {
                    wake.wait(MAX_WAIT_SLICE);
                }
                Directive::Countdown { event, remaining } => {
                    self.arm(&event);
                    if wake.wait(remaining.min(MAX_WAIT_SLICE)) {
                        log_info("scheduler", "countdown.wake", "Re-evaluating queue");
                    }
                }
                Directive::Discard(event) => {
                    log_warn(
                        "scheduler",
                        "event.stale",
                        &format!("Event {} reset_time={:?} aged out", event.id, event.reset_time),
                    );
                    if let Err(e) = self.queue.update_entry_status(&event.id, EventStatus::Failed) {
                        log_warn("scheduler", "queue.persist", &e.to_string());
                    }
                    self.hooks.fire(
                        HookPoint::StatusChange,
                        &json!({
                            "event_id": event.id,
                            "reset_time": event.reset_time,
                            "status": EventStatus::Failed.to_string(),
                        }),
                    );
                }
                Directive::Fire(event) => {
                    if self.coordinator.is_busy() {
                        // Never preempt an in-flight attempt
                        wake.wait(config.check_interval());
                        continue;
                    }
                    log_info(
                        "scheduler",
                        "event.fire",
                        &format!("Event {} due, starting resume", event.id),
                    );
                    match self.coordinator.attempt_resume(&mut self.queue, &event, running) {
                        Ok(outcome) => log_info(
                            "scheduler",
                            "event.done",
                            &format!("Event {} finished: {:?}", event.id, outcome),
                        ),
                        Err(ResumeError::DetectionStale(_)) => {
                            // Already marked failed by the coordinator
                        }
                        Err(e) => log_warn("scheduler", "event.failed", &e.to_string()),
                    }
                    self.status.broadcast_status("idle", None);
                }
            }
        }
    }

    /// Mark the selected entry as armed, once.
    fn arm(&mut self, event: &DetectionEvent) {
        if event.status == EventStatus::Waiting {
            return;
        }
        if let Err(e) = self.queue.update_entry_status(&event.id, EventStatus::Waiting) {
            log_warn("scheduler", "queue.persist", &e.to_string());
        }
        self.status.broadcast_status("waiting", Some(event));
        log_info(
            "scheduler",
            "countdown.armed",
            &format!("Event {} armed for reset_time={:?}", event.id, event.reset_time),
        );
    }
}
