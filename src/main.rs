//! autoresume: rate-limit auto-resume orchestrator
//!
//! Modes:
//!   autoresume daemon [run|start|stop|status]  - Countdown daemon
//!   autoresume detect [json]                   - Ingest a rate-limit detection
//!   autoresume status                          - Daemon and queue state
//!   autoresume queue                           - List queued events
//!   autoresume reset                           - Fail stale queue entries
//!   autoresume trigger                         - Resume the next pending event now
//!
//! Detections arrive as JSON: {"reset_time": "...", "timezone"?, "message"?,
//! "claude_pid"?} on argv or stdin.

mod analytics;
mod config;
mod coordinator;
mod daemon;
mod delivery;
mod hooks;
mod log;
mod notify;
mod paths;
mod queue;
mod retry;
mod scheduler;
mod stale;
mod status;
mod verify;
mod wake;

use anyhow::{Context, Result, bail};
use std::env;
use std::io::Read;
use std::panic;
use std::sync::atomic::AtomicBool;

use serde_json::json;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Action to take based on command-line arguments
#[derive(Debug, PartialEq)]
enum MainAction {
    /// Run the daemon: sub-command is run/start/stop/status
    Daemon(String),
    /// Ingest a detection, JSON from argv or stdin
    Detect(Option<String>),
    /// Show daemon and queue state
    Status,
    /// List queue entries
    Queue,
    /// Fail stale entries
    Reset,
    /// Resume the next pending event immediately
    Trigger,
    Version,
    Help,
}

/// Determine what action to take based on command-line arguments
fn determine_action(args: &[String]) -> MainAction {
    let Some(cmd) = args.get(1) else {
        return MainAction::Help;
    };

    match cmd.as_str() {
        "daemon" => MainAction::Daemon(
            args.get(2).cloned().unwrap_or_else(|| "run".to_string()),
        ),
        "detect" => MainAction::Detect(args.get(2).cloned()),
        "status" => MainAction::Status,
        "queue" => MainAction::Queue,
        "reset" => MainAction::Reset,
        "trigger" => MainAction::Trigger,
        "version" | "--version" | "-V" => MainAction::Version,
        _ => MainAction::Help,
    }
}

fn main() -> Result<()> {
    config::Config::init();

    // Panics go to the log file; stderr may be a hook pipeline that
    // expects clean JSON.
    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        log::log_error("main", "panic", &format!("{} at {}", message, location));
    }));

    let args: Vec<String> = env::args().collect();

    match determine_action(&args) {
        MainAction::Daemon(sub) => run_daemon_command(&sub),
        MainAction::Detect(arg) => run_detect(arg.as_deref()),
        MainAction::Status => run_status(),
        MainAction::Queue => run_queue(),
        MainAction::Reset => run_reset(),
        MainAction::Trigger => run_trigger(),
        MainAction::Version => {
            println!("autoresume {}", VERSION);
            Ok(())
        }
        MainAction::Help => {
            print_help();
            Ok(())
        }
    }
}

fn print_help() {
    eprintln!("autoresume {} - rate-limit auto-resume orchestrator", VERSION);
    eprintln!();
    eprintln!("Usage: autoresume <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  daemon [run|start|stop|status]  Countdown daemon");
    eprintln!("  detect [json]                   Queue a rate-limit detection (JSON argv or stdin)");
    eprintln!("  status                          Daemon and queue state");
    eprintln!("  queue                           List queued events");
    eprintln!("  reset                           Mark stale entries failed");
    eprintln!("  trigger                         Resume the next pending event now");
    eprintln!("  version                         Print version");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  AUTORESUME_DIR       Base directory (default ~/.autoresume)");
    eprintln!("  AUTORESUME_PROMPT    Resume text (default \"continue\")");
    eprintln!("  AUTORESUME_PROGRAM   Target program name (default \"claude\")");
}

fn run_daemon_command(sub: &str) -> Result<()> {
    match sub {
        "run" => daemon::run(),
        "start" => daemon::start(),
        "stop" => daemon::stop(),
        "status" => {
            match daemon::running_pid() {
                Some(pid) => println!("Daemon running (pid {})", pid),
                None => println!("Daemon not running"),
            }
            Ok(())
        }
        other => bail!("Unknown daemon sub-command: {}", other),
    }
}

/// Ingest one detection and wake the daemon.
fn run_detect(arg: Option<&str>) -> Result<()> {
    let raw = match arg {
        Some(s) if s != "-" => s.to_string(),
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read detection from stdin")?;
            buf
        }
    };

    let detection: queue::Detection =
        serde_json::from_str(raw.trim()).context("Invalid detection JSON")?;

    let mut q = queue::EventQueue::open();
    let Some(id) = q.add_detection(&detection)? else {
        println!("duplicate");
        return Ok(());
    };

    let event = q
        .entries()
        .iter()
        .find(|e| e.id == id)
        .cloned()
        .context("Queued event vanished")?;

    // Side channels never gate ingest
    match analytics::Analytics::open() {
        Ok(a) => {
            if let Err(e) = a.record_rate_limit(&event) {
                log::log_warn("detect", "analytics", &e.to_string());
            }
        }
        Err(e) => log::log_warn("detect", "analytics", &e.to_string()),
    }
    notify::notify_rate_limit(&event.reset_time);
    hooks::HookRegistry::new().fire(
        hooks::HookPoint::RateLimitDetected,
        &json!({
            "event_id": event.id,
            "reset_time": event.reset_time,
            "message": event.message,
        }),
    );

    status::StatusBroadcaster::new().broadcast_event(
        "detection",
        json!({ "event_id": event.id, "reset_time": event.reset_time }),
    );

    if wake::poke_daemon() {
        log::log_info("detect", "wake", "Daemon poked");
    }

    println!("{}", id);
    Ok(())
}

fn run_status() -> Result<()> {
    match daemon::running_pid() {
        Some(pid) => println!("daemon: running (pid {})", pid),
        None => println!("daemon: not running"),
    }

    let doc = status::StatusBroadcaster::new().read();
    println!("state: {}", doc.state);

    let q = queue::EventQueue::open();
    match q.get_next_pending() {
        Some(event) => println!(
            "next: {} reset_time={} status={}",
            event.id, event.reset_time, event.status
        ),
        None => println!("next: none"),
    }
    match q.last_hook_run() {
        Some(at) => println!("last detection: {}", at.to_rfc3339()),
        None => println!("last detection: never"),
    }

    if let Ok(a) = analytics::Analytics::open() {
        if let (Ok(limits), Ok(resumes)) = (a.count("rate_limit"), a.count("resume")) {
            println!("history: {} rate limits, {} resumes", limits, resumes);
        }
    }
    Ok(())
}

fn run_queue() -> Result<()> {
    let q = queue::EventQueue::open();
    if q.entries().is_empty() {
        println!("Queue empty");
        return Ok(());
    }
    for event in q.entries() {
        println!(
            "{}  {}  reset_time={}  detected_at={}",
            event.id,
            event.status,
            event.reset_time,
            event.detected_at.to_rfc3339()
        );
    }
    Ok(())
}

fn run_reset() -> Result<()> {
    let threshold = config::Config::get().stale_threshold();
    let mut q = queue::EventQueue::open();
    let n = q.reset_stale_entries(threshold)?;
    println!("Failed {} stale entr{}", n, if n == 1 { "y" } else { "ies" });
    if n > 0 {
        wake::poke_daemon();
    }
    Ok(())
}

/// Manual resume. A live daemon owns the single-flight flag, so defer to it;
/// otherwise run the attempt in this process.
fn run_trigger() -> Result<()> {
    if daemon::running_pid().is_some() {
        if wake::poke_daemon() {
            println!("Daemon poked; due events will fire now");
        } else {
            println!("Daemon running but wake port unreachable; check the log");
        }
        return Ok(());
    }

    let mut q = queue::EventQueue::open();
    let Some(event) = q.get_next_pending() else {
        println!("No pending events");
        return Ok(());
    };

    let running = AtomicBool::new(true);
    let mut coord = coordinator::ResumeCoordinator::new();
    match coord.attempt_resume(&mut q, &event, &running) {
        Ok(outcome) => {
            println!("Event {}: {:?}", event.id, outcome);
            Ok(())
        }
        Err(e) => {
            eprintln!("Event {}: {}", event.id, e);
            std::process::exit(1);
        }
    }
}
