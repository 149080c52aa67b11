//! Daemon lifecycle: pid file, signal handling, and the scheduler loop.
//!
//! One daemon per base directory. The pid file is both the lock and the
//! address for `stop`; liveness is checked with kill(pid, 0) so a stale
//! file left by a crash never blocks a fresh start.

use anyhow::{Context, Result, bail};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use serde_json::json;

use crate::config::Config;
use crate::coordinator::ResumeCoordinator;
use crate::hooks::{HookPoint, HookRegistry};
use crate::log::{log_info, log_warn};
use crate::queue::EventQueue;
use crate::scheduler::Scheduler;
use crate::status::StatusBroadcaster;
use crate::wake::WakeServer;

const SHUTDOWN_POLL_INTERVAL_MS: u64 = 50;
const SHUTDOWN_MAX_POLLS: u32 = 100; // 50ms * 100 = 5s total

// Cleared by the signal handlers, checked by the scheduler loop
static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_stop(_: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

/// Install one handler without SA_RESTART so blocking poll() returns EINTR
/// and the loop notices the flag.
fn setup_signal_handler(signal: Signal, handler: extern "C" fn(libc::c_int)) -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(signal, &action) }.context(format!("sigaction {:?} failed", signal))?;
    Ok(())
}

fn setup_signal_handlers() -> Result<()> {
    // SIGPIPE: a notify helper or hook closing its stdin must not kill us
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &ignore) }.context("sigaction SIGPIPE failed")?;

    setup_signal_handler(Signal::SIGTERM, handle_stop)?;
    setup_signal_handler(Signal::SIGINT, handle_stop)?;
    setup_signal_handler(Signal::SIGHUP, handle_stop)?;
    Ok(())
}

/// Pid from the pid file, if that process is still alive.
pub fn running_pid() -> Option<i32> {
    let pid = std::fs::read_to_string(crate::paths::pid_path())
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()?;
    // SAFETY: kill(pid, 0) checks process existence without sending a signal
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    alive.then_some(pid)
}

fn write_pid_file() -> Result<()> {
    let path = crate::paths::pid_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Run the daemon in the foreground until a stop signal arrives.
pub fn run() -> Result<()> {
    let config = Config::get();

    if let Some(pid) = running_pid() {
        bail!("Daemon already running (pid {})", pid);
    }
    // Clean up leftovers from a crashed instance
    let _ = std::fs::remove_file(crate::paths::pid_path());
    let _ = std::fs::remove_file(crate::paths::wake_port_path());

    setup_signal_handlers()?;
    write_pid_file()?;
    RUNNING.store(true, Ordering::Release);

    let mut wake = WakeServer::new()?;
    wake.register()?;

    log_info("daemon", "start", &format!(
        "pid={} wake_port={} base_dir={}",
        std::process::id(),
        wake.port(),
        config.base_dir.display()
    ));

    let hooks = HookRegistry::new();
    hooks.fire(
        HookPoint::DaemonStart,
        &json!({ "pid": std::process::id(), "wake_port": wake.port() }),
    );

    let mut queue = EventQueue::open();
    match queue.reset_stale_entries(config.stale_threshold()) {
        Ok(0) => {}
        Ok(n) => log_info("daemon", "startup.stale", &format!("Failed {} stale entries", n)),
        Err(e) => log_warn("daemon", "startup.stale", &e.to_string()),
    }

    let mut scheduler = Scheduler::new(queue, ResumeCoordinator::new());
    scheduler.run(&wake, &RUNNING);

    log_info("daemon", "stop", "Shutting down");
    hooks.fire(HookPoint::DaemonStop, &json!({ "pid": std::process::id() }));
    StatusBroadcaster::new().broadcast_status("stopped", None);
    let _ = std::fs::remove_file(crate::paths::pid_path());
    Ok(())
}

/// Spawn a detached daemon process. Idempotent: a live daemon stays.
pub fn start() -> Result<()> {
    if let Some(pid) = running_pid() {
        println!("Daemon already running (pid {})", pid);
        return Ok(());
    }

    let exe = std::env::current_exe().context("Failed to resolve current executable")?;
    let stderr_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(crate::paths::log_path())
        .map(std::process::Stdio::from)
        .unwrap_or_else(|_| std::process::Stdio::null());

    // New process group so a closing terminal's SIGHUP stays with the shell
    use std::os::unix::process::CommandExt;
    Command::new(exe)
        .args(["daemon", "run"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(stderr_file)
        .process_group(0)
        .spawn()
        .context("Failed to spawn daemon")?;

    println!("Daemon started");
    Ok(())
}

/// SIGTERM the running daemon and wait for it to exit, escalating to
/// SIGKILL after 5s. Stale pid files are removed either way.
pub fn stop() -> Result<()> {
    let Some(pid) = running_pid() else {
        println!("Daemon not running");
        let _ = std::fs::remove_file(crate::paths::pid_path());
        let _ = std::fs::remove_file(crate::paths::wake_port_path());
        return Ok(());
    };

    // SAFETY: pid read from the pid file and confirmed alive just above.
    // A reused pid in that window gets a SIGTERM most processes survive.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    let mut alive = true;
    for _ in 0..SHUTDOWN_MAX_POLLS {
        std::thread::sleep(Duration::from_millis(SHUTDOWN_POLL_INTERVAL_MS));
        // SAFETY: signal 0 only checks existence
        if unsafe { libc::kill(pid, 0) } == -1 {
            alive = false;
            break;
        }
    }

    if alive {
        log_warn("daemon", "stop.escalate", &format!(
            "Daemon (pid {}) ignored SIGTERM for 5s, sending SIGKILL", pid
        ));
        // SAFETY: same pid, confirmed alive through the 5s window
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }

    let _ = std::fs::remove_file(crate::paths::pid_path());
    let _ = std::fs::remove_file(crate::paths::wake_port_path());
    println!("Daemon stopped");
    Ok(())
}
