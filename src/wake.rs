//! TCP wake server for interrupting the scheduler's countdown.
//!
//! The daemon blocks on this instead of busy-polling the queue. When a new
//! detection lands or an operator runs `autoresume trigger`, the client side
//! connects briefly to the daemon's wake port, which wakes the scheduler so
//! it re-reads the queue (a fresher, earlier deadline replaces the armed
//! countdown that way).
//!
//! TCP chosen for clean poll/select integration across process boundaries.

use anyhow::{Context, Result};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// TCP wake server for countdown interrupts
pub struct WakeServer {
    listener: TcpListener,
    port: u16,
    // Set by register(); Drop removes it
    port_file: Option<PathBuf>,
}

impl WakeServer {
    /// Create a new wake server bound to localhost on an auto-assigned port
    pub fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .context("Failed to bind wake server")?;
        let port = listener.local_addr()?.port();

        // Set non-blocking for poll-based waiting
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            port,
            port_file: None,
        })
    }

    /// Get the port the server is listening on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Write the port file so clients can find us.
    pub fn register(&mut self) -> Result<()> {
        let path = crate::paths::wake_port_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, self.port.to_string())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.port_file = Some(path);
        Ok(())
    }

    /// Wait for a wake or timeout.
    ///
    /// Returns true if woken (connection received), false on timeout
    pub fn wait(&self, timeout: Duration) -> bool {
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;

        let fd = unsafe { BorrowedFd::borrow_raw(self.listener.as_raw_fd()) };
        let mut poll_fds = [PollFd::new(fd, PollFlags::POLLIN)];

        match poll(&mut poll_fds, PollTimeout::from(timeout_ms)) {
            Ok(n) if n > 0 => {
                // Drain all pending wakes
                self.drain();
                true
            }
            _ => false,
        }
    }

    /// Drain all pending connections (accept and close)
    fn drain(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    // Just accepting wakes us up; close immediately
                    drop(stream);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}

impl Drop for WakeServer {
    fn drop(&mut self) {
        if let Some(path) = self.port_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Poke the running daemon's wake port, if any. Best-effort: a daemon that
/// isn't running simply picks the new queue state up at its next start.
pub fn poke_daemon() -> bool {
    let Ok(contents) = std::fs::read_to_string(crate::paths::wake_port_path()) else {
        return false;
    };
    let Ok(port) = contents.trim().parse::<u16>() else {
        return false;
    };
    poke_port(port)
}

/// Connect-and-close against a specific port.
fn poke_port(port: u16) -> bool {
    TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(500),
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_times_out_without_wake() {
        let server = WakeServer::new().unwrap();
        let started = std::time::Instant::now();
        assert!(!server.wait(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn poke_wakes_waiter() {
        let server = WakeServer::new().unwrap();
        let port = server.port();

        let poker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            poke_port(port)
        });

        assert!(server.wait(Duration::from_secs(5)));
        assert!(poker.join().unwrap());
    }

    #[test]
    fn multiple_pokes_are_drained() {
        let server = WakeServer::new().unwrap();
        let port = server.port();

        for _ in 0..3 {
            assert!(poke_port(port));
        }

        assert!(server.wait(Duration::from_secs(1)));
        // A drained listener times out on the next short wait
        assert!(!server.wait(Duration::from_millis(50)));
    }
}
