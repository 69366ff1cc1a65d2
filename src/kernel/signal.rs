//! Shutdown signalling for the judge process.
//!
//! SIGINT, SIGTERM and SIGHUP only store into atomics. The reconnect loop
//! and the connection watcher poll [`should_continue`] and unwind normally,
//! aborting any grade in flight on the way out.

use crate::config::types::{JudgeError, Result};
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];
const POLL_INTERVAL: Duration = Duration::from_millis(100);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_shutdown_signal(signo: libc::c_int) {
    LAST_SIGNAL.store(signo, Ordering::SeqCst);
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Proof that the shutdown handlers are installed
pub struct SignalHandler {
    _installed: (),
}

impl SignalHandler {
    /// Install the handlers. Call before the first connection is opened.
    pub fn init() -> Result<Self> {
        // No SA_RESTART: a blocking socket read must see EINTR
        let action = SigAction::new(
            SigHandler::Handler(on_shutdown_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signo in SHUTDOWN_SIGNALS {
            // SAFETY: the handler stores into two atomics and nothing else.
            let installed = unsafe { signal::sigaction(signo, &action) };
            installed.map_err(|e| JudgeError::Internal(format!("cannot handle {}: {}", signo, e)))?;
        }
        // A vanished server must surface as EPIPE on write
        // SAFETY: SIG_IGN installs no code.
        let ignored = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) };
        ignored.map_err(|e| JudgeError::Internal(format!("cannot ignore SIGPIPE: {}", e)))?;

        info!(
            "Handling {}",
            SHUTDOWN_SIGNALS.map(|signo| signo.as_str()).join(", ")
        );
        Ok(Self { _installed: () })
    }

    pub fn shutdown_requested(&self) -> bool {
        !should_continue()
    }

    /// Last shutdown signal delivered, if any
    pub fn received(&self) -> Option<Signal> {
        match LAST_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            signo => Signal::try_from(signo).ok(),
        }
    }

    /// Name of the last signal for log lines, `none` if nothing arrived
    pub fn describe(&self) -> &'static str {
        self.received().map_or("none", Signal::as_str)
    }

    /// Sleep up to `timeout`; true as soon as a shutdown is requested
    pub fn wait_for_signal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.shutdown_requested() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
        true
    }
}

/// False once a shutdown signal has arrived
pub fn should_continue() -> bool {
    !SHUTDOWN.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_install() {
        assert!(SignalHandler::init().is_ok());
    }

    #[test]
    fn test_wait_returns_false_on_timeout() {
        let handler = SignalHandler::init().unwrap();
        if handler.shutdown_requested() {
            return;
        }
        let start = Instant::now();
        assert!(!handler.wait_for_signal(Duration::from_millis(250)));
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(handler.received(), None);
        assert_eq!(handler.describe(), "none");
    }
}
