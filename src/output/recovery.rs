//! Failure recovery — fault classification and reset pacing.
//!
//! x11rb hands errors back instead of invoking process-wide handlers, so
//! the "handlers" are the places the output layer inspects a
//! [`DisplayError`]: protocol errors are logged and swallowed, a broken
//! connection triggers a full reset of the session.

use std::time::{Duration, Instant};

use crate::display::DisplayError;

/// Default spacing between reconnect attempts while the server is gone.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// What to do about a display error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Request-level error; the connection is still good.
    Protocol,
    /// The connection is gone; tear down and re-acquire everything.
    Fatal,
}

impl Fault {
    pub fn classify(error: &DisplayError) -> Fault {
        if error.is_fatal() {
            Fault::Fatal
        } else {
            Fault::Protocol
        }
    }
}

#[derive(Debug)]
pub struct FailureRecovery {
    retry_interval: Duration,
    last_attempt: Option<Instant>,
    /// A reset failed and the session is currently down.
    pending: bool,
    resets: u64,
    protocol_errors: u64,
}

impl FailureRecovery {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            last_attempt: None,
            pending: false,
            resets: 0,
            protocol_errors: 0,
        }
    }

    /// Log a non-fatal error and keep going.
    pub fn protocol_error(&mut self, error: &DisplayError) {
        self.protocol_errors += 1;
        tracing::warn!(error = %error, total = self.protocol_errors, "X11 error ignored");
    }

    pub fn record_protocol_errors(&mut self, count: usize) {
        self.protocol_errors += count as u64;
    }

    /// Whether a reset attempt may run now. Always true right after the
    /// fault; spaced by the retry interval while the server stays away.
    pub fn should_attempt(&mut self, now: Instant) -> bool {
        if self.pending
            && let Some(last) = self.last_attempt
            && now.duration_since(last) < self.retry_interval
        {
            return false;
        }
        self.last_attempt = Some(now);
        true
    }

    pub fn reset_succeeded(&mut self) {
        self.resets += 1;
        if self.pending {
            tracing::info!(resets = self.resets, "display session restored");
        }
        self.pending = false;
    }

    pub fn reset_failed(&mut self, error: &DisplayError) {
        if !self.pending {
            tracing::error!(error = %error, "display reset failed, will retry");
        } else {
            tracing::debug!(error = %error, "display still unavailable");
        }
        self.pending = true;
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    #[cfg(test)]
    pub fn resets(&self) -> u64 {
        self.resets
    }

    #[cfg(test)]
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors
    }
}

impl Default for FailureRecovery {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL)
    }
}
