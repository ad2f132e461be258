//! Nonce Clock-Skew Window
//!
//! Pure check that a caller-supplied nonce (epoch milliseconds) lies within
//! a symmetric window around server time. No store access.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::outcome::{Outcome, Rejection, Verdict};
use crate::metrics;

/// Default acceptance window
pub const DEFAULT_NONCE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Stateless nonce window validator
#[derive(Debug, Clone)]
pub struct NonceWindowValidator {
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl Default for NonceWindowValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceWindowValidator {
    /// Validator on the system clock with the default window
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Validator on the given clock with the default window
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            window: DEFAULT_NONCE_WINDOW,
        }
    }

    /// Replace the acceptance window
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Configured window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Validate against the configured window
    pub fn validate(&self, nonce_ms: i64) -> Verdict {
        self.validate_within(nonce_ms, self.window)
    }

    /// Accept iff `|now - nonce| <= window`
    pub fn validate_within(&self, nonce_ms: i64, window: Duration) -> Verdict {
        let now_ms = self.clock.now().timestamp_millis();
        let skew = i128::from(now_ms) - i128::from(nonce_ms);
        let window_ms = i128::try_from(window.as_millis()).unwrap_or(i128::MAX);

        let verdict = if skew.abs() <= window_ms {
            debug!(nonce_ms, skew_ms = %skew, "Nonce within window");
            Verdict::Accepted
        } else {
            info!(nonce_ms, skew_ms = %skew, "Nonce outside window");
            Verdict::Rejected(Rejection::NonceOutOfWindow {
                skew_ms: clamp_i64(skew),
                window_ms: clamp_i64(window_ms),
            })
        };

        let outcome = match verdict.rejection() {
            Some(rejection) => Outcome::from(rejection),
            None => Outcome::Accepted,
        };
        metrics::record_outcome("nonce_window", outcome);
        verdict
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}
