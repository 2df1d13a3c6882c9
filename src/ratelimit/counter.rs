//! Rate limit counter implementation.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{GatekeeperError, Result};

/// Counter state for a single rate limit key.
///
/// Windows are fixed and half-open: a window covers `[start, window_reset_at)`
/// and the counter starts over at `window_reset_at`. A freshly created entry
/// has its reset time at the epoch, so the first request always opens a new
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Requests admitted in the current window
    pub count: u64,
    /// When the current window expires
    pub window_reset_at: DateTime<Utc>,
    /// Most recent request seen for this key, admitted or not
    pub last_request_at: Option<DateTime<Utc>>,
}

impl Default for RateLimitEntry {
    fn default() -> Self {
        Self {
            count: 0,
            window_reset_at: DateTime::<Utc>::UNIX_EPOCH,
            last_request_at: None,
        }
    }
}

impl RateLimitEntry {
    /// Whether the current window has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }

    /// Start a new window if the current one has expired.
    ///
    /// Returns `true` if the window was rolled over.
    pub fn roll_over(&mut self, now: DateTime<Utc>, window: TimeDelta) -> Result<bool> {
        if !self.is_expired(now) {
            return Ok(false);
        }

        let reset_at = now.checked_add_signed(window).ok_or_else(|| {
            GatekeeperError::RateLimit(format!(
                "window of {}s overflows the timestamp range",
                window.num_seconds()
            ))
        })?;

        self.count = 0;
        self.window_reset_at = reset_at;
        Ok(true)
    }

    /// Record one admitted request.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.count += 1;
        self.last_request_at = Some(now);
    }

    /// Remaining quota against `limit`.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.count)
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.window_reset_at - now;
        if remaining <= TimeDelta::zero() {
            return 0;
        }

        let whole = remaining.num_seconds() as u64;
        if remaining.subsec_nanos() > 0 {
            whole + 1
        } else {
            whole
        }
    }
}
