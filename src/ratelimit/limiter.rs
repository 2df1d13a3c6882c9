//! Core rate limiter implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::backend::RateLimitBackend;
use super::clock::{Clock, SystemClock};
use super::counter::RateLimitEntry;
use super::key::{EndpointClass, RateLimitKey};
use super::rules::{RateLimitPolicy, RateLimitRules};
use crate::error::{GatekeeperError, Result};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// The `max_requests` of the policy that was applied
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Seconds until the window resets; only set on denial
    pub retry_after_seconds: Option<u64>,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
}

impl Decision {
    /// Reset time as whole seconds since the Unix epoch.
    pub fn reset_epoch_seconds(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// The in-memory rate limiter.
///
/// Counters live in a sharded map keyed by endpoint class and client. A check
/// holds the shard lock for its key for the whole read-modify-write, so
/// concurrent checks on one key are serialized while other keys proceed.
///
/// Windows are fixed, not sliding: a burst straddling a window boundary can
/// be admitted up to twice the limit within one window length of real time.
/// State is process-local and is lost on restart.
pub struct RateLimiter {
    /// Counters indexed by key
    entries: DashMap<RateLimitKey, RateLimitEntry>,
    /// Policy and route tables
    rules: RateLimitRules,
    /// Time source
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter using the system clock.
    pub fn new(rules: RateLimitRules) -> Self {
        Self::with_clock(rules, Arc::new(SystemClock))
    }

    /// Create a new rate limiter with an explicit time source.
    pub fn with_clock(rules: RateLimitRules, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            rules,
            clock,
        }
    }

    /// The rules this limiter enforces.
    pub fn rules(&self) -> &RateLimitRules {
        &self.rules
    }

    fn policy(&self, class: EndpointClass) -> Result<RateLimitPolicy> {
        self.rules.policy_for(class).copied().ok_or_else(|| {
            GatekeeperError::Config(format!(
                "no policy for class '{}' and no general fallback",
                class
            ))
        })
    }

    /// Check the rate limit for a client on an endpoint class.
    ///
    /// Admitted requests are counted; denied requests are not.
    pub fn check_and_record(&self, client: &str, class: EndpointClass) -> Result<Decision> {
        let policy = self.policy(class)?;
        let window = policy.window()?;
        let key = RateLimitKey::new(class, client);

        trace!(key = %key, "Checking rate limit");

        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
            debug!(
                key = %key,
                limit = policy.max_requests,
                window_seconds = policy.window_seconds,
                "Creating new rate limit entry"
            );
            RateLimitEntry::default()
        });

        // Read the clock under the shard lock so concurrent callers on this
        // key observe time in the same order as they observe the counter.
        let now = self.clock.now();

        if entry.roll_over(now, window)? {
            trace!(key = %key, reset_at = %entry.window_reset_at, "Started new window");
        }

        if entry.count >= policy.max_requests {
            entry.last_request_at = Some(now);
            let retry_after = entry.seconds_until_reset(now);
            debug!(key = %key, retry_after, "Rate limit exceeded");

            return Ok(Decision {
                admitted: false,
                limit: policy.max_requests,
                remaining: 0,
                retry_after_seconds: Some(retry_after),
                reset_at: entry.window_reset_at,
            });
        }

        entry.record(now);

        Ok(Decision {
            admitted: true,
            limit: policy.max_requests,
            remaining: entry.remaining(policy.max_requests),
            retry_after_seconds: None,
            reset_at: entry.window_reset_at,
        })
    }

    /// Report the current state for a key without recording a request.
    ///
    /// `remaining` is the unused quota right now, and `admitted` says whether
    /// a request made now would be admitted.
    pub fn peek(&self, client: &str, class: EndpointClass) -> Result<Decision> {
        let policy = self.policy(class)?;
        let window = policy.window()?;
        let key = RateLimitKey::new(class, client);

        let mut entry = self
            .entries
            .get(&key)
            .map(|entry| *entry)
            .unwrap_or_default();
        let now = self.clock.now();
        entry.roll_over(now, window)?;

        let admitted = entry.count < policy.max_requests;
        Ok(Decision {
            admitted,
            limit: policy.max_requests,
            remaining: entry.remaining(policy.max_requests),
            retry_after_seconds: (!admitted).then(|| entry.seconds_until_reset(now)),
            reset_at: entry.window_reset_at,
        })
    }

    /// Forget the counter for a key, e.g. after a successful login.
    ///
    /// Returns `true` if an entry was removed.
    pub fn clear(&self, client: &str, class: EndpointClass) -> bool {
        let key = RateLimitKey::new(class, client);
        let removed = self.entries.remove(&key).is_some();
        if removed {
            debug!(key = %key, "Cleared rate limit entry");
        }
        removed
    }

    /// Get the admitted count in the current window for a key.
    ///
    /// Returns `None` if no entry exists for the key.
    pub fn current_count(&self, client: &str, class: EndpointClass) -> Option<u64> {
        let key = RateLimitKey::new(class, client);
        let now = self.clock.now();
        self.entries
            .get(&key)
            .map(|entry| if entry.is_expired(now) { 0 } else { entry.count })
    }

    /// Remove every entry whose window has expired.
    ///
    /// The map is locked one shard at a time, so checks on keys in other
    /// shards keep running during a sweep. Returns the number of entries
    /// removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        debug!(removed, remaining = self.entries.len(), "Swept expired rate limit entries");
        removed
    }

    /// Spawn a task that calls [`sweep_expired`](Self::sweep_expired) every
    /// `every`.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep_expired();
            }
        })
    }

    /// Clear all entries.
    pub fn reset(&self) {
        self.entries.clear();
    }

    /// Get the number of tracked entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitRules::default())
    }
}

#[async_trait]
impl RateLimitBackend for RateLimiter {
    async fn check_and_record(&self, client: &str, class: EndpointClass) -> Result<Decision> {
        RateLimiter::check_and_record(self, client, class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::rules::RouteRule;
    use chrono::TimeDelta;
    use std::collections::HashMap;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn create_test_limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = RateLimiter::with_clock(RateLimitRules::default(), clock.clone());
        (limiter, clock)
    }

    fn single_request_rules() -> RateLimitRules {
        let policies = HashMap::from([
            (EndpointClass::General, RateLimitPolicy::new(20, 60)),
            (EndpointClass::Login, RateLimitPolicy::new(1, 60)),
        ]);
        RateLimitRules::new(
            policies,
            vec![RouteRule::new("/auth/login", EndpointClass::Login)],
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_check_creates_entry() {
        let (limiter, _) = create_test_limiter();

        let decision = limiter
            .check_and_record("1.2.3.4", EndpointClass::General)
            .unwrap();

        assert!(decision.admitted);
        assert_eq!(limiter.entry_count(), 1);
        assert_eq!(limiter.current_count("1.2.3.4", EndpointClass::General), Some(1));
    }

    #[test]
    fn test_login_scenario() {
        let (limiter, _) = create_test_limiter();

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = limiter
                .check_and_record("1.2.3.4", EndpointClass::Login)
                .unwrap();
            assert!(decision.admitted);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.retry_after_seconds, None);
        }

        let decision = limiter
            .check_and_record("1.2.3.4", EndpointClass::Login)
            .unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_seconds, Some(300));
        assert_eq!(decision.reset_epoch_seconds(), start().timestamp() + 300);
    }

    #[test]
    fn test_denied_calls_do_not_count() {
        let (limiter, _) = create_test_limiter();

        for _ in 0..3 {
            limiter
                .check_and_record("client", EndpointClass::Register)
                .unwrap();
        }
        for _ in 0..10 {
            let decision = limiter
                .check_and_record("client", EndpointClass::Register)
                .unwrap();
            assert!(!decision.admitted);
        }

        assert_eq!(limiter.current_count("client", EndpointClass::Register), Some(3));
    }

    #[test]
    fn test_window_rollover_after_exact_window() {
        let (limiter, clock) = create_test_limiter();

        for _ in 0..5 {
            limiter.check_and_record("1.2.3.4", EndpointClass::Login).unwrap();
        }
        assert!(!limiter
            .check_and_record("1.2.3.4", EndpointClass::Login)
            .unwrap()
            .admitted);

        clock.advance(TimeDelta::seconds(300));

        let decision = limiter
            .check_and_record("1.2.3.4", EndpointClass::Login)
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 4);
        assert_eq!(limiter.current_count("1.2.3.4", EndpointClass::Login), Some(1));
        assert_eq!(decision.reset_epoch_seconds(), start().timestamp() + 600);
    }

    #[test]
    fn test_window_not_rolled_before_reset() {
        let (limiter, clock) = create_test_limiter();

        for _ in 0..5 {
            limiter.check_and_record("1.2.3.4", EndpointClass::Login).unwrap();
        }
        clock.advance(TimeDelta::seconds(299));

        let decision = limiter
            .check_and_record("1.2.3.4", EndpointClass::Login)
            .unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after_seconds, Some(1));
    }

    #[test]
    fn test_remaining_never_negative() {
        let (limiter, _) = create_test_limiter();

        for _ in 0..30 {
            let decision = limiter
                .check_and_record("client", EndpointClass::General)
                .unwrap();
            assert!(decision.remaining <= decision.limit);
            if decision.admitted {
                let count = limiter
                    .current_count("client", EndpointClass::General)
                    .unwrap();
                assert_eq!(decision.remaining, decision.limit - count);
            }
        }
    }

    #[test]
    fn test_distinct_keys_have_separate_counters() {
        let (limiter, _) = create_test_limiter();

        for _ in 0..5 {
            limiter.check_and_record("1.1.1.1", EndpointClass::Login).unwrap();
        }

        let other_client = limiter
            .check_and_record("2.2.2.2", EndpointClass::Login)
            .unwrap();
        assert!(other_client.admitted);
        assert_eq!(other_client.remaining, 4);

        let other_class = limiter
            .check_and_record("1.1.1.1", EndpointClass::Chat)
            .unwrap();
        assert!(other_class.admitted);
        assert_eq!(other_class.remaining, 59);

        assert_eq!(limiter.current_count("1.1.1.1", EndpointClass::Login), Some(5));
        assert_eq!(limiter.entry_count(), 3);
    }

    #[test]
    fn test_missing_policy_uses_general() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = RateLimiter::with_clock(single_request_rules(), clock);

        let decision = limiter
            .check_and_record("client", EndpointClass::Chat)
            .unwrap();
        assert_eq!(decision.limit, 20);
        assert_eq!(decision.remaining, 19);
    }

    #[test]
    fn test_window_overflow_is_an_error() {
        let clock = Arc::new(ManualClock::new(DateTime::<Utc>::MAX_UTC));
        let limiter = RateLimiter::with_clock(RateLimitRules::default(), clock);

        let result = limiter.check_and_record("client", EndpointClass::Chat);
        assert!(matches!(result, Err(GatekeeperError::RateLimit(_))));
    }

    #[test]
    fn test_peek_does_not_record() {
        let (limiter, _) = create_test_limiter();

        let decision = limiter.peek("client", EndpointClass::Login).unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 5);
        assert_eq!(limiter.entry_count(), 0);

        for _ in 0..5 {
            limiter.check_and_record("client", EndpointClass::Login).unwrap();
        }

        let decision = limiter.peek("client", EndpointClass::Login).unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_seconds, Some(300));
        assert_eq!(limiter.current_count("client", EndpointClass::Login), Some(5));
    }

    #[test]
    fn test_clear_resets_key() {
        let (limiter, _) = create_test_limiter();

        for _ in 0..5 {
            limiter.check_and_record("client", EndpointClass::Login).unwrap();
        }
        assert!(limiter.clear("client", EndpointClass::Login));
        assert!(!limiter.clear("client", EndpointClass::Login));

        let decision = limiter
            .check_and_record("client", EndpointClass::Login)
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_sweep_removes_only_expired_entries() {
        let (limiter, clock) = create_test_limiter();

        limiter.check_and_record("a", EndpointClass::General).unwrap();
        limiter.check_and_record("b", EndpointClass::Login).unwrap();
        assert_eq!(limiter.sweep_expired(), 0);

        // General windows are 60s, login windows 300s.
        clock.advance(TimeDelta::seconds(61));
        assert_eq!(limiter.sweep_expired(), 1);
        assert_eq!(limiter.entry_count(), 1);
        assert_eq!(limiter.current_count("a", EndpointClass::General), None);
        assert_eq!(limiter.current_count("b", EndpointClass::Login), Some(1));

        clock.advance(TimeDelta::seconds(300));
        assert_eq!(limiter.sweep_expired(), 1);
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let (limiter, _) = create_test_limiter();

        limiter.check_and_record("a", EndpointClass::General).unwrap();
        limiter.check_and_record("b", EndpointClass::Chat).unwrap();
        assert_eq!(limiter.entry_count(), 2);

        limiter.reset();
        assert_eq!(limiter.entry_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_exactly_one() {
        let limiter = Arc::new(RateLimiter::new(single_request_rules()));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter
                        .check_and_record("racer", EndpointClass::Login)
                        .unwrap()
                        .admitted
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(limiter.current_count("racer", EndpointClass::Login), Some(1));
    }

    #[tokio::test]
    async fn test_backend_trait_delegates() {
        let (limiter, _) = create_test_limiter();
        let backend: &dyn RateLimitBackend = &limiter;

        let decision = backend
            .check_and_record("client", EndpointClass::Chat)
            .await
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(limiter.current_count("client", EndpointClass::Chat), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let (limiter, clock) = create_test_limiter();
        let limiter = Arc::new(limiter);

        limiter.check_and_record("a", EndpointClass::General).unwrap();
        clock.advance(TimeDelta::seconds(120));

        let handle = limiter.spawn_sweeper(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(limiter.entry_count(), 0);
        handle.abort();
    }
}
