use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;

use crate::signal::{CancelReason, CancelToken};
use crate::util::{glob_match, lock_unpoisoned};

const BUCKET_ENTRY_TTL: Duration = Duration::from_secs(300);
const BUCKET_MAX_ENTRIES: usize = 1024;

/// What a bucket is keyed by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RateLimitScope {
    /// One bucket for the whole client.
    #[default]
    Global,
    /// One bucket per URL host.
    Domain,
    /// One bucket per method + query-stripped path.
    Endpoint,
}

#[derive(Clone, Debug)]
pub struct RateLimitPolicy {
    rate_per_second: f64,
    burst: usize,
    scope: RateLimitScope,
    include: Vec<String>,
    exclude: Vec<String>,
    max_throttle_delay: Duration,
}

impl RateLimitPolicy {
    pub fn standard() -> Self {
        Self {
            rate_per_second: 50.0,
            burst: 50,
            scope: RateLimitScope::Global,
            include: Vec::new(),
            exclude: Vec::new(),
            max_throttle_delay: Duration::from_secs(30),
        }
    }

    pub fn rate_per_second(mut self, rate_per_second: f64) -> Self {
        self.rate_per_second = if rate_per_second.is_finite() && rate_per_second > 0.0 {
            rate_per_second
        } else {
            1.0
        };
        self
    }

    pub fn burst(mut self, burst: usize) -> Self {
        self.burst = burst.max(1);
        self
    }

    pub fn scope(mut self, scope: RateLimitScope) -> Self {
        self.scope = scope;
        self
    }

    /// Glob patterns over the endpoint key (`"GET /v1/users/*"`); when any
    /// are set, only matching calls are rate-limited.
    pub fn include(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Glob patterns over the endpoint key; matching calls bypass the
    /// limiter entirely.
    pub fn exclude(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_throttle_delay(mut self, max_throttle_delay: Duration) -> Self {
        self.max_throttle_delay = max_throttle_delay;
        self
    }

    fn rate_per_ms(&self) -> f64 {
        self.rate_per_second / 1000.0
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_at: Instant,
    throttle_until: Option<Instant>,
    last_used_at: Instant,
}

impl BucketState {
    fn new(policy: &RateLimitPolicy, now: Instant) -> Self {
        Self {
            tokens: policy.burst as f64,
            last_refill_at: now,
            throttle_until: None,
            last_used_at: now,
        }
    }

    fn refill(&mut self, policy: &RateLimitPolicy, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        self.tokens = (self.tokens + elapsed_secs * policy.rate_per_second).min(policy.burst as f64);
        if let Some(throttle_until) = self.throttle_until
            && now >= throttle_until
        {
            self.throttle_until = None;
        }
    }

    /// Zero when a token was consumed; otherwise how long to wait before
    /// re-evaluating.
    fn try_consume(&mut self, policy: &RateLimitPolicy, now: Instant) -> Duration {
        self.refill(policy, now);
        self.last_used_at = now;
        if let Some(throttle_until) = self.throttle_until
            && now < throttle_until
        {
            return throttle_until.saturating_duration_since(now);
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Duration::ZERO;
        }
        let rate = policy.rate_per_ms();
        if rate <= f64::EPSILON {
            return Duration::from_secs(60);
        }
        let needed = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64((needed / rate) / 1000.0)
    }

    fn apply_throttle(&mut self, policy: &RateLimitPolicy, now: Instant, delay: Duration) {
        let capped = delay.min(policy.max_throttle_delay);
        if capped.is_zero() {
            return;
        }
        let throttle_until = now + capped;
        self.throttle_until = Some(match self.throttle_until {
            Some(existing) => existing.max(throttle_until),
            None => throttle_until,
        });
    }
}

#[derive(Debug)]
struct Bucket {
    // Waiters hold this across their sleep so admission stays FIFO; the
    // tokio mutex hands the lock to queued waiters in arrival order.
    admission: AsyncMutex<()>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
pub(crate) struct RateLimiter {
    policy: RateLimitPolicy,
    buckets: Mutex<BTreeMap<String, Arc<Bucket>>>,
}

impl RateLimiter {
    pub(crate) fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn is_subject(&self, endpoint: &str) -> bool {
        if !self.policy.include.is_empty()
            && !self
                .policy
                .include
                .iter()
                .any(|pattern| glob_match(pattern, endpoint))
        {
            return false;
        }
        !self
            .policy
            .exclude
            .iter()
            .any(|pattern| glob_match(pattern, endpoint))
    }

    pub(crate) fn bucket_key(&self, domain: &str, endpoint: &str) -> String {
        match self.policy.scope {
            RateLimitScope::Global => "global".to_owned(),
            RateLimitScope::Domain => domain.to_owned(),
            RateLimitScope::Endpoint => endpoint.to_owned(),
        }
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        let now = Instant::now();
        let mut buckets = lock_unpoisoned(&self.buckets);
        cleanup_stale_buckets(&mut buckets, now);
        Arc::clone(buckets.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(Bucket {
                admission: AsyncMutex::new(()),
                state: Mutex::new(BucketState::new(&self.policy, now)),
            })
        }))
    }

    /// Take one token from the bucket for `key`, waiting FIFO behind
    /// earlier callers when the bucket is dry. Cancellation while queued
    /// or sleeping returns the reason without consuming a token.
    pub(crate) async fn admit(
        &self,
        key: &str,
        cancel: &CancelToken,
        mut on_first_wait: impl FnMut(Duration),
    ) -> Result<Duration, CancelReason> {
        let bucket = self.bucket(key);
        let _admission = tokio::select! {
            guard = bucket.admission.lock() => guard,
            reason = cancel.cancelled() => return Err(reason),
        };
        let queued_at = Instant::now();
        let mut first_wait = true;
        loop {
            let wait = {
                let mut state = lock_unpoisoned(&bucket.state);
                state.try_consume(&self.policy, Instant::now())
            };
            if wait.is_zero() {
                return Ok(queued_at.elapsed());
            }
            if first_wait {
                first_wait = false;
                on_first_wait(wait);
            }
            tokio::select! {
                _ = sleep(wait) => {}
                reason = cancel.cancelled() => return Err(reason),
            }
        }
    }

    /// Feed a server-directed throttle (429 Retry-After) back into the
    /// bucket so queued callers respect it.
    pub(crate) fn observe_server_throttle(&self, domain: &str, endpoint: &str, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let key = self.bucket_key(domain, endpoint);
        let bucket = self.bucket(&key);
        let mut state = lock_unpoisoned(&bucket.state);
        state.apply_throttle(&self.policy, Instant::now(), delay);
    }
}

fn cleanup_stale_buckets(buckets: &mut BTreeMap<String, Arc<Bucket>>, now: Instant) {
    buckets.retain(|_, bucket| {
        if Arc::strong_count(bucket) > 1 {
            return true;
        }
        let state = lock_unpoisoned(&bucket.state);
        now.duration_since(state.last_used_at) <= BUCKET_ENTRY_TTL
    });

    while buckets.len() > BUCKET_MAX_ENTRIES {
        let oldest_key = buckets
            .iter()
            .filter(|(_, bucket)| Arc::strong_count(bucket) == 1)
            .min_by_key(|(_, bucket)| lock_unpoisoned(&bucket.state).last_used_at)
            .map(|(key, _)| key.clone());
        let Some(oldest_key) = oldest_key else {
            break;
        };
        buckets.remove(&oldest_key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{BucketState, RateLimitPolicy, RateLimitScope, RateLimiter};

    #[test]
    fn refill_clamps_to_burst() {
        let policy = RateLimitPolicy::standard().rate_per_second(10.0).burst(2);
        let start = Instant::now();
        let mut state = BucketState::new(&policy, start);
        state.tokens = 0.0;
        state.refill(&policy, start + Duration::from_secs(60));
        assert!((state.tokens - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn try_consume_reports_wait_when_dry() {
        let policy = RateLimitPolicy::standard().rate_per_second(2.0).burst(1);
        let start = Instant::now();
        let mut state = BucketState::new(&policy, start);
        assert_eq!(state.try_consume(&policy, start), Duration::ZERO);
        let wait = state.try_consume(&policy, start);
        assert!(wait >= Duration::from_millis(400));
        assert!(wait <= Duration::from_millis(600));
    }

    #[test]
    fn throttle_extends_wait() {
        let policy = RateLimitPolicy::standard().rate_per_second(100.0).burst(10);
        let start = Instant::now();
        let mut state = BucketState::new(&policy, start);
        state.apply_throttle(&policy, start, Duration::from_millis(200));
        let wait = state.try_consume(&policy, start + Duration::from_millis(10));
        assert!(wait >= Duration::from_millis(150));
    }

    #[test]
    fn include_and_exclude_filters_gate_subjection() {
        let limiter = RateLimiter::new(
            RateLimitPolicy::standard()
                .include(["GET /v1/*"])
                .exclude(["GET /v1/health"]),
        );
        assert!(limiter.is_subject("GET /v1/users"));
        assert!(!limiter.is_subject("GET /v1/health"));
        assert!(!limiter.is_subject("POST /v2/users"));
    }

    #[test]
    fn bucket_key_follows_scope() {
        let limiter = RateLimiter::new(RateLimitPolicy::standard().scope(RateLimitScope::Domain));
        assert_eq!(
            limiter.bucket_key("api.example.com", "GET /v1/users"),
            "api.example.com"
        );
        let limiter = RateLimiter::new(RateLimitPolicy::standard().scope(RateLimitScope::Endpoint));
        assert_eq!(
            limiter.bucket_key("api.example.com", "GET /v1/users"),
            "GET /v1/users"
        );
    }
}
