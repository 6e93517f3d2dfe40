use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::Method;
use rand::Rng;

use crate::error::{Error, ErrorKind};
use crate::util::parse_retry_after;

/// Inputs to a should-retry decision, either the default rules or a
/// user-supplied classifier.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub url: String,
    pub kind: ErrorKind,
    pub status: Option<u16>,
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&RetryDecision) -> bool + Send + Sync,
{
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        self(decision)
    }
}

/// Delay schedule between attempts. Every flavor receives the 1-based
/// retry index and the policy's base delay and returns a non-negative
/// delay; the policy-level cap clamps the result.
#[derive(Clone)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential { multiplier: f64 },
    Fibonacci,
    FullJitter,
    ExponentialJitter { ratio: f64 },
    Custom(Arc<dyn Fn(usize, Duration) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => formatter.write_str("Fixed"),
            Self::Linear => formatter.write_str("Linear"),
            Self::Exponential { multiplier } => formatter
                .debug_struct("Exponential")
                .field("multiplier", multiplier)
                .finish(),
            Self::Fibonacci => formatter.write_str("Fibonacci"),
            Self::FullJitter => formatter.write_str("FullJitter"),
            Self::ExponentialJitter { ratio } => formatter
                .debug_struct("ExponentialJitter")
                .field("ratio", ratio)
                .finish(),
            Self::Custom(_) => formatter.write_str("Custom"),
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base_delay: Duration,
    backoff: Backoff,
    max_delay: Option<Duration>,
    retryable_status_codes: BTreeSet<u16>,
    retry_non_idempotent: bool,
    classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("backoff", &self.backoff)
            .field("max_delay", &self.max_delay)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("retry_non_idempotent", &self.retry_non_idempotent)
            .finish()
    }
}

impl RetryPolicy {
    /// One original attempt, no retries.
    pub fn disabled() -> Self {
        Self::standard().max_retries(0)
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            max_delay: Some(Duration::from_secs(2)),
            retryable_status_codes: default_retryable_status_codes(),
            retry_non_idempotent: false,
            classifier: None,
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn no_max_delay(mut self) -> Self {
        self.max_delay = None;
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Opt non-idempotent methods into status-based retries. Timeout and
    /// network failures stay idempotent-only regardless.
    pub fn retry_non_idempotent(mut self, allow: bool) -> Self {
        self.retry_non_idempotent = allow;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Attempts including the original: retries + 1.
    pub(crate) fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    pub(crate) fn should_retry(&self, decision: &RetryDecision) -> bool {
        if let Some(classifier) = &self.classifier {
            return classifier.should_retry(decision);
        }
        match decision.kind {
            ErrorKind::Abort | ErrorKind::Parse | ErrorKind::Plugin => false,
            ErrorKind::Timeout | ErrorKind::Network => is_idempotent(&decision.method),
            ErrorKind::Http => {
                let retryable_status = decision
                    .status
                    .is_some_and(|status| self.retryable_status_codes.contains(&status));
                retryable_status && (is_idempotent(&decision.method) || self.retry_non_idempotent)
            }
        }
    }

    pub(crate) fn delay_for_retry(&self, retry_index: usize) -> Duration {
        let retry_index = retry_index.max(1);
        let base_ms = self.base_delay.as_millis();
        let raw_ms: u128 = match &self.backoff {
            Backoff::Fixed => base_ms,
            Backoff::Linear => base_ms.saturating_mul(retry_index as u128),
            Backoff::Exponential { multiplier } => {
                scaled_ms(base_ms, multiplier.max(1.0).powi(exponent(retry_index)))
            }
            Backoff::Fibonacci => base_ms.saturating_mul(fibonacci(retry_index)),
            Backoff::FullJitter => {
                let ceiling = scaled_ms(base_ms, 2.0_f64.powi(exponent(retry_index))).max(1);
                let mut rng = rand::rng();
                rng.random_range(0..=ceiling)
            }
            Backoff::ExponentialJitter { ratio } => {
                let delay = scaled_ms(base_ms, 2.0_f64.powi(exponent(retry_index)));
                jittered_ms(delay, ratio.clamp(0.0, 1.0))
            }
            Backoff::Custom(delay_fn) => delay_fn(retry_index, self.base_delay).as_millis(),
        };
        let capped_ms = match self.max_delay {
            Some(cap) => raw_ms.min(cap.as_millis()),
            None => raw_ms,
        };
        Duration::from_millis(capped_ms.min(u64::MAX as u128) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn exponent(retry_index: usize) -> i32 {
    retry_index.saturating_sub(1).min(31) as i32
}

fn scaled_ms(base_ms: u128, factor: f64) -> u128 {
    let scaled = (base_ms as f64) * factor;
    if !scaled.is_finite() || scaled < 0.0 {
        return u128::MAX;
    }
    scaled.round() as u128
}

fn jittered_ms(delay_ms: u128, ratio: f64) -> u128 {
    if ratio <= f64::EPSILON || delay_ms <= 1 {
        return delay_ms;
    }
    let span = ((delay_ms as f64) * ratio).round().max(1.0) as u128;
    let low = delay_ms.saturating_sub(span);
    let high = delay_ms.saturating_add(span).max(low);
    let mut rng = rand::rng();
    rng.random_range(low..=high)
}

fn fibonacci(index: usize) -> u128 {
    let mut previous: u128 = 0;
    let mut current: u128 = 1;
    for _ in 1..index {
        let next = previous.saturating_add(current);
        previous = current;
        current = next;
    }
    current
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 409, 425, 429, 500, 502, 503, 504]
        .into_iter()
        .collect()
}

pub(crate) fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}

/// Server-directed retry delay from the failed attempt's Retry-After
/// header. Zero (including an unparseable value) falls through to backoff.
pub(crate) fn retry_after_delay(error: &Error, now: SystemTime) -> Option<Duration> {
    let response = error.response()?;
    match parse_retry_after(&response.headers, now) {
        Some(delay) if !delay.is_zero() => Some(delay),
        _ => None,
    }
}
