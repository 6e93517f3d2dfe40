use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::request::Request;
use crate::signal::{CancelReason, CancelToken};
use crate::util::{body_fingerprint, lock_unpoisoned};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebounceKeyStrategy {
    #[default]
    Url,
    MethodUrl,
    MethodUrlBody,
}

#[derive(Clone, Debug)]
pub struct DebouncePolicy {
    delay: Duration,
    key_strategy: DebounceKeyStrategy,
}

impl DebouncePolicy {
    pub fn standard() -> Self {
        Self {
            delay: Duration::from_millis(300),
            key_strategy: DebounceKeyStrategy::Url,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn key_strategy(mut self, key_strategy: DebounceKeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    pub(crate) fn delay_value(&self) -> Duration {
        self.delay
    }

    pub(crate) fn key(&self, request: &Request) -> String {
        match self.key_strategy {
            DebounceKeyStrategy::Url => request.url.clone(),
            DebounceKeyStrategy::MethodUrl => format!("{} {}", request.method, request.url),
            DebounceKeyStrategy::MethodUrlBody => {
                let body = request
                    .body
                    .as_ref()
                    .map(|body| body_fingerprint(&body.bytes))
                    .unwrap_or_default();
                format!("{} {} {body:016x}", request.method, request.url)
            }
        }
    }
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

pub(crate) enum DebounceOutcome {
    /// The delay elapsed without a newer call arriving; proceed.
    Dispatch { held: Duration },
    /// A newer call with the same key took over.
    Superseded,
    /// The caller's own cancellation fired while holding.
    Cancelled(CancelReason),
}

struct PendingEntry {
    sequence: u64,
    supersede: CancelToken,
}

#[derive(Default)]
pub(crate) struct Debouncer {
    pending: Mutex<HashMap<String, PendingEntry>>,
    next_sequence: AtomicU64,
}

impl Debouncer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park the call for the debounce delay. Taking over a key aborts the
    /// previously-parked call with a Debounced reason.
    pub(crate) async fn hold(
        &self,
        policy: &DebouncePolicy,
        key: &str,
        cancel: &CancelToken,
    ) -> DebounceOutcome {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let supersede = CancelToken::new();
        {
            let mut pending = lock_unpoisoned(&self.pending);
            if let Some(previous) = pending.insert(
                key.to_owned(),
                PendingEntry {
                    sequence,
                    supersede: supersede.clone(),
                },
            ) {
                previous.supersede.fire(CancelReason::Debounced);
            }
        }

        let held_from = Instant::now();
        let outcome = tokio::select! {
            biased;
            reason = cancel.cancelled() => DebounceOutcome::Cancelled(reason),
            _ = supersede.cancelled() => DebounceOutcome::Superseded,
            _ = sleep(policy.delay_value()) => DebounceOutcome::Dispatch {
                held: held_from.elapsed(),
            },
        };

        // A superseded entry already belongs to the newer call; everyone
        // else clears their own slot so the table does not accumulate keys.
        if !matches!(outcome, DebounceOutcome::Superseded) {
            let mut pending = lock_unpoisoned(&self.pending);
            if pending
                .get(key)
                .is_some_and(|entry| entry.sequence == sequence)
            {
                pending.remove(key);
            }
        }
        outcome
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        lock_unpoisoned(&self.pending).len()
    }
}
