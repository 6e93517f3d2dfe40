use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::Method;
use tokio::sync::Notify;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::signal::{CancelReason, CancelToken};
use crate::util::{body_fingerprint, lock_unpoisoned};

/// How a dedup key is derived from a request.
#[derive(Clone)]
pub enum DedupKeyStrategy {
    Url,
    UrlMethod,
    UrlMethodBody,
    Custom(Arc<dyn Fn(&Request) -> String + Send + Sync>),
}

impl std::fmt::Debug for DedupKeyStrategy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url => formatter.write_str("Url"),
            Self::UrlMethod => formatter.write_str("UrlMethod"),
            Self::UrlMethodBody => formatter.write_str("UrlMethodBody"),
            Self::Custom(_) => formatter.write_str("Custom"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DedupPolicy {
    key_strategy: DedupKeyStrategy,
    methods: Vec<Method>,
    cache_ttl: Duration,
    max_cache_entries: usize,
}

impl DedupPolicy {
    /// In-flight coalescing for GET/HEAD, no result cache.
    pub fn standard() -> Self {
        Self {
            key_strategy: DedupKeyStrategy::UrlMethod,
            methods: vec![Method::GET, Method::HEAD],
            cache_ttl: Duration::ZERO,
            max_cache_entries: 128,
        }
    }

    pub fn key_strategy(mut self, key_strategy: DedupKeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Keep a leader's successful response around for this long after
    /// completion. Zero keeps only in-flight coalescing.
    pub fn cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn max_cache_entries(mut self, max_cache_entries: usize) -> Self {
        self.max_cache_entries = max_cache_entries.max(1);
        self
    }

    pub(crate) fn applies(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    pub(crate) fn key(&self, request: &Request) -> String {
        match &self.key_strategy {
            DedupKeyStrategy::Url => request.url.clone(),
            DedupKeyStrategy::UrlMethod => format!("{} {}", request.method, request.url),
            DedupKeyStrategy::UrlMethodBody => {
                let body = request
                    .body
                    .as_ref()
                    .map(|body| body_fingerprint(&body.bytes))
                    .unwrap_or_default();
                format!("{} {} {body:016x}", request.method, request.url)
            }
            DedupKeyStrategy::Custom(key_fn) => key_fn(request),
        }
    }
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// One-shot broadcast cell the leader publishes into and every observer
/// (leader caller included) waits on.
pub(crate) struct InFlightCall {
    cell: Mutex<Option<Result<Response, Error>>>,
    done: Notify,
    observers: AtomicUsize,
    leader_cancel: CancelToken,
}

impl InFlightCall {
    fn new() -> Self {
        Self {
            cell: Mutex::new(None),
            done: Notify::new(),
            observers: AtomicUsize::new(1),
            leader_cancel: CancelToken::new(),
        }
    }

    /// Token the leader's execution runs under. Fired only when the last
    /// observer detaches, so a follower leaving never kills a shared call.
    pub(crate) fn leader_cancel(&self) -> &CancelToken {
        &self.leader_cancel
    }
}

pub(crate) enum DedupRole {
    Cached(Response),
    Leader(Arc<InFlightCall>),
    Follower(Arc<InFlightCall>),
}

struct CacheEntry {
    response: Response,
    completed_at: Instant,
    last_used_at: Instant,
}

#[derive(Default)]
pub(crate) struct Deduplicator {
    in_flight: Mutex<HashMap<String, Arc<InFlightCall>>>,
    cache: Mutex<BTreeMap<String, CacheEntry>>,
}

impl Deduplicator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attach to the in-flight leader for `key`, serve from the result
    /// cache, or become the leader.
    pub(crate) fn join_or_lead(&self, policy: &DedupPolicy, key: &str) -> DedupRole {
        if !policy.cache_ttl.is_zero() {
            let now = Instant::now();
            let mut cache = lock_unpoisoned(&self.cache);
            cache.retain(|_, entry| now.duration_since(entry.completed_at) < policy.cache_ttl);
            if let Some(entry) = cache.get_mut(key) {
                entry.last_used_at = now;
                return DedupRole::Cached(entry.response.clone());
            }
        }

        let mut in_flight = lock_unpoisoned(&self.in_flight);
        match in_flight.get(key) {
            Some(entry) => {
                entry.observers.fetch_add(1, Ordering::AcqRel);
                DedupRole::Follower(Arc::clone(entry))
            }
            None => {
                let entry = Arc::new(InFlightCall::new());
                in_flight.insert(key.to_owned(), Arc::clone(&entry));
                DedupRole::Leader(entry)
            }
        }
    }

    /// Called by the leader task when its execution finishes: wake every
    /// observer and, for successes, feed the TTL cache.
    pub(crate) fn publish(
        &self,
        policy: &DedupPolicy,
        key: &str,
        entry: &Arc<InFlightCall>,
        result: Result<Response, Error>,
    ) {
        {
            let mut in_flight = lock_unpoisoned(&self.in_flight);
            if let Some(current) = in_flight.get(key)
                && Arc::ptr_eq(current, entry)
            {
                in_flight.remove(key);
            }
        }
        if !policy.cache_ttl.is_zero()
            && let Ok(response) = &result
        {
            let now = Instant::now();
            let mut cache = lock_unpoisoned(&self.cache);
            cache.insert(
                key.to_owned(),
                CacheEntry {
                    response: response.clone(),
                    completed_at: now,
                    last_used_at: now,
                },
            );
            while cache.len() > policy.max_cache_entries {
                let oldest_key = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used_at)
                    .map(|(cached_key, _)| cached_key.clone());
                let Some(oldest_key) = oldest_key else {
                    break;
                };
                cache.remove(&oldest_key);
            }
        }
        {
            let mut cell = lock_unpoisoned(&entry.cell);
            *cell = Some(result);
        }
        entry.done.notify_waiters();
    }

    /// Wait for the leader's outcome. A cancelled observer detaches; the
    /// last one out fires the leader's own cancel token.
    pub(crate) async fn await_outcome(
        &self,
        entry: &Arc<InFlightCall>,
        cancel: &CancelToken,
    ) -> Result<Result<Response, Error>, CancelReason> {
        loop {
            let notified = entry.done.notified();
            tokio::pin!(notified);
            // Register before checking the cell so a publish landing in
            // between still wakes this observer.
            notified.as_mut().enable();
            {
                let cell = lock_unpoisoned(&entry.cell);
                if let Some(result) = cell.as_ref() {
                    return Ok(result.clone());
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                reason = cancel.cancelled() => {
                    if entry.observers.fetch_sub(1, Ordering::AcqRel) == 1 {
                        entry.leader_cancel.fire(reason);
                    }
                    return Err(reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use http::Method;

    use super::{DedupKeyStrategy, DedupPolicy, DedupRole, Deduplicator};
    use crate::request::{Request, RequestBody};

    fn request(method: Method, url: &str, body: Option<&str>) -> Request {
        let mut request = Request::new(method, url);
        if let Some(body) = body {
            request.body = Some(RequestBody {
                bytes: Bytes::copy_from_slice(body.as_bytes()),
                content_type: Some("text/plain".to_owned()),
            });
        }
        request
    }

    #[test]
    fn key_strategies_differ_in_granularity() {
        let by_url = DedupPolicy::standard().key_strategy(DedupKeyStrategy::Url);
        let by_method = DedupPolicy::standard().key_strategy(DedupKeyStrategy::UrlMethod);
        let by_body = DedupPolicy::standard().key_strategy(DedupKeyStrategy::UrlMethodBody);

        let get = request(Method::GET, "https://api.test/a", None);
        let head = request(Method::HEAD, "https://api.test/a", None);
        assert_eq!(by_url.key(&get), by_url.key(&head));
        assert_ne!(by_method.key(&get), by_method.key(&head));

        let one = request(Method::GET, "https://api.test/a", Some("one"));
        let two = request(Method::GET, "https://api.test/a", Some("two"));
        assert_ne!(by_body.key(&one), by_body.key(&two));
    }

    #[test]
    fn custom_key_strategy_is_used_verbatim() {
        let policy = DedupPolicy::standard()
            .key_strategy(DedupKeyStrategy::Custom(Arc::new(|request: &Request| {
                format!("tenant:{}", request.url)
            })));
        let get = request(Method::GET, "https://api.test/a", None);
        assert_eq!(policy.key(&get), "tenant:https://api.test/a");
    }

    #[test]
    fn default_method_whitelist_is_safe_reads() {
        let policy = DedupPolicy::standard();
        assert!(policy.applies(&Method::GET));
        assert!(policy.applies(&Method::HEAD));
        assert!(!policy.applies(&Method::POST));
    }

    #[test]
    fn second_caller_attaches_as_follower() {
        let deduplicator = Deduplicator::new();
        let policy = DedupPolicy::standard();
        let first = deduplicator.join_or_lead(&policy, "GET https://api.test/a");
        let second = deduplicator.join_or_lead(&policy, "GET https://api.test/a");
        assert!(matches!(first, DedupRole::Leader(_)));
        assert!(matches!(second, DedupRole::Follower(_)));
    }

    #[test]
    fn cache_expires_after_ttl() {
        let deduplicator = Deduplicator::new();
        let policy = DedupPolicy::standard().cache_ttl(Duration::from_millis(20));
        let DedupRole::Leader(entry) = deduplicator.join_or_lead(&policy, "k") else {
            panic!("first caller should lead");
        };
        deduplicator.publish(
            &policy,
            "k",
            &entry,
            Ok(crate::response::Response::synthetic(200, Bytes::new())),
        );

        assert!(matches!(
            deduplicator.join_or_lead(&policy, "k"),
            DedupRole::Cached(_)
        ));
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(
            deduplicator.join_or_lead(&policy, "k"),
            DedupRole::Leader(_)
        ));
    }
}
