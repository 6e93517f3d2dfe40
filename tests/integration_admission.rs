use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use reqflow::{
    AbortReason, CancelToken, Client, DebouncePolicy, DedupKeyStrategy, DedupPolicy, ErrorKind,
    PreparedRequest, RateLimitPolicy, RetryPolicy, Transport, TransportError, TransportResponse,
};

/// Serves every call with the same body after a fixed delay, recording
/// arrival order.
struct SlowTransport {
    delay: Duration,
    body: &'static str,
    calls: AtomicUsize,
    arrivals: Mutex<Vec<usize>>,
}

impl SlowTransport {
    fn new(delay: Duration, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            delay,
            body,
            calls: AtomicUsize::new(0),
            arrivals: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SlowTransport {
    async fn send(
        &self,
        request: &PreparedRequest,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(tag) = request.headers.get("x-caller") {
            let index: usize = tag
                .to_str()
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or_default();
            self.arrivals.lock().expect("lock arrivals").push(index);
        }
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }
        Ok(TransportResponse {
            status: StatusCode::OK,
            status_text: None,
            headers: HeaderMap::new(),
            body: Bytes::from_static(self.body.as_bytes()),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limiter_admits_in_arrival_order() {
    let transport = SlowTransport::new(Duration::ZERO, "ok");
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .rate_limit_policy(RateLimitPolicy::standard().rate_per_second(2.0).burst(2))
        .build()
        .expect("client should build");

    let started = Instant::now();
    let mut joins = Vec::new();
    for index in 1..=4 {
        let client = client.clone();
        joins.push(tokio::spawn(async move {
            client
                .get("https://api.test/v1/items")
                .try_header("x-caller", &index.to_string())
                .expect("caller header")
                .send()
                .await
        }));
        // Fix enqueue order so FIFO admission is observable.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for join in joins {
        join.await
            .expect("task should complete")
            .expect("all calls should succeed");
    }

    let elapsed = started.elapsed();
    assert_eq!(transport.calls(), 4);
    // Two tokens of burst, then one every 500ms: total ~1s.
    assert!(elapsed >= Duration::from_millis(850), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2000), "elapsed {elapsed:?}");
    let arrivals = transport.arrivals.lock().expect("lock arrivals").clone();
    assert_eq!(arrivals, vec![1, 2, 3, 4]);

    let snapshot = client.metrics_snapshot();
    assert_eq!(snapshot.rate_limit_waits, 2);
}

#[tokio::test]
async fn rate_limiter_exclude_patterns_bypass_the_bucket() {
    let transport = SlowTransport::new(Duration::ZERO, "ok");
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .rate_limit_policy(
            RateLimitPolicy::standard()
                .rate_per_second(0.5)
                .burst(1)
                .exclude(["GET /health"]),
        )
        .build()
        .expect("client should build");

    let started = Instant::now();
    for _ in 0..3 {
        client
            .get("https://api.test/health")
            .send()
            .await
            .expect("health checks bypass the limiter");
    }
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn cancellation_while_queued_surfaces_abort_without_consuming_a_token() {
    let transport = SlowTransport::new(Duration::ZERO, "ok");
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .rate_limit_policy(RateLimitPolicy::standard().rate_per_second(0.5).burst(1))
        .build()
        .expect("client should build");

    // Drain the burst.
    client
        .get("https://api.test/v1/items")
        .send()
        .await
        .expect("first call admitted immediately");

    let cancel = CancelToken::new();
    let queued = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            client
                .get("https://api.test/v1/items")
                .cancel_token(cancel)
                .send()
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.fire(reqflow::CancelReason::User);

    let error = queued
        .await
        .expect("queued task should complete")
        .expect_err("queued call should abort");
    assert_eq!(error.kind(), ErrorKind::Abort);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dedup_coalesces_concurrent_identical_gets() {
    let transport = SlowTransport::new(Duration::from_millis(100), "shared");
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .dedup_policy(DedupPolicy::standard().key_strategy(DedupKeyStrategy::Url))
        .build()
        .expect("client should build");

    let started = Instant::now();
    let mut joins = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        joins.push(tokio::spawn(async move {
            client.get("https://api.test/v1/items").send().await
        }));
    }
    let mut bodies = Vec::new();
    for join in joins {
        let response = join
            .await
            .expect("task should complete")
            .expect("coalesced call should succeed");
        bodies.push(response.text());
    }

    assert_eq!(transport.calls(), 1);
    assert_eq!(bodies, vec!["shared", "shared", "shared"]);
    assert!(started.elapsed() < Duration::from_millis(400));

    let snapshot = client.metrics_snapshot();
    assert_eq!(snapshot.dedup_misses, 1);
    assert_eq!(snapshot.dedup_hits, 2);
}

#[tokio::test]
async fn dedup_ttl_cache_serves_within_window_only() {
    let transport = SlowTransport::new(Duration::ZERO, "cached");
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .dedup_policy(DedupPolicy::standard().cache_ttl(Duration::from_millis(200)))
        .build()
        .expect("client should build");

    client
        .get("https://api.test/v1/items")
        .send()
        .await
        .expect("leader call succeeds");
    client
        .get("https://api.test/v1/items")
        .send()
        .await
        .expect("cache hit succeeds");
    assert_eq!(transport.calls(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    client
        .get("https://api.test/v1/items")
        .send()
        .await
        .expect("expired entry refetches");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_cancellation_leaves_the_leader_running() {
    let transport = SlowTransport::new(Duration::from_millis(200), "leader");
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .dedup_policy(DedupPolicy::standard())
        .build()
        .expect("client should build");

    let leader = {
        let client = client.clone();
        tokio::spawn(async move { client.get("https://api.test/v1/items").send().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let follower_cancel = CancelToken::new();
    let follower = {
        let client = client.clone();
        let cancel = follower_cancel.clone();
        tokio::spawn(async move {
            client
                .get("https://api.test/v1/items")
                .cancel_token(cancel)
                .send()
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    follower_cancel.fire(reqflow::CancelReason::User);

    let follower_error = follower
        .await
        .expect("follower task should complete")
        .expect_err("cancelled follower should abort");
    assert_eq!(follower_error.kind(), ErrorKind::Abort);

    let leader_response = leader
        .await
        .expect("leader task should complete")
        .expect("leader call should still succeed");
    assert_eq!(leader_response.text(), "leader");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn debouncer_dispatches_only_the_last_of_a_burst() {
    let transport = SlowTransport::new(Duration::ZERO, "latest");
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .debounce_policy(DebouncePolicy::standard().delay(Duration::from_millis(300)))
        .retry_policy(RetryPolicy::disabled())
        .build()
        .expect("client should build");

    let started = Instant::now();
    let mut joins = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        joins.push(tokio::spawn(async move {
            client.get("https://api.test/v1/search").send().await
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut outcomes = Vec::new();
    for join in joins {
        outcomes.push(join.await.expect("task should complete"));
    }
    let elapsed = started.elapsed();

    for superseded in &outcomes[..4] {
        let error = superseded
            .as_ref()
            .expect_err("superseded calls must be cancelled");
        assert_eq!(error.kind(), ErrorKind::Abort);
        assert_eq!(error.abort_reason(), Some(AbortReason::Debounced));
    }
    let survivor = outcomes[4]
        .as_ref()
        .expect("last call of the burst should dispatch");
    assert_eq!(survivor.text(), "latest");

    assert_eq!(transport.calls(), 1);
    // Four 50ms gaps plus the 300ms debounce window.
    assert!(elapsed >= Duration::from_millis(450), "elapsed {elapsed:?}");

    let snapshot = client.metrics_snapshot();
    assert_eq!(snapshot.debounce_cancelled, 4);
    assert_eq!(snapshot.debounce_dispatched, 1);
}

#[tokio::test]
async fn per_call_debounce_false_bypasses_the_debouncer() {
    let transport = SlowTransport::new(Duration::ZERO, "ok");
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .debounce_policy(DebouncePolicy::standard().delay(Duration::from_millis(400)))
        .build()
        .expect("client should build");

    let started = Instant::now();
    client
        .get("https://api.test/v1/items")
        .debounce(false)
        .send()
        .await
        .expect("bypassing call should succeed");
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(transport.calls(), 1);
}
