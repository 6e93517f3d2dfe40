use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use reqflow::{
    AbortReason, Backoff, CancelToken, Client, ErrorKind, MultipartForm, PreparedRequest,
    RetryPolicy, Transport, TransportError, TransportResponse,
};

#[derive(Clone)]
struct Scripted {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: &'static str,
    delay: Duration,
}

impl Scripted {
    fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: "",
            delay: Duration::ZERO,
        }
    }

    fn ok(body: &'static str) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body,
            delay: Duration::ZERO,
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// Plays back a script of responses, one per transport call; the last
/// entry repeats once the script runs out.
struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    last: Scripted,
    calls: AtomicUsize,
    seen_headers: Mutex<Vec<HeaderMap>>,
}

impl MockTransport {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        let last = script.last().cloned().unwrap_or_else(|| Scripted::ok(""));
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last,
            calls: AtomicUsize::new(0),
            seen_headers: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &PreparedRequest,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_headers
            .lock()
            .expect("lock seen headers")
            .push(request.headers.clone());
        let scripted = self
            .script
            .lock()
            .expect("lock script")
            .pop_front()
            .unwrap_or_else(|| self.last.clone());
        if !scripted.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(scripted.delay) => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }
        let mut headers = HeaderMap::new();
        for (name, value) in &scripted.headers {
            headers.insert(
                http::header::HeaderName::from_static(name),
                value.parse().expect("scripted header value"),
            );
        }
        Ok(TransportResponse {
            status: StatusCode::from_u16(scripted.status).expect("scripted status"),
            status_text: None,
            headers,
            body: Bytes::from_static(scripted.body.as_bytes()),
        })
    }
}

fn client_with(transport: &Arc<MockTransport>, retry: RetryPolicy) -> Client {
    Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .retry_policy(retry)
        .build()
        .expect("client should build")
}

#[tokio::test]
async fn retry_eventually_succeeds_and_counts_attempts() {
    let transport = MockTransport::new(vec![
        Scripted::status(503),
        Scripted::status(503),
        Scripted::ok("recovered"),
    ]);
    let client = client_with(
        &transport,
        RetryPolicy::standard()
            .max_retries(3)
            .base_delay(Duration::from_millis(50))
            .backoff(Backoff::Linear),
    );

    let response = client
        .get("https://api.test/v1/items")
        .send()
        .await
        .expect("third attempt should succeed");
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.text(), "recovered");
    assert_eq!(response.attempts, 3);
    assert_eq!(transport.calls(), 3);
    assert_eq!(client.metrics_snapshot().retries, 2);
}

#[tokio::test]
async fn retry_disabled_yields_exactly_one_attempt() {
    for retry_off in [false, true] {
        let transport = MockTransport::new(vec![Scripted::status(503)]);
        let client = client_with(&transport, RetryPolicy::standard().max_retries(2));
        let builder = client.get("https://api.test/v1/items");
        let builder = if retry_off {
            builder.retry(false)
        } else {
            builder.retry(0_usize)
        };
        let error = builder.send().await.expect_err("503 should surface");
        assert_eq!(error.kind(), ErrorKind::Http);
        assert_eq!(error.attempt(), 1);
        assert_eq!(transport.calls(), 1);
    }
}

#[tokio::test]
async fn exhausted_retries_return_final_attempt_error() {
    let transport = MockTransport::new(vec![Scripted::status(503)]);
    let client = client_with(
        &transport,
        RetryPolicy::standard()
            .max_retries(2)
            .base_delay(Duration::from_millis(10)),
    );
    let error = client
        .get("https://api.test/v1/items")
        .send()
        .await
        .expect_err("all attempts 503");
    assert_eq!(error.kind(), ErrorKind::Http);
    assert_eq!(error.status(), Some(503));
    assert_eq!(error.attempt(), 3);
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn retry_after_header_overrides_backoff() {
    let transport = MockTransport::new(vec![
        Scripted::status(429).header("retry-after", "1"),
        Scripted::ok("after throttle"),
    ]);
    // The configured backoff is far longer than Retry-After; honoring the
    // header keeps the call fast.
    let client = client_with(
        &transport,
        RetryPolicy::standard()
            .max_retries(1)
            .base_delay(Duration::from_secs(30))
            .backoff(Backoff::Fixed),
    );

    let started = Instant::now();
    let response = client
        .get("https://api.test/v1/items")
        .rate_limited(false)
        .send()
        .await
        .expect("second attempt should succeed");
    assert_eq!(response.text(), "after throttle");
    assert_eq!(transport.calls(), 2);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn cancellation_during_backoff_aborts_without_another_attempt() {
    let transport = MockTransport::new(vec![Scripted::status(500)]);
    let client = client_with(
        &transport,
        RetryPolicy::standard()
            .max_retries(5)
            .base_delay(Duration::from_millis(1000))
            .backoff(Backoff::Fixed),
    );
    let cancel = CancelToken::new();
    let call = {
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

    tokio::time::sleep(Duration::from_millis(300)).await;
    let cancelled_at = Instant::now();
    cancel.fire(reqflow::CancelReason::User);

    let result = call.await.expect("call task should complete");
    let error = result.expect_err("cancelled call must error");
    assert_eq!(error.kind(), ErrorKind::Abort);
    assert_eq!(error.abort_reason(), Some(AbortReason::User));
    assert!(
        cancelled_at.elapsed() < Duration::from_millis(200),
        "abort should surface promptly, took {:?}",
        cancelled_at.elapsed()
    );
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn network_errors_do_not_retry_non_idempotent_methods() {
    struct FailingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send(
            &self,
            _request: &PreparedRequest,
            _cancel: &CancelToken,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect {
                message: "connection refused".to_owned(),
            })
        }
    }

    let transport = Arc::new(FailingTransport {
        calls: AtomicUsize::new(0),
    });
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .retry_policy(RetryPolicy::standard().max_retries(3).base_delay(Duration::from_millis(5)))
        .build()
        .expect("client should build");

    let error = client
        .post("https://api.test/v1/items")
        .text("payload")
        .send()
        .await
        .expect_err("network failure should surface");
    assert_eq!(error.kind(), ErrorKind::Network);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

    // The same failure on an idempotent method is retried.
    let error = client
        .get("https://api.test/v1/items")
        .send()
        .await
        .expect_err("network failure should surface");
    assert_eq!(error.kind(), ErrorKind::Network);
    assert_eq!(error.attempt(), 4);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1 + 4);
}

#[tokio::test]
async fn timeout_zero_never_fires() {
    let transport = MockTransport::new(vec![{
        let mut scripted = Scripted::ok("slow but fine");
        scripted.delay = Duration::from_millis(150);
        scripted
    }]);
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .timeout(Duration::ZERO)
        .build()
        .expect("client should build");

    let response = client
        .get("https://api.test/v1/slow")
        .send()
        .await
        .expect("no timeout should fire");
    assert_eq!(response.text(), "slow but fine");
}

#[tokio::test]
async fn typed_post_shortcuts_set_their_content_types() {
    let transport = MockTransport::new(vec![Scripted::ok("ok")]);
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .build()
        .expect("client should build");

    let form = MultipartForm::new()
        .text("name", "demo")
        .file("data", "a.bin", "application/octet-stream", &b"\x01\x02"[..]);
    client
        .post_multipart("https://api.test/v1/upload", form)
        .await
        .expect("multipart post should succeed");
    client
        .post_soap("https://api.test/v1/soap", "<Envelope/>")
        .await
        .expect("soap post should succeed");

    let seen = transport.seen_headers.lock().expect("lock seen headers");
    assert_eq!(seen.len(), 2);
    let multipart_type = seen[0][http::header::CONTENT_TYPE]
        .to_str()
        .expect("multipart content type is ascii");
    assert!(multipart_type.starts_with("multipart/form-data; boundary=reqflow-"));
    assert_eq!(
        seen[1][http::header::CONTENT_TYPE],
        "text/xml; charset=utf-8"
    );
}

#[tokio::test]
async fn byte_shortcuts_return_the_raw_body() {
    let transport = MockTransport::new(vec![Scripted::ok("raw-bytes"), Scripted::ok("raw-bytes")]);
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .build()
        .expect("client should build");

    let blob = client
        .get_blob("https://api.test/v1/file")
        .await
        .expect("blob fetch should succeed");
    let buffer = client
        .get_array_buffer("https://api.test/v1/file")
        .await
        .expect("array-buffer fetch should succeed");
    assert_eq!(blob.as_ref(), b"raw-bytes");
    assert_eq!(blob, buffer);
}

#[tokio::test]
async fn on_request_plugins_rerun_for_every_attempt() {
    use reqflow::{CallContext, Plugin, PluginFault};

    struct AttemptStamp;

    impl Plugin for AttemptStamp {
        fn name(&self) -> &str {
            "attempt-stamp"
        }

        fn on_request(&self, ctx: &mut CallContext) -> Result<(), PluginFault> {
            let value = ctx.attempt.to_string();
            ctx.req.headers.insert(
                http::header::HeaderName::from_static("x-attempt"),
                value.parse().expect("attempt header value"),
            );
            Ok(())
        }
    }

    let transport = MockTransport::new(vec![Scripted::status(503), Scripted::ok("done")]);
    let client = Client::builder_arc(transport.clone() as Arc<dyn Transport>)
        .retry_policy(RetryPolicy::standard().max_retries(1).base_delay(Duration::from_millis(5)))
        .plugin(AttemptStamp)
        .build()
        .expect("client should build");

    client
        .get("https://api.test/v1/items")
        .send()
        .await
        .expect("retry should succeed");

    let seen = transport.seen_headers.lock().expect("lock seen headers");
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["x-attempt"], "1");
    assert_eq!(seen[1]["x-attempt"], "2");
}
