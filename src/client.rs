use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use http::header::{HeaderName, HeaderValue};
use http::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, info_span, warn};

use crate::config::{self, ClientDefaults, EffectiveCall, TimeoutSetting};
use crate::debounce::{DebounceOutcome, DebouncePolicy, Debouncer};
use crate::dedup::{DedupPolicy, DedupRole, Deduplicator};
use crate::error::{AbortReason, Error, RequestSnapshot};
use crate::hedge::{self, HedgePolicy, HedgeRun};
use crate::pipeline::{CallContext, Plugin, PluginChain};
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::request::{MultipartForm, Request, RequestBuilder, apply_body_content_type};
use crate::response::{Response, ResponseType};
use crate::retry::{RetryDecision, RetryPolicy, retry_after_delay};
use crate::signal::{CancelReason, CancelToken};
use crate::stats::{
    MetricsCollector, MetricsSnapshot, StatsBus, StatsEvent, StatsLabels, StatsSink,
};
use crate::transport::{PreparedRequest, Transport};

const DEFAULT_CLIENT_NAME: &str = "reqflow";

pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    defaults: ClientDefaults,
    rate_limit: Option<RateLimitPolicy>,
    plugins: Vec<Arc<dyn Plugin>>,
    sinks: Vec<Arc<dyn StatsSink>>,
    client_name: String,
}

impl ClientBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            defaults: ClientDefaults::default(),
            rate_limit: None,
            plugins: Vec::new(),
            sinks: Vec::new(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.defaults.base_url = Some(base_url.into());
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.defaults.default_headers.insert(name, value);
        self
    }

    /// Client-wide per-attempt timeout. `Duration::ZERO` disables it.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.defaults.timeout = TimeoutSetting::after(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.defaults.timeout = TimeoutSetting::Disabled;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.defaults.retry = retry_policy;
        self
    }

    pub fn hedge_policy(mut self, hedge_policy: HedgePolicy) -> Self {
        self.defaults.hedge = Some(hedge_policy);
        self
    }

    pub fn dedup_policy(mut self, dedup_policy: DedupPolicy) -> Self {
        self.defaults.dedup = Some(dedup_policy);
        self
    }

    pub fn debounce_policy(mut self, debounce_policy: DebouncePolicy) -> Self {
        self.defaults.debounce = Some(debounce_policy);
        self
    }

    pub fn rate_limit_policy(mut self, rate_limit_policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(rate_limit_policy);
        self
    }

    pub fn ignore_response_error(mut self, ignore: bool) -> Self {
        self.defaults.ignore_response_error = ignore;
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.defaults.response_type = response_type;
        self
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn stats_sink(mut self, sink: impl StatsSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn stats_sink_arc(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        if let Some(base_url) = &self.defaults.base_url {
            crate::util::resolve_url(None, base_url).map_err(|message| Error::Network {
                message,
                request: RequestSnapshot {
                    method: Method::GET,
                    url: crate::util::redact_url_for_logs(base_url),
                    tags: Vec::new(),
                },
                attempt: 0,
                cause: None,
            })?;
        }

        let metrics = Arc::new(MetricsCollector::default());
        let mut sinks = self.sinks;
        sinks.push(Arc::clone(&metrics) as Arc<dyn StatsSink>);

        let client = Client {
            inner: Arc::new(ClientInner {
                transport: self.transport,
                defaults: self.defaults,
                rate_limiter: self.rate_limit.map(RateLimiter::new),
                deduplicator: Deduplicator::new(),
                debouncer: Debouncer::new(),
                plugins: Mutex::new(Vec::new()),
                stats: StatsBus::new(sinks),
                metrics,
                extensions: Mutex::new(BTreeMap::new()),
                client_name: self.client_name,
                next_request_id: AtomicU64::new(1),
            }),
        };
        for plugin in self.plugins {
            client.use_plugin_arc(plugin);
        }
        Ok(client)
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    defaults: ClientDefaults,
    rate_limiter: Option<RateLimiter>,
    deduplicator: Deduplicator,
    debouncer: Debouncer,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    stats: StatsBus,
    metrics: Arc<MetricsCollector>,
    extensions: Mutex<BTreeMap<String, Arc<dyn Any + Send + Sync>>>,
    client_name: String,
    next_request_id: AtomicU64,
}

/// The facade assembling the whole pipeline. Cheap to clone; all state is
/// shared behind one `Arc`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_name", &self.inner.client_name)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(transport: impl Transport + 'static) -> ClientBuilder {
        ClientBuilder::new(Arc::new(transport))
    }

    pub fn builder_arc(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn options(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::OPTIONS, url)
    }

    pub async fn get_json<T>(&self, url: impl Into<String>) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        self.get(url).send_json().await
    }

    pub async fn get_text(&self, url: impl Into<String>) -> crate::Result<String> {
        self.get(url).send_text().await
    }

    pub async fn get_bytes(&self, url: impl Into<String>) -> crate::Result<bytes::Bytes> {
        self.get(url).send_bytes().await
    }

    pub async fn get_ndjson(
        &self,
        url: impl Into<String>,
    ) -> crate::Result<Vec<serde_json::Value>> {
        self.get(url).send_ndjson().await
    }

    pub async fn get_xml(&self, url: impl Into<String>) -> crate::Result<String> {
        let response = self
            .get(url)
            .response_type(ResponseType::Xml)
            .send()
            .await?;
        Ok(response.text())
    }

    pub async fn get_html(&self, url: impl Into<String>) -> crate::Result<String> {
        let response = self
            .get(url)
            .response_type(ResponseType::Html)
            .send()
            .await?;
        Ok(response.text())
    }

    pub async fn get_blob(&self, url: impl Into<String>) -> crate::Result<bytes::Bytes> {
        let response = self
            .get(url)
            .response_type(ResponseType::Blob)
            .send()
            .await?;
        Ok(response.body)
    }

    pub async fn get_array_buffer(&self, url: impl Into<String>) -> crate::Result<bytes::Bytes> {
        let response = self
            .get(url)
            .response_type(ResponseType::ArrayBuffer)
            .send()
            .await?;
        Ok(response.body)
    }

    pub async fn post_json<B, T>(&self, url: impl Into<String>, body: &B) -> crate::Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post(url).json(body)?.send_json().await
    }

    pub async fn post_form<B>(&self, url: impl Into<String>, body: &B) -> crate::Result<Response>
    where
        B: Serialize + ?Sized,
    {
        self.post(url).form(body)?.send().await
    }

    pub async fn post_multipart(
        &self,
        url: impl Into<String>,
        form: MultipartForm,
    ) -> crate::Result<Response> {
        self.post(url).multipart(form).send().await
    }

    pub async fn post_soap(
        &self,
        url: impl Into<String>,
        envelope: impl Into<String>,
    ) -> crate::Result<Response> {
        self.post(url).soap(envelope).send().await
    }

    /// Register a plugin, running its `on_attach` hook. Registration
    /// order is execution order for onRequest (and its reverse for the
    /// response chains).
    pub fn use_plugin(&self, plugin: impl Plugin + 'static) {
        self.use_plugin_arc(Arc::new(plugin));
    }

    pub fn use_plugin_arc(&self, plugin: Arc<dyn Plugin>) {
        plugin.on_attach(self);
        crate::util::lock_unpoisoned(&self.inner.plugins).push(plugin);
    }

    /// Capability registry plugins decorate the client through instead of
    /// field injection.
    pub fn register_extension(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        crate::util::lock_unpoisoned(&self.inner.extensions).insert(key.into(), value);
    }

    pub fn extension<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = crate::util::lock_unpoisoned(&self.inner.extensions)
            .get(key)
            .cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub(crate) async fn execute(&self, request: Request) -> crate::Result<Response> {
        let inner = &self.inner;
        let user_cancel = request.cancel.clone().unwrap_or_default();
        let effective = config::resolve(&inner.defaults, request)?;
        let request_id = inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let labels = StatsLabels {
            request_id,
            method: effective.snapshot.method.clone(),
            domain: effective.domain.clone(),
            endpoint: effective.endpoint.clone(),
            tags: effective.snapshot.tags.clone(),
        };

        let started = Instant::now();
        let _in_flight = inner.metrics.enter_in_flight();
        inner.stats.emit(StatsEvent::RequestStart {
            labels: labels.clone(),
        });

        let result = inner
            .admit_and_run(effective, user_cancel, labels.clone())
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => inner.stats.emit(StatsEvent::RequestSuccess {
                labels,
                status: response.status.as_u16(),
                attempts: response.attempts,
                elapsed_ms,
            }),
            Err(error) => inner.stats.emit(StatsEvent::RequestFail {
                labels,
                kind: error.kind(),
                status: error.status(),
                attempts: error.attempt(),
                elapsed_ms,
            }),
        }
        result
    }
}

impl ClientInner {
    fn plugin_chain(&self) -> PluginChain {
        PluginChain::new(crate::util::lock_unpoisoned(&self.plugins).clone())
    }

    /// Pre-flight admission: debounce picks the surviving call of a
    /// burst, the rate limiter admits it, dedup coalesces it, then the
    /// retry loop runs.
    async fn admit_and_run(
        self: &Arc<Self>,
        effective: EffectiveCall,
        user_cancel: CancelToken,
        labels: StatsLabels,
    ) -> Result<Response, Error> {
        if let Some(policy) = effective.debounce.clone() {
            let key = policy.key(&effective.request);
            match self.debouncer.hold(&policy, &key, &user_cancel).await {
                DebounceOutcome::Dispatch { held } => {
                    self.stats.emit(StatsEvent::DebounceDispatch {
                        labels: labels.clone(),
                        held_ms: held.as_millis() as u64,
                    });
                }
                DebounceOutcome::Superseded => {
                    self.stats.emit(StatsEvent::DebounceCancel {
                        labels: labels.clone(),
                    });
                    return Err(abort_error(
                        CancelReason::Debounced,
                        &effective.snapshot,
                        0,
                    ));
                }
                DebounceOutcome::Cancelled(reason) => {
                    return Err(abort_error(reason, &effective.snapshot, 0));
                }
            }
        }

        if effective.rate_limited
            && let Some(rate_limiter) = &self.rate_limiter
            && rate_limiter.is_subject(&effective.endpoint)
        {
            let bucket = rate_limiter.bucket_key(&effective.domain, &effective.endpoint);
            let wait_stats = self.stats.clone();
            let wait_labels = labels.clone();
            let wait_bucket = bucket.clone();
            let admitted = rate_limiter
                .admit(&bucket, &user_cancel, move |wait| {
                    wait_stats.emit(StatsEvent::RateLimitWait {
                        labels: wait_labels.clone(),
                        bucket: wait_bucket.clone(),
                        wait_ms: wait.as_millis() as u64,
                    });
                })
                .await;
            match admitted {
                Ok(_) => self.stats.emit(StatsEvent::RateLimitAdmit {
                    labels: labels.clone(),
                    bucket,
                }),
                Err(reason) => {
                    return Err(abort_error(reason, &effective.snapshot, 0));
                }
            }
        }

        let dedup = effective
            .dedup
            .clone()
            .filter(|policy| policy.applies(&effective.request.method));
        let Some(policy) = dedup else {
            return self.run_call(effective, user_cancel, labels).await;
        };

        let key = policy.key(&effective.request);
        match self.deduplicator.join_or_lead(&policy, &key) {
            DedupRole::Cached(response) => {
                self.stats.emit(StatsEvent::DedupHit {
                    labels,
                    from_cache: true,
                });
                Ok(response)
            }
            DedupRole::Follower(entry) => {
                self.stats.emit(StatsEvent::DedupHit {
                    labels,
                    from_cache: false,
                });
                let snapshot = effective.snapshot.clone();
                match self.deduplicator.await_outcome(&entry, &user_cancel).await {
                    Ok(result) => result,
                    Err(reason) => Err(abort_error(reason, &snapshot, 0)),
                }
            }
            DedupRole::Leader(entry) => {
                self.stats.emit(StatsEvent::DedupMiss {
                    labels: labels.clone(),
                });
                let snapshot = effective.snapshot.clone();
                // The leader's execution runs detached under a token the
                // dedup entry owns, so it outlives this caller and stops
                // only when the last observer detaches.
                let leader_token = entry.leader_cancel().clone();
                let task_self = Arc::clone(self);
                let task_policy = policy.clone();
                let task_key = key.clone();
                let task_entry = Arc::clone(&entry);
                tokio::spawn(async move {
                    let result = task_self
                        .run_call(effective, leader_token, labels)
                        .await;
                    task_self
                        .deduplicator
                        .publish(&task_policy, &task_key, &task_entry, result);
                });
                match self.deduplicator.await_outcome(&entry, &user_cancel).await {
                    Ok(result) => result,
                    Err(reason) => Err(abort_error(reason, &snapshot, 0)),
                }
            }
        }
    }

    /// The retry orchestrator: attempts 1..=max, each one a full pass of
    /// onRequest chain, hedged transport leg, and response chains.
    async fn run_call(
        self: &Arc<Self>,
        effective: EffectiveCall,
        cancel: CancelToken,
        labels: StatsLabels,
    ) -> Result<Response, Error> {
        let EffectiveCall {
            request,
            timeout,
            retry,
            hedge,
            response_type,
            ignore_response_error,
            snapshot,
            domain,
            endpoint,
            ..
        } = effective;
        let max_attempts = retry.max_attempts();
        let plugins = self.plugin_chain();
        let mut ctx = CallContext::new(request, max_attempts, cancel.clone());

        loop {
            if let Some(reason) = cancel.fired_reason() {
                return Err(abort_error(reason, &snapshot, ctx.attempt));
            }

            let span = info_span!(
                "reqflow.request",
                client = %self.client_name,
                method = %ctx.req.method,
                url = %snapshot.url,
                attempt = ctx.attempt,
                max_attempts = max_attempts
            );
            let _enter = span.enter();

            self.run_one_attempt(
                &plugins,
                &mut ctx,
                timeout,
                hedge.as_ref(),
                response_type,
                ignore_response_error,
                &cancel,
                &labels,
            )
            .await;

            if let Some(response) = ctx.res.take() {
                return Ok(response);
            }
            let error = match ctx.error.take() {
                Some(error) => error,
                None => abort_error(CancelReason::User, &snapshot, ctx.attempt),
            };

            if error.status() == Some(429)
                && let Some(rate_limiter) = &self.rate_limiter
                && let Some(throttle) = retry_after_delay(&error, SystemTime::now())
            {
                rate_limiter.observe_server_throttle(&domain, &endpoint, throttle);
            }

            let decision = RetryDecision {
                attempt: ctx.attempt,
                max_attempts,
                method: ctx.req.method.clone(),
                url: snapshot.url.clone(),
                kind: error.kind(),
                status: error.status(),
            };
            if ctx.attempt >= max_attempts || !retry.should_retry(&decision) {
                return Err(error);
            }

            let delay = retry_after_delay(&error, SystemTime::now())
                .unwrap_or_else(|| retry.delay_for_retry(ctx.attempt));
            warn!(
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying request"
            );
            self.stats.emit(StatsEvent::RequestRetry {
                labels: labels.clone(),
                attempt: ctx.attempt,
                delay_ms: delay.as_millis() as u64,
            });
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    reason = cancel.cancelled() => {
                        // A cancellation during backoff replaces the
                        // underlying error; no further attempt runs.
                        return Err(abort_error(reason, &snapshot, ctx.attempt));
                    }
                }
            }
            ctx.attempt += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_attempt(
        &self,
        plugins: &PluginChain,
        ctx: &mut CallContext,
        timeout: Option<std::time::Duration>,
        hedge_policy: Option<&HedgePolicy>,
        response_type: ResponseType,
        ignore_response_error: bool,
        cancel: &CancelToken,
        labels: &StatsLabels,
    ) {
        ctx.res = None;
        ctx.error = None;

        // A fault here aborts the attempt outright: no transport leg, no
        // response chains.
        if let Err(error) = plugins.run_request(ctx) {
            ctx.error = Some(error);
            return;
        }

        let snapshot = ctx.req.snapshot();
        let mut headers = ctx.req.headers.clone();
        apply_body_content_type(&mut headers, ctx.req.body.as_ref());
        let prepared = PreparedRequest {
            method: ctx.req.method.clone(),
            url: ctx.req.url.clone(),
            headers,
            body: ctx
                .req
                .body
                .as_ref()
                .map(|body| body.bytes.clone())
                .unwrap_or_default(),
            timeout,
        };

        debug!("dispatching attempt");
        let transport_result = hedge::run_attempt(HedgeRun {
            transport: &self.transport,
            policy: hedge_policy,
            prepared,
            snapshot: &snapshot,
            attempt: ctx.attempt,
            timeout,
            cancel,
            stats: &self.stats,
            labels,
        })
        .await;

        match transport_result {
            Ok(transport_response) => {
                let status = transport_response.status;
                match Response::from_transport(
                    transport_response,
                    response_type,
                    snapshot.clone(),
                    ctx.attempt,
                ) {
                    Ok(response) => {
                        if response.is_success() || ignore_response_error {
                            ctx.res = Some(response);
                        } else {
                            ctx.error = Some(Error::Http {
                                status: status.as_u16(),
                                status_text: response.status_text.clone(),
                                request: snapshot,
                                response: response.snapshot_of(),
                                attempt: ctx.attempt,
                            });
                        }
                    }
                    Err(parse_error) => ctx.error = Some(parse_error),
                }
            }
            Err(error) => ctx.error = Some(error),
        }

        if ctx.error.is_none() {
            plugins.run_response(ctx);
        }
        if ctx.error.is_some() {
            plugins.run_response_error(ctx);
            if let Some(error) = &mut ctx.error {
                error.set_attempt(ctx.attempt);
            }
        }
    }
}

fn abort_error(reason: CancelReason, snapshot: &RequestSnapshot, attempt: usize) -> Error {
    match reason {
        CancelReason::Timeout => Error::Timeout {
            timeout_ms: 0,
            request: snapshot.clone(),
            attempt,
        },
        CancelReason::Debounced => Error::Abort {
            reason: AbortReason::Debounced,
            request: snapshot.clone(),
            attempt,
        },
        CancelReason::User | CancelReason::HedgePruned => Error::Abort {
            reason: AbortReason::User,
            request: snapshot.clone(),
            attempt,
        },
    }
}
