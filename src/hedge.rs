use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Method;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{AbortReason, Error, RequestSnapshot};
use crate::signal::{CancelReason, CancelToken, LinkedToken};
use crate::stats::{StatsBus, StatsEvent, StatsLabels};
use crate::transport::{PreparedRequest, Transport, TransportResponse, wrap_transport_error};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HedgeMode {
    /// Fan out: primary plus delayed hedges race, first success wins.
    #[default]
    Race,
    /// At most one racer live: each boundary cancels the current racer and
    /// starts the next.
    CancelAndRetry,
}

#[derive(Clone, Debug)]
pub struct HedgePolicy {
    enabled: bool,
    mode: HedgeMode,
    hedge_delay: Duration,
    max_hedges: usize,
    delay_multiplier: f64,
    jitter_ratio: f64,
    include_methods: Vec<Method>,
    servers: Vec<String>,
}

impl HedgePolicy {
    pub fn standard() -> Self {
        Self {
            enabled: true,
            mode: HedgeMode::Race,
            hedge_delay: Duration::from_millis(100),
            max_hedges: 1,
            delay_multiplier: 1.0,
            jitter_ratio: 0.0,
            include_methods: vec![Method::GET, Method::HEAD, Method::OPTIONS],
            servers: Vec::new(),
        }
    }

    /// A policy record that switches hedging off; lets a call override a
    /// client-level policy wholesale.
    pub fn disabled() -> Self {
        let mut policy = Self::standard();
        policy.enabled = false;
        policy
    }

    pub fn mode(mut self, mode: HedgeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn hedge_delay(mut self, hedge_delay: Duration) -> Self {
        self.hedge_delay = hedge_delay;
        self
    }

    pub fn max_hedges(mut self, max_hedges: usize) -> Self {
        self.max_hedges = max_hedges;
        self
    }

    /// Geometric factor applied to the delay of each successive hedge.
    pub fn delay_multiplier(mut self, delay_multiplier: f64) -> Self {
        self.delay_multiplier = if delay_multiplier.is_finite() && delay_multiplier > 0.0 {
            delay_multiplier
        } else {
            1.0
        };
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn include_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.include_methods = methods.into_iter().collect();
        self
    }

    /// Alternate origins; hedge i swaps its host for `servers[i % len]`.
    pub fn servers(mut self, servers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn applies(&self, method: &Method) -> bool {
        self.enabled && self.max_hedges > 0 && self.include_methods.contains(method)
    }

    /// Launch offset of hedge `index` (1-based) from the primary's start.
    fn delay_for_hedge(&self, index: usize) -> Duration {
        let exponent = index.saturating_sub(1).min(31) as i32;
        let mut delay_ms = self.hedge_delay.as_millis() as f64 * self.delay_multiplier.powi(exponent);
        if self.jitter_ratio > f64::EPSILON {
            let mut rng = rand::rng();
            let factor: f64 = rng.random_range(-self.jitter_ratio..=self.jitter_ratio);
            delay_ms *= 1.0 + factor;
        }
        if !delay_ms.is_finite() || delay_ms < 0.0 {
            return self.hedge_delay;
        }
        Duration::from_millis(delay_ms.round() as u64)
    }

    fn server_for_hedge(&self, index: usize) -> Option<&str> {
        if self.servers.is_empty() {
            return None;
        }
        Some(self.servers[index % self.servers.len()].as_str())
    }
}

impl Default for HedgePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Everything one attempt needs to run its transport leg, hedged or not.
pub(crate) struct HedgeRun<'a> {
    pub(crate) transport: &'a Arc<dyn Transport>,
    pub(crate) policy: Option<&'a HedgePolicy>,
    pub(crate) prepared: PreparedRequest,
    pub(crate) snapshot: &'a RequestSnapshot,
    pub(crate) attempt: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: &'a CancelToken,
    pub(crate) stats: &'a StatsBus,
    pub(crate) labels: &'a StatsLabels,
}

pub(crate) async fn run_attempt(run: HedgeRun<'_>) -> Result<TransportResponse, Error> {
    match run.policy {
        Some(policy) if policy.applies(&run.prepared.method) => match policy.mode {
            HedgeMode::Race => run_race(&run, policy).await,
            HedgeMode::CancelAndRetry => run_cancel_and_retry(&run, policy).await,
        },
        _ => {
            let racer = run.cancel.child();
            run_racer(
                Arc::clone(run.transport),
                run.prepared.clone(),
                run.snapshot.clone(),
                run.attempt,
                run.timeout,
                racer.token().clone(),
            )
            .await
        }
    }
}

async fn run_race(run: &HedgeRun<'_>, policy: &HedgePolicy) -> Result<TransportResponse, Error> {
    let started = Instant::now();
    let (outcome_tx, mut outcome_rx) =
        mpsc::unbounded_channel::<(usize, Result<TransportResponse, Error>)>();
    let mut racers: Vec<(usize, LinkedToken)> = Vec::new();

    spawn_racer(run, policy, 0, &outcome_tx, &mut racers);
    let mut outstanding = 1_usize;
    let mut next_hedge = 1_usize;
    let mut failures: Vec<(usize, Error)> = Vec::new();

    loop {
        let hedge_at = if next_hedge <= policy.max_hedges {
            Some(started + policy.delay_for_hedge(next_hedge))
        } else {
            None
        };
        tokio::select! {
            received = outcome_rx.recv() => {
                let Some((index, result)) = received else {
                    // Every sender gone without a winner; fall through to
                    // final-error selection.
                    return Err(final_race_error(failures, run));
                };
                match result {
                    Ok(response) => {
                        prune_racers(&mut racers, Some(index), run);
                        if index > 0 {
                            run.stats.emit(StatsEvent::HedgeWin {
                                labels: run.labels.clone(),
                                hedge_index: index,
                                elapsed_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                        return Ok(response);
                    }
                    Err(error) => {
                        debug!(racer = index, error = %error, "hedge racer failed");
                        outstanding -= 1;
                        failures.push((index, error));
                        if outstanding == 0 && next_hedge > policy.max_hedges {
                            return Err(final_race_error(failures, run));
                        }
                    }
                }
            }
            _ = sleep_until_instant(hedge_at), if hedge_at.is_some() => {
                run.stats.emit(StatsEvent::HedgeLaunch {
                    labels: run.labels.clone(),
                    hedge_index: next_hedge,
                    delay_ms: started.elapsed().as_millis() as u64,
                });
                spawn_racer(run, policy, next_hedge, &outcome_tx, &mut racers);
                outstanding += 1;
                next_hedge += 1;
            }
            reason = run.cancel.cancelled() => {
                prune_racers(&mut racers, None, run);
                return Err(abort_error(reason, run.snapshot, run.attempt, run.timeout));
            }
        }
    }
}

async fn run_cancel_and_retry(
    run: &HedgeRun<'_>,
    policy: &HedgePolicy,
) -> Result<TransportResponse, Error> {
    let started = Instant::now();
    let mut last_error: Option<Error> = None;

    for index in 0..=policy.max_hedges {
        if index > 0 {
            run.stats.emit(StatsEvent::HedgeLaunch {
                labels: run.labels.clone(),
                hedge_index: index,
                delay_ms: started.elapsed().as_millis() as u64,
            });
        }
        let racer = run.cancel.child();
        let prepared = prepared_for_racer(run, policy, index);
        let racer_future = run_racer(
            Arc::clone(run.transport),
            prepared,
            run.snapshot.clone(),
            run.attempt,
            run.timeout,
            racer.token().clone(),
        );
        let has_boundary = index < policy.max_hedges;
        let boundary = policy.delay_for_hedge(index + 1);
        tokio::select! {
            result = racer_future => match result {
                Ok(response) => {
                    if index > 0 {
                        run.stats.emit(StatsEvent::HedgeWin {
                            labels: run.labels.clone(),
                            hedge_index: index,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    return Ok(response);
                }
                Err(error) => {
                    debug!(racer = index, error = %error, "hedge racer failed");
                    last_error = Some(error);
                }
            },
            _ = sleep(boundary), if has_boundary => {
                racer.fire(CancelReason::HedgePruned);
                run.stats.emit(StatsEvent::HedgeCancel {
                    labels: run.labels.clone(),
                    hedge_index: index,
                });
            }
            reason = run.cancel.cancelled() => {
                return Err(abort_error(reason, run.snapshot, run.attempt, run.timeout));
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| abort_error(CancelReason::HedgePruned, run.snapshot, run.attempt, run.timeout)))
}

/// One transport call under its own token, with the per-racer timeout
/// measured from this racer's own start.
async fn run_racer(
    transport: Arc<dyn Transport>,
    prepared: PreparedRequest,
    snapshot: RequestSnapshot,
    attempt: usize,
    timeout: Option<Duration>,
    racer: CancelToken,
) -> Result<TransportResponse, Error> {
    let deadline = async {
        match timeout {
            Some(timeout) => sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        result = transport.send(&prepared, &racer) => {
            result.map_err(|error| wrap_transport_error(error, &snapshot, attempt, &racer, timeout))
        }
        _ = deadline => {
            racer.fire(CancelReason::Timeout);
            Err(Error::Timeout {
                timeout_ms: timeout.map(|value| value.as_millis()).unwrap_or(0),
                request: snapshot,
                attempt,
            })
        }
        reason = racer.cancelled() => Err(abort_error(reason, &snapshot, attempt, timeout)),
    }
}

fn spawn_racer(
    run: &HedgeRun<'_>,
    policy: &HedgePolicy,
    index: usize,
    outcome_tx: &mpsc::UnboundedSender<(usize, Result<TransportResponse, Error>)>,
    racers: &mut Vec<(usize, LinkedToken)>,
) {
    let racer = run.cancel.child();
    let token = racer.token().clone();
    racers.push((index, racer));
    let transport = Arc::clone(run.transport);
    let prepared = prepared_for_racer(run, policy, index);
    let snapshot = run.snapshot.clone();
    let attempt = run.attempt;
    let timeout = run.timeout;
    let outcome_tx = outcome_tx.clone();
    tokio::spawn(async move {
        let result = run_racer(transport, prepared, snapshot, attempt, timeout, token).await;
        let _ = outcome_tx.send((index, result));
    });
}

fn prepared_for_racer(run: &HedgeRun<'_>, policy: &HedgePolicy, index: usize) -> PreparedRequest {
    let mut prepared = run.prepared.clone();
    if index > 0
        && let Some(server) = policy.server_for_hedge(index)
    {
        prepared.url = substitute_server(&prepared.url, server);
    }
    prepared
}

fn prune_racers(racers: &mut Vec<(usize, LinkedToken)>, winner: Option<usize>, run: &HedgeRun<'_>) {
    for (index, racer) in racers.drain(..) {
        if Some(index) == winner || racer.is_fired() {
            continue;
        }
        racer.fire(CancelReason::HedgePruned);
        run.stats.emit(StatsEvent::HedgeCancel {
            labels: run.labels.clone(),
            hedge_index: index,
        });
    }
}

/// Losers pruned by the winner never reach the caller; when every racer
/// failed on its own, the primary's error wins, falling back to the
/// earliest arrival if the primary's outcome was a cancellation.
fn final_race_error(failures: Vec<(usize, Error)>, run: &HedgeRun<'_>) -> Error {
    let mut primary: Option<Error> = None;
    let mut earliest: Option<Error> = None;
    for (index, error) in failures {
        if earliest.is_none() && error.kind() != crate::error::ErrorKind::Abort {
            earliest = Some(error.clone());
        }
        if index == 0 {
            primary = Some(error);
        }
    }
    match primary {
        Some(error) if error.kind() != crate::error::ErrorKind::Abort => error,
        _ => earliest.unwrap_or_else(|| {
            abort_error(CancelReason::HedgePruned, run.snapshot, run.attempt, run.timeout)
        }),
    }
}

fn abort_error(
    reason: CancelReason,
    snapshot: &RequestSnapshot,
    attempt: usize,
    timeout: Option<Duration>,
) -> Error {
    match reason {
        CancelReason::Timeout => Error::Timeout {
            timeout_ms: timeout.map(|value| value.as_millis()).unwrap_or(0),
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

async fn sleep_until_instant(instant: Option<Instant>) {
    match instant {
        Some(instant) => tokio::time::sleep_until(tokio::time::Instant::from_std(instant)).await,
        None => std::future::pending().await,
    }
}

fn substitute_server(url: &str, server: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_owned();
    };
    match url::Url::parse(server) {
        Ok(server_url) if server_url.host_str().is_some() => {
            let _ = parsed.set_scheme(server_url.scheme());
            let _ = parsed.set_host(server_url.host_str());
            let _ = parsed.set_port(server_url.port());
        }
        _ => {
            let _ = parsed.set_host(Some(server));
        }
    }
    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Method;

    use super::{HedgeMode, HedgePolicy, substitute_server};

    #[test]
    fn method_gating_defaults_to_safe_reads() {
        let policy = HedgePolicy::standard();
        assert!(policy.applies(&Method::GET));
        assert!(!policy.applies(&Method::POST));
    }

    #[test]
    fn disabled_policy_never_applies() {
        let policy = HedgePolicy::disabled().max_hedges(3);
        assert!(!policy.applies(&Method::GET));
    }

    #[test]
    fn zero_hedges_never_applies() {
        let policy = HedgePolicy::standard().max_hedges(0);
        assert!(!policy.applies(&Method::GET));
    }

    #[test]
    fn hedge_delays_grow_geometrically() {
        let policy = HedgePolicy::standard()
            .hedge_delay(Duration::from_millis(50))
            .delay_multiplier(2.0)
            .max_hedges(3);
        assert_eq!(policy.delay_for_hedge(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_hedge(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_hedge(3), Duration::from_millis(200));
    }

    #[test]
    fn servers_rotate_by_hedge_index() {
        let policy = HedgePolicy::standard()
            .max_hedges(4)
            .servers(["https://b.example.com", "https://c.example.com"]);
        assert_eq!(policy.server_for_hedge(1), Some("https://c.example.com"));
        assert_eq!(policy.server_for_hedge(2), Some("https://b.example.com"));
    }

    #[test]
    fn substitute_server_replaces_origin() {
        assert_eq!(
            substitute_server("https://a.example.com/v1/items?x=1", "https://b.example.com:8443"),
            "https://b.example.com:8443/v1/items?x=1"
        );
        assert_eq!(
            substitute_server("https://a.example.com/v1/items", "b.example.com"),
            "https://b.example.com/v1/items"
        );
    }

    #[test]
    fn mode_defaults_to_race() {
        assert_eq!(HedgePolicy::standard().mode, HedgeMode::Race);
    }
}
