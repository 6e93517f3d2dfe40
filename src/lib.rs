//! `reqflow` is a request-lifecycle orchestrator for HTTP clients: it
//! wraps a pluggable transport with pre-flight admission control
//! (debouncing, rate limiting, deduplication), in-flight reliability
//! (timeouts, retries with backoff, request hedging), and a deterministic
//! plugin pipeline, instrumented by a stats event bus.
//!
//! The HTTP transport itself is a collaborator behind the [`Transport`]
//! trait: one method taking a prepared request and a cancellation token.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use reqflow::{CancelToken, Client, PreparedRequest, RateLimitPolicy, RetryPolicy};
//! use reqflow::{Transport, TransportError, TransportResponse};
//!
//! struct MyTransport;
//!
//! #[async_trait::async_trait]
//! impl Transport for MyTransport {
//!     async fn send(
//!         &self,
//!         request: &PreparedRequest,
//!         cancel: &CancelToken,
//!     ) -> Result<TransportResponse, TransportError> {
//!         // Issue `request` over your HTTP stack of choice, watching
//!         // `cancel` for teardown.
//!         unimplemented!()
//!     }
//! }
//!
//! # async fn demo() -> Result<(), reqflow::Error> {
//! let client = Client::builder(MyTransport)
//!     .base_url("https://api.example.com")
//!     .client_name("my-service")
//!     .retry_policy(
//!         RetryPolicy::standard()
//!             .max_retries(3)
//!             .base_delay(Duration::from_millis(100)),
//!     )
//!     .rate_limit_policy(RateLimitPolicy::standard().rate_per_second(20.0).burst(10))
//!     .build()?;
//!
//! let profile: serde_json::Value = client.get_json("/v1/profile").await?;
//! println!("profile = {profile}");
//! # Ok(())
//! # }
//! ```

mod client;
mod core;
mod debounce;
mod dedup;
mod hedge;
mod pipeline;
mod rate_limit;
mod request;
mod response;
mod transport;

pub(crate) use crate::core::config;
pub(crate) use crate::core::error;
pub(crate) use crate::core::retry;
pub(crate) use crate::core::signal;
pub(crate) use crate::core::stats;
pub(crate) use crate::core::util;

pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{DebounceSetting, DedupSetting, RetrySetting, TimeoutSetting};
pub use crate::debounce::{DebounceKeyStrategy, DebouncePolicy};
pub use crate::dedup::{DedupKeyStrategy, DedupPolicy};
pub use crate::error::{AbortReason, Error, ErrorKind, RequestSnapshot, ResponseSnapshot};
pub use crate::hedge::{HedgeMode, HedgePolicy};
pub use crate::pipeline::{CallContext, Plugin, PluginFault};
pub use crate::rate_limit::{RateLimitPolicy, RateLimitScope};
pub use crate::request::{MultipartForm, Request, RequestBody, RequestBuilder};
pub use crate::response::{Payload, Response, ResponseType};
pub use crate::retry::{Backoff, RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::signal::{CancelReason, CancelToken, LinkedToken};
pub use crate::stats::{MetricsSnapshot, StatsEvent, StatsLabels, StatsSink};
pub use crate::transport::{PreparedRequest, Transport, TransportError, TransportResponse};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Backoff, CancelToken, Client, DebouncePolicy, DedupPolicy, Error, ErrorKind, HedgeMode,
        HedgePolicy, MultipartForm, Plugin, RateLimitPolicy, RateLimitScope, Response,
        ResponseType, Result, RetryPolicy, Transport, TransportError, TransportResponse,
    };
}

#[cfg(test)]
mod tests;
