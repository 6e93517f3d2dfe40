use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::error::{AbortReason, Error, RequestSnapshot};
use crate::signal::{CancelReason, CancelToken};

/// The request as the transport sees it: one fully-prepared attempt after
/// config resolution and the plugin onRequest chain.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Per-attempt timeout the orchestrator enforces; exposed so the
    /// transport can set socket deadlines to match.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub status_text: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Failures a transport may raise. Everything here is wrapped into the
/// crate's error taxonomy before the retry orchestrator sees it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {message}")]
    Connect { message: String },
    #[error("i/o error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("transport timed out")]
    TimedOut,
    #[error("transport observed cancellation")]
    Cancelled,
}

/// The single seam the orchestrator requires: take one prepared request
/// and a cancellation token, return a response or a transport error. The
/// token fires at the latest when the attempt is torn down; transports
/// should stop work when they observe it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &PreparedRequest,
        cancel: &CancelToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// Fold a transport failure into the taxonomy. A token fired with a
/// timeout reason wins over whatever the transport reported.
pub(crate) fn wrap_transport_error(
    error: TransportError,
    snapshot: &RequestSnapshot,
    attempt: usize,
    cancel: &CancelToken,
    timeout: Option<Duration>,
) -> Error {
    let timeout_ms = timeout.map(|value| value.as_millis()).unwrap_or(0);
    if cancel.fired_reason() == Some(CancelReason::Timeout) {
        return Error::Timeout {
            timeout_ms,
            request: snapshot.clone(),
            attempt,
        };
    }
    match error {
        TransportError::TimedOut => Error::Timeout {
            timeout_ms,
            request: snapshot.clone(),
            attempt,
        },
        TransportError::Cancelled => {
            let reason = match cancel.fired_reason() {
                Some(CancelReason::Debounced) => AbortReason::Debounced,
                _ => AbortReason::User,
            };
            Error::Abort {
                reason,
                request: snapshot.clone(),
                attempt,
            }
        }
        TransportError::Connect { message } => Error::Network {
            message,
            request: snapshot.clone(),
            attempt,
            cause: None,
        },
        TransportError::Io { message, source } => Error::Network {
            message,
            request: snapshot.clone(),
            attempt,
            cause: source.map(Arc::from),
        },
    }
}
