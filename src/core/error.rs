use std::sync::Arc;

use http::{HeaderMap, Method};
use thiserror::Error;

type SharedCause = Arc<dyn std::error::Error + Send + Sync>;

/// The six user-visible failure classes. Every error the crate surfaces
/// maps to exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    Http,
    Timeout,
    Abort,
    Network,
    Parse,
    Plugin,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Timeout => "timeout",
            Self::Abort => "abort",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::Plugin => "plugin",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Why an abort-class error fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller's cancellation handle fired.
    User,
    /// A newer call with the same debounce key superseded this one.
    Debounced,
}

impl AbortReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Debounced => "debounced",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Immutable view of the request a result or error belongs to. The URL is
/// pre-redacted: no credentials, no query.
#[derive(Clone, Debug)]
pub struct RequestSnapshot {
    pub method: Method,
    pub url: String,
    pub tags: Vec<String>,
}

/// Status line and headers of the response an error was produced from.
#[derive(Clone, Debug)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
}

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("http status {status} for {} {}", .request.method, .request.url)]
    Http {
        status: u16,
        status_text: String,
        request: RequestSnapshot,
        response: ResponseSnapshot,
        attempt: usize,
    },
    #[error("request timed out after {timeout_ms}ms for {} {}", .request.method, .request.url)]
    Timeout {
        timeout_ms: u128,
        request: RequestSnapshot,
        attempt: usize,
    },
    #[error("request aborted ({reason}) for {} {}", .request.method, .request.url)]
    Abort {
        reason: AbortReason,
        request: RequestSnapshot,
        attempt: usize,
    },
    #[error("network error for {} {}: {message}", .request.method, .request.url)]
    Network {
        message: String,
        request: RequestSnapshot,
        attempt: usize,
        cause: Option<SharedCause>,
    },
    #[error("failed to parse response body for {} {}: {message}", .request.method, .request.url)]
    Parse {
        message: String,
        request: RequestSnapshot,
        response: Option<ResponseSnapshot>,
        attempt: usize,
        cause: Option<SharedCause>,
    },
    #[error("plugin {plugin} failed for {} {}: {message}", .request.method, .request.url)]
    Plugin {
        plugin: String,
        message: String,
        request: RequestSnapshot,
        response: Option<ResponseSnapshot>,
        attempt: usize,
        cause: Option<SharedCause>,
    },
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Http { .. } => ErrorKind::Http,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Abort { .. } => ErrorKind::Abort,
            Self::Network { .. } => ErrorKind::Network,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Plugin { .. } => ErrorKind::Plugin,
        }
    }

    /// The 1-based attempt the error was produced on. Lets callers tell
    /// "failed on first try" apart from "exhausted retries".
    pub const fn attempt(&self) -> usize {
        match self {
            Self::Http { attempt, .. }
            | Self::Timeout { attempt, .. }
            | Self::Abort { attempt, .. }
            | Self::Network { attempt, .. }
            | Self::Parse { attempt, .. }
            | Self::Plugin { attempt, .. } => *attempt,
        }
    }

    pub const fn request(&self) -> &RequestSnapshot {
        match self {
            Self::Http { request, .. }
            | Self::Timeout { request, .. }
            | Self::Abort { request, .. }
            | Self::Network { request, .. }
            | Self::Parse { request, .. }
            | Self::Plugin { request, .. } => request,
        }
    }

    pub fn response(&self) -> Option<&ResponseSnapshot> {
        match self {
            Self::Http { response, .. } => Some(response),
            Self::Parse { response, .. } | Self::Plugin { response, .. } => response.as_ref(),
            Self::Timeout { .. } | Self::Abort { .. } | Self::Network { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.response().map(|response| response.status)
    }

    /// The underlying cause, if the error wraps one. Shared so dedup
    /// followers carry the same value the leader saw.
    pub fn cause(&self) -> Option<&SharedCause> {
        match self {
            Self::Network { cause, .. } | Self::Parse { cause, .. } | Self::Plugin { cause, .. } => {
                cause.as_ref()
            }
            Self::Http { .. } | Self::Timeout { .. } | Self::Abort { .. } => None,
        }
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Abort { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub(crate) fn set_attempt(&mut self, value: usize) {
        match self {
            Self::Http { attempt, .. }
            | Self::Timeout { attempt, .. }
            | Self::Abort { attempt, .. }
            | Self::Network { attempt, .. }
            | Self::Parse { attempt, .. }
            | Self::Plugin { attempt, .. } => *attempt = value,
        }
    }
}
