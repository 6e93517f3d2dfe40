use std::time::Duration;

use http::HeaderMap;

use crate::debounce::DebouncePolicy;
use crate::dedup::DedupPolicy;
use crate::error::{Error, RequestSnapshot};
use crate::hedge::HedgePolicy;
use crate::request::Request;
use crate::response::ResponseType;
use crate::retry::RetryPolicy;
use crate::util::{append_query_pairs, merge_headers, redact_url_for_logs, resolve_url};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call timeout knob. `Disabled` (the `timeout = 0` spelling) is
/// recorded distinctly from "inherit the default".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeoutSetting {
    #[default]
    Default,
    Disabled,
    After(Duration),
}

impl TimeoutSetting {
    pub fn after(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self::Disabled
        } else {
            Self::After(timeout)
        }
    }
}

impl From<Duration> for TimeoutSetting {
    fn from(timeout: Duration) -> Self {
        Self::after(timeout)
    }
}

/// Per-call retry knob: a whole policy, a retry count, or off. Normalized
/// to a `RetryPolicy` during resolution; no field-level merging across
/// levels.
#[derive(Clone, Debug)]
pub enum RetrySetting {
    Disabled,
    Max(usize),
    Policy(RetryPolicy),
}

impl From<bool> for RetrySetting {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Policy(RetryPolicy::standard())
        } else {
            Self::Disabled
        }
    }
}

impl From<usize> for RetrySetting {
    fn from(max_retries: usize) -> Self {
        if max_retries == 0 {
            Self::Disabled
        } else {
            Self::Max(max_retries)
        }
    }
}

impl From<RetryPolicy> for RetrySetting {
    fn from(policy: RetryPolicy) -> Self {
        Self::Policy(policy)
    }
}

#[derive(Clone, Debug)]
pub enum DedupSetting {
    Disabled,
    Enabled(DedupPolicy),
}

impl From<bool> for DedupSetting {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled(DedupPolicy::standard())
        } else {
            Self::Disabled
        }
    }
}

impl From<DedupPolicy> for DedupSetting {
    fn from(policy: DedupPolicy) -> Self {
        Self::Enabled(policy)
    }
}

#[derive(Clone, Debug)]
pub enum DebounceSetting {
    Disabled,
    Enabled(DebouncePolicy),
}

impl From<bool> for DebounceSetting {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled(DebouncePolicy::standard())
        } else {
            Self::Disabled
        }
    }
}

impl From<DebouncePolicy> for DebounceSetting {
    fn from(policy: DebouncePolicy) -> Self {
        Self::Enabled(policy)
    }
}

/// Client-level defaults the resolver merges per-call options over.
#[derive(Clone, Debug)]
pub(crate) struct ClientDefaults {
    pub(crate) base_url: Option<String>,
    pub(crate) default_headers: HeaderMap,
    pub(crate) timeout: TimeoutSetting,
    pub(crate) retry: RetryPolicy,
    pub(crate) hedge: Option<HedgePolicy>,
    pub(crate) dedup: Option<DedupPolicy>,
    pub(crate) debounce: Option<DebouncePolicy>,
    pub(crate) ignore_response_error: bool,
    pub(crate) response_type: ResponseType,
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            timeout: TimeoutSetting::Default,
            retry: RetryPolicy::standard(),
            hedge: None,
            dedup: None,
            debounce: None,
            ignore_response_error: false,
            response_type: ResponseType::Auto,
        }
    }
}

/// The fully-resolved view of one call: the normalized request record plus
/// the policies chosen for it.
#[derive(Clone, Debug)]
pub(crate) struct EffectiveCall {
    pub(crate) request: Request,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: RetryPolicy,
    pub(crate) hedge: Option<HedgePolicy>,
    pub(crate) dedup: Option<DedupPolicy>,
    pub(crate) debounce: Option<DebouncePolicy>,
    pub(crate) rate_limited: bool,
    pub(crate) ignore_response_error: bool,
    pub(crate) response_type: ResponseType,
    pub(crate) snapshot: RequestSnapshot,
    pub(crate) domain: String,
    pub(crate) endpoint: String,
}

/// Merge per-call options over client defaults over built-ins. Scalar
/// fields merge shallowly, header maps deeply; policy records are taken
/// whole from the most specific level that sets them.
pub(crate) fn resolve(defaults: &ClientDefaults, mut request: Request) -> Result<EffectiveCall, Error> {
    let mut url = resolve_url(defaults.base_url.as_deref(), &request.url).map_err(|message| {
        Error::Network {
            message,
            request: RequestSnapshot {
                method: request.method.clone(),
                url: redact_url_for_logs(&request.url),
                tags: request.tags.clone(),
            },
            attempt: 0,
            cause: None,
        }
    })?;
    append_query_pairs(&mut url, &request.query);
    request.query.clear();
    request.headers = merge_headers(&defaults.default_headers, &request.headers);

    let domain = crate::util::domain_of(&url);
    let endpoint = crate::util::endpoint_key(&request.method, &url);
    let snapshot = RequestSnapshot {
        method: request.method.clone(),
        url: redact_url_for_logs(url.as_str()),
        tags: request.tags.clone(),
    };
    request.url = url.into();

    let timeout = match request.timeout {
        TimeoutSetting::Default => match defaults.timeout {
            TimeoutSetting::Default => Some(DEFAULT_TIMEOUT),
            TimeoutSetting::Disabled => None,
            TimeoutSetting::After(timeout) => Some(timeout),
        },
        TimeoutSetting::Disabled => None,
        TimeoutSetting::After(timeout) => Some(timeout),
    };

    let retry = match &request.retry {
        None => defaults.retry.clone(),
        Some(RetrySetting::Disabled) => RetryPolicy::disabled(),
        Some(RetrySetting::Max(max_retries)) => RetryPolicy::standard().max_retries(*max_retries),
        Some(RetrySetting::Policy(policy)) => policy.clone(),
    };

    // An explicit per-call hedge policy replaces the client's wholesale, so
    // `enabled = false` at the call site beats a client-level policy.
    let hedge = match &request.hedge {
        Some(policy) => Some(policy.clone()),
        None => defaults.hedge.clone(),
    }
    .filter(HedgePolicy::is_enabled);

    let dedup = match &request.dedup {
        Some(DedupSetting::Disabled) => None,
        Some(DedupSetting::Enabled(policy)) => Some(policy.clone()),
        None => defaults.dedup.clone(),
    };

    let debounce = match &request.debounce {
        Some(DebounceSetting::Disabled) => None,
        Some(DebounceSetting::Enabled(policy)) => Some(policy.clone()),
        None => defaults.debounce.clone(),
    };

    Ok(EffectiveCall {
        rate_limited: request.rate_limited.unwrap_or(true),
        ignore_response_error: request
            .ignore_response_error
            .unwrap_or(defaults.ignore_response_error),
        response_type: request.response_type.unwrap_or(defaults.response_type),
        timeout,
        retry,
        hedge,
        dedup,
        debounce,
        snapshot,
        domain,
        endpoint,
        request,
    })
}
