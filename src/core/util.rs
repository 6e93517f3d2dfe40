use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use http::{HeaderMap, Method};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Client default headers under per-request headers; request wins per name.
pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for (name, value) in request_headers {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Resolve a possibly base-relative request URL into an absolute one.
pub(crate) fn resolve_url(base_url: Option<&str>, raw: &str) -> Result<url::Url, String> {
    let absolute = if raw.contains("://") {
        raw.to_owned()
    } else {
        let Some(base) = base_url else {
            return Err(format!("relative url {raw} requires a client base url"));
        };
        join_base_path(base, raw)
    };
    let parsed =
        url::Url::parse(&absolute).map_err(|source| format!("invalid url {absolute}: {source}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported url scheme for {absolute}"));
    }
    if parsed.host_str().is_none() {
        return Err(format!("url {absolute} is missing a host"));
    }
    Ok(parsed)
}

/// Append ordered query pairs to an absolute URL, keeping existing pairs.
pub(crate) fn append_query_pairs(url: &mut url::Url, query_pairs: &[(String, String)]) {
    if query_pairs.is_empty() {
        return;
    }
    let existing: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in existing.iter().chain(query_pairs) {
        serializer.append_pair(name, value);
    }
    let merged = serializer.finish();
    url.set_query(if merged.is_empty() { None } else { Some(&merged) });
}

/// Strip credentials, query, and fragment before a URL reaches logs, stats
/// labels, or error values.
pub(crate) fn redact_url_for_logs(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw) else {
        let cutoff = raw
            .find('?')
            .or_else(|| raw.find('#'))
            .unwrap_or(raw.len());
        return raw[..cutoff].to_owned();
    };
    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn domain_of(url: &url::Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}

/// Stats/rate-limit endpoint key: uppercase method plus query-stripped path.
pub(crate) fn endpoint_key(method: &Method, url: &url::Url) -> String {
    format!("{} {}", method, url.path())
}

pub(crate) fn body_fingerprint(body: &[u8]) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    body.hash(&mut hasher);
    hasher.finish()
}

/// Glob matching for rate-limit include/exclude patterns. `*` spans any
/// run of characters, `?` exactly one.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let mut pattern_index = 0;
    let mut text_index = 0;
    let mut star_pattern: Option<usize> = None;
    let mut star_text = 0;

    while text_index < text.len() {
        if pattern_index < pattern.len()
            && (pattern[pattern_index] == '?' || pattern[pattern_index] == text[text_index])
        {
            pattern_index += 1;
            text_index += 1;
        } else if pattern_index < pattern.len() && pattern[pattern_index] == '*' {
            star_pattern = Some(pattern_index);
            star_text = text_index;
            pattern_index += 1;
        } else if let Some(star) = star_pattern {
            pattern_index = star + 1;
            star_text += 1;
            text_index = star_text;
        } else {
            return false;
        }
    }
    while pattern_index < pattern.len() && pattern[pattern_index] == '*' {
        pattern_index += 1;
    }
    pattern_index == pattern.len()
}

/// Parse a Retry-After header: integral seconds or an HTTP-date. An
/// invalid value yields zero so the caller falls through to backoff.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    match httpdate::parse_http_date(raw_value) {
        Ok(date) => match date.duration_since(now) {
            Ok(duration) => Some(duration),
            Err(_) => Some(Duration::ZERO),
        },
        Err(_) => Some(Duration::ZERO),
    }
}
