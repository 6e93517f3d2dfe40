use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::Client;
use crate::config::{DebounceSetting, DedupSetting, RetrySetting, TimeoutSetting};
use crate::error::{Error, RequestSnapshot};
use crate::hedge::HedgePolicy;
use crate::response::{Response, ResponseType};
use crate::signal::CancelToken;
use crate::util::redact_url_for_logs;

#[derive(Clone, Debug)]
pub struct RequestBody {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// The request record flowing through the pipeline. Plugins receive it
/// mutably via the call context; policy fields override client defaults
/// wholesale when set.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub timeout: TimeoutSetting,
    pub response_type: Option<ResponseType>,
    pub tags: Vec<String>,
    pub retry: Option<RetrySetting>,
    pub hedge: Option<HedgePolicy>,
    pub dedup: Option<DedupSetting>,
    pub debounce: Option<DebounceSetting>,
    pub rate_limited: Option<bool>,
    pub ignore_response_error: Option<bool>,
    pub cancel: Option<CancelToken>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            timeout: TimeoutSetting::Default,
            response_type: None,
            tags: Vec::new(),
            retry: None,
            hedge: None,
            dedup: None,
            debounce: None,
            rate_limited: None,
            ignore_response_error: None,
            cancel: None,
        }
    }

    pub(crate) fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            method: self.method.clone(),
            url: redact_url_for_logs(&self.url),
            tags: self.tags.clone(),
        }
    }

    fn encode_error(&self, message: String, cause: serde_json::Error) -> Error {
        Error::Parse {
            message,
            request: self.snapshot(),
            response: None,
            attempt: 0,
            cause: Some(std::sync::Arc::new(cause)),
        }
    }
}

/// multipart/form-data encoder backing `post_multipart`. Parts are
/// written eagerly into one buffer; `finish` appends the closing
/// boundary.
pub struct MultipartForm {
    boundary: String,
    buffer: Vec<u8>,
}

impl MultipartForm {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let boundary = format!(
            "reqflow-{:016x}{:016x}",
            rng.random::<u64>(),
            rng.random::<u64>()
        );
        Self {
            boundary,
            buffer: Vec::new(),
        }
    }

    pub fn text(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.open_part(name.as_ref(), None, None);
        self.buffer.extend_from_slice(value.as_ref().as_bytes());
        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    pub fn file(
        mut self,
        name: impl AsRef<str>,
        filename: impl AsRef<str>,
        content_type: impl AsRef<str>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        self.open_part(
            name.as_ref(),
            Some(filename.as_ref()),
            Some(content_type.as_ref()),
        );
        self.buffer.extend_from_slice(&bytes.into());
        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    fn open_part(&mut self, name: &str, filename: Option<&str>, content_type: Option<&str>) {
        self.buffer
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        let mut disposition = format!(
            "Content-Disposition: form-data; name=\"{}\"",
            escape_part_token(name)
        );
        if let Some(filename) = filename {
            disposition.push_str(&format!("; filename=\"{}\"", escape_part_token(filename)));
        }
        disposition.push_str("\r\n");
        self.buffer.extend_from_slice(disposition.as_bytes());
        if let Some(content_type) = content_type {
            self.buffer
                .extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        self.buffer.extend_from_slice(b"\r\n");
    }

    pub(crate) fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub(crate) fn finish(mut self) -> Bytes {
        self.buffer
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        Bytes::from(self.buffer)
    }
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

// Quotes and line breaks in a part name would break the disposition line.
fn escape_part_token(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "")
        .replace('\n', "")
}

#[doc(hidden)]
pub struct RequestBuilder<'a> {
    client: &'a Client,
    request: Request,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, url: String) -> Self {
        Self {
            client,
            request: Request::new(method, url),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.request.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let parsed_name: HeaderName = name.parse().map_err(|_| Error::Parse {
            message: format!("invalid header name {name}"),
            request: self.request.snapshot(),
            response: None,
            attempt: 0,
            cause: None,
        })?;
        let parsed_value: HeaderValue = value.parse().map_err(|_| Error::Parse {
            message: format!("invalid header value for {name}"),
            request: self.request.snapshot(),
            response: None,
            attempt: 0,
            cause: None,
        })?;
        Ok(self.header(parsed_name, parsed_value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.request.query.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params).map_err(|source| Error::Parse {
            message: format!("failed to encode query: {source}"),
            request: self.request.snapshot(),
            response: None,
            attempt: 0,
            cause: None,
        })?;
        self.request.query.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.request.body = Some(RequestBody {
            bytes: body.into(),
            content_type: Some(content_type.into()),
        });
        self
    }

    pub fn json<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_json::to_vec(payload).map_err(|source| {
            self.request
                .encode_error("failed to encode request body json".to_owned(), source)
        })?;
        self.request.body = Some(RequestBody {
            bytes: Bytes::from(encoded),
            content_type: Some("application/json".to_owned()),
        });
        Ok(self)
    }

    pub fn form<T>(mut self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload).map_err(|source| Error::Parse {
            message: format!("failed to encode form body: {source}"),
            request: self.request.snapshot(),
            response: None,
            attempt: 0,
            cause: None,
        })?;
        self.request.body = Some(RequestBody {
            bytes: Bytes::from(encoded),
            content_type: Some("application/x-www-form-urlencoded".to_owned()),
        });
        Ok(self)
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.request.body = Some(RequestBody {
            bytes: Bytes::from(body.into()),
            content_type: Some("text/plain; charset=utf-8".to_owned()),
        });
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        let content_type = form.content_type();
        self.request.body = Some(RequestBody {
            bytes: form.finish(),
            content_type: Some(content_type),
        });
        self
    }

    /// XML envelope body for SOAP endpoints; responses default to the XML
    /// hint.
    pub fn soap(mut self, envelope: impl Into<String>) -> Self {
        self.request.body = Some(RequestBody {
            bytes: Bytes::from(envelope.into()),
            content_type: Some("text/xml; charset=utf-8".to_owned()),
        });
        if self.request.response_type.is_none() {
            self.request.response_type = Some(ResponseType::Xml);
        }
        self
    }

    /// Per-attempt timeout. `Duration::ZERO` disables the timeout rather
    /// than inheriting the client default.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.request.timeout = TimeoutSetting::after(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.request.timeout = TimeoutSetting::Disabled;
        self
    }

    /// Accepts a retry count, `false`, or a full policy.
    pub fn retry(mut self, retry: impl Into<RetrySetting>) -> Self {
        self.request.retry = Some(retry.into());
        self
    }

    pub fn hedge(mut self, hedge: HedgePolicy) -> Self {
        self.request.hedge = Some(hedge);
        self
    }

    pub fn dedup(mut self, dedup: impl Into<DedupSetting>) -> Self {
        self.request.dedup = Some(dedup.into());
        self
    }

    pub fn debounce(mut self, debounce: impl Into<DebounceSetting>) -> Self {
        self.request.debounce = Some(debounce.into());
        self
    }

    pub fn rate_limited(mut self, rate_limited: bool) -> Self {
        self.request.rate_limited = Some(rate_limited);
        self
    }

    /// Return non-2xx responses as successes instead of `Http` errors.
    pub fn ignore_response_error(mut self, ignore: bool) -> Self {
        self.request.ignore_response_error = Some(ignore);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.request.response_type = Some(response_type);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.request.tags.push(tag.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.request.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// External cancellation root for this call.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.request.cancel = Some(cancel);
        self
    }

    pub async fn send(self) -> crate::Result<Response> {
        self.client.execute(self.request).await
    }

    pub async fn send_json<T>(mut self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        if self.request.response_type.is_none() {
            self.request.response_type = Some(ResponseType::Json);
        }
        let response = self.send().await?;
        response.json()
    }

    pub async fn send_text(mut self) -> crate::Result<String> {
        if self.request.response_type.is_none() {
            self.request.response_type = Some(ResponseType::Text);
        }
        let response = self.send().await?;
        Ok(response.text())
    }

    pub async fn send_bytes(mut self) -> crate::Result<Bytes> {
        if self.request.response_type.is_none() {
            self.request.response_type = Some(ResponseType::ArrayBuffer);
        }
        let response = self.send().await?;
        Ok(response.body.clone())
    }

    pub async fn send_ndjson(mut self) -> crate::Result<Vec<Value>> {
        self.request.response_type = Some(ResponseType::NdJson);
        let response = self.send().await?;
        response.ndjson()
    }
}

/// Ensure the body's declared content type is present as a header before
/// the transport sees the request.
pub(crate) fn apply_body_content_type(headers: &mut HeaderMap, body: Option<&RequestBody>) {
    if headers.contains_key(CONTENT_TYPE) {
        return;
    }
    if let Some(content_type) = body.and_then(|body| body.content_type.as_deref())
        && let Ok(value) = HeaderValue::from_str(content_type)
    {
        headers.insert(CONTENT_TYPE, value);
    }
}
