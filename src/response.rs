use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, RequestSnapshot, ResponseSnapshot};
use crate::transport::TransportResponse;

/// How the response body should be materialized into `Response::data`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseType {
    /// Sniff from Content-Type: `application/json` or `+json` parses as
    /// JSON, everything else falls back to text.
    #[default]
    Auto,
    Text,
    Json,
    Xml,
    Html,
    Blob,
    ArrayBuffer,
    Stream,
    NdJson,
}

impl ResponseType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Text => "text",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Html => "html",
            Self::Blob => "blob",
            Self::ArrayBuffer => "array_buffer",
            Self::Stream => "stream",
            Self::NdJson => "ndjson",
        }
    }
}

/// The parsed body, shaped by the response-type hint.
#[derive(Clone, Debug)]
pub enum Payload {
    Empty,
    Text(String),
    Json(Value),
    Binary(Bytes),
    NdJson(Vec<Value>),
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    /// Raw body bytes, kept alongside the parsed payload so typed
    /// accessors can deserialize independently of the hint.
    pub body: Bytes,
    pub data: Payload,
    pub request: RequestSnapshot,
    /// Attempts the call used to produce this response.
    pub attempts: usize,
}

impl Response {
    pub(crate) fn from_transport(
        transport: TransportResponse,
        hint: ResponseType,
        request: RequestSnapshot,
        attempt: usize,
    ) -> Result<Self, Error> {
        let status_text = transport.status_text.unwrap_or_else(|| {
            transport
                .status
                .canonical_reason()
                .unwrap_or("")
                .to_owned()
        });
        let data = parse_payload(hint, &transport.headers, &transport.body).map_err(|message| {
            Error::Parse {
                message,
                request: request.clone(),
                response: Some(ResponseSnapshot {
                    status: transport.status.as_u16(),
                    status_text: status_text.clone(),
                    headers: transport.headers.clone(),
                }),
                attempt,
                cause: None,
            }
        })?;
        Ok(Self {
            status: transport.status,
            status_text,
            headers: transport.headers,
            body: transport.body,
            data,
            request,
            attempts: attempt,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Parse {
            message: format!("failed to decode response json: {source}"),
            request: self.request.clone(),
            response: Some(self.snapshot_of()),
            attempt: self.attempts,
            cause: Some(Arc::new(source)),
        })
    }

    pub fn ndjson(&self) -> crate::Result<Vec<Value>> {
        parse_ndjson(&self.body).map_err(|message| Error::Parse {
            message,
            request: self.request.clone(),
            response: Some(self.snapshot_of()),
            attempt: self.attempts,
            cause: None,
        })
    }

    pub(crate) fn snapshot_of(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            status: self.status.as_u16(),
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn synthetic(status: u16, body: Bytes) -> Self {
        let status = StatusCode::from_u16(status).expect("test status should be valid");
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or("").to_owned(),
            headers: HeaderMap::new(),
            data: if body.is_empty() {
                Payload::Empty
            } else {
                Payload::Binary(body.clone())
            },
            body,
            request: RequestSnapshot {
                method: http::Method::GET,
                url: "https://synthetic.test/".to_owned(),
                tags: Vec::new(),
            },
            attempts: 1,
        }
    }
}

fn content_type_is_json(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media_type == "application/json" || media_type.ends_with("+json")
}

fn parse_payload(
    hint: ResponseType,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Payload, String> {
    if body.is_empty() {
        return Ok(Payload::Empty);
    }
    match hint {
        ResponseType::Auto => {
            if content_type_is_json(headers) {
                parse_json(body).map(Payload::Json)
            } else {
                Ok(Payload::Text(String::from_utf8_lossy(body).into_owned()))
            }
        }
        ResponseType::Json => parse_json(body).map(Payload::Json),
        ResponseType::Text | ResponseType::Xml | ResponseType::Html => {
            Ok(Payload::Text(String::from_utf8_lossy(body).into_owned()))
        }
        ResponseType::Blob | ResponseType::ArrayBuffer | ResponseType::Stream => {
            Ok(Payload::Binary(body.clone()))
        }
        ResponseType::NdJson => parse_ndjson(body).map(Payload::NdJson),
    }
}

fn parse_json(body: &[u8]) -> Result<Value, String> {
    serde_json::from_slice(body).map_err(|source| format!("failed to decode json body: {source}"))
}

fn parse_ndjson(body: &[u8]) -> Result<Vec<Value>, String> {
    let text = String::from_utf8_lossy(body);
    let mut values = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value = serde_json::from_str(line)
            .map_err(|source| format!("failed to decode ndjson line {}: {source}", index + 1))?;
        values.push(value);
    }
    Ok(values)
}
