//! Types exchanged with a paginated remote collection

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One JSON object decoded from a remote page.
///
/// Records are handed to the fill and create callbacks untouched. Identity
/// extraction only ever reads the configured identity field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRecord(Map<String, Value>);

impl RemoteRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Get a field value
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Get a field as a string slice, if it is a JSON string
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Get a field as an integer, if it is a JSON integer
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.0.get(field).and_then(Value::as_i64)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl TryFrom<Value> for RemoteRecord {
    type Error = FetchError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(FetchError::MalformedResponse(format!(
                "page item is not an object: {}",
                json_kind(&other)
            ))),
        }
    }
}

/// Continuation token pointing at the next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageToken {
    /// Absolute or target-relative URL taken from a `Link: rel="next"` header
    Url(String),
    /// Page number for collections that paginate through a body counter
    Page(u32),
}

/// A page request queued on the network queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based position of the page within the run
    pub number: u32,
    /// Continuation token; `None` requests the target's first page
    pub token: Option<PageToken>,
}

impl PageRequest {
    /// Request for the first page of a run
    pub fn first() -> Self {
        Self {
            number: 1,
            token: None,
        }
    }

    /// Request for the page following this one
    pub fn next(&self, token: PageToken) -> Self {
        Self {
            number: self.number + 1,
            token: Some(token),
        }
    }
}

/// Outcome of fetching one page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageResult {
    pub records: Vec<RemoteRecord>,
    /// Continuation token, absent on the last page
    pub next: Option<PageToken>,
    /// The server reported an exhausted request quota; pagination stops here
    pub rate_limited: bool,
}

impl PageResult {
    /// Empty terminal page produced when the request quota is exhausted
    pub fn rate_limited() -> Self {
        Self {
            records: Vec::new(),
            next: None,
            rate_limited: true,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Raw HTTP response as seen by the page fetcher.
///
/// Header names are stored lowercased. Repeated headers are joined with `", "`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Response with a JSON body
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: body.to_string().into_bytes(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Error types for fetching remote pages
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
