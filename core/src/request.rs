use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::async_trait;
use crate::error::{Error, Result};
use crate::response::Response;
use crate::spider::CrawlResult;

/// Well-known keys of [`Request::meta`] shared between components
pub mod meta {
    /// Rate-limit slot the request is routed through
    pub const DOWNLOAD_SLOT: &str = "download_slot";
    /// Per-request fetch delay override, in seconds
    pub const DOWNLOAD_DELAY: &str = "download_delay";
    /// Link distance from the seed request
    pub const DEPTH: &str = "depth";
    /// Number of times the request has been retried
    pub const RETRY_TIMES: &str = "retry_times";
    /// Number of redirects followed to reach this request
    pub const REDIRECT_TIMES: &str = "redirect_times";
}

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Method {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
}

impl Method {
    /// Canonical upper-case name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler invoked with the outcome of a request instead of the spider's parse method.
///
/// The outcome is `Ok(response)` when the fetch succeeded, or the fetch error when
/// nothing in the fetch middleware chain recovered from it.
#[async_trait]
pub trait RequestCallback: Send + Sync + 'static {
    /// Handle the outcome of the request
    async fn call(&self, outcome: Result<Response>) -> Result<CrawlResult>;
}

#[async_trait]
impl<F> RequestCallback for F
where
    F: Fn(Result<Response>) -> Result<CrawlResult> + Send + Sync + 'static,
{
    async fn call(&self, outcome: Result<Response>) -> Result<CrawlResult> {
        (self)(outcome)
    }
}

/// Shared handle to a [`RequestCallback`]
#[derive(Clone)]
pub struct Callback(Arc<dyn RequestCallback>);

impl Callback {
    /// Wrap a callback implementation
    pub fn new<C: RequestCallback>(callback: C) -> Self {
        Self(Arc::new(callback))
    }

    /// Invoke the callback
    pub async fn call(&self, outcome: Result<Response>) -> Result<CrawlResult> {
        self.0.call(outcome).await
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// Represents an HTTP request to be made by the crawler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// The URL to request
    pub url: Url,

    /// The HTTP method to use
    #[serde(default)]
    pub method: Method,

    /// HTTP headers to include
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body (for POST, PUT, etc.)
    #[serde(default)]
    pub body: Option<Vec<u8>>,

    /// Side-channel for routing data shared between components
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,

    /// Priority of this request (higher values = higher priority)
    #[serde(default)]
    pub priority: i32,

    /// Handler to call instead of the spider's parse method
    #[serde(skip)]
    pub callback: Option<Callback>,

    /// Whether to bypass the duplicate filter
    #[serde(default)]
    pub dont_filter: bool,

    #[serde(skip)]
    fingerprint: OnceLock<String>,
}

impl Request {
    /// Create a request with the given method
    pub fn new<U: AsRef<str>>(method: Method, url: U) -> Result<Self> {
        let url = Url::parse(url.as_ref()).map_err(Error::UrlParse)?;
        Ok(Self {
            url,
            method,
            headers: HashMap::new(),
            body: None,
            meta: HashMap::new(),
            priority: 0,
            callback: None,
            dont_filter: false,
            fingerprint: OnceLock::new(),
        })
    }

    /// Create a new GET request
    pub fn get<U: AsRef<str>>(url: U) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    /// Create a new POST request
    pub fn post<U: AsRef<str>, B: Into<Vec<u8>>>(url: U, body: B) -> Result<Self> {
        Ok(Self::new(Method::POST, url)?.with_body(body))
    }

    /// Add a header to the request
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the request body
    pub fn with_body<B: Into<Vec<u8>>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self.fingerprint = OnceLock::new();
        self
    }

    /// Add metadata to the request
    pub fn with_meta<K: Into<String>, V: Into<serde_json::Value>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Set the callback for this request
    pub fn with_callback<C: RequestCallback>(mut self, callback: C) -> Self {
        self.callback = Some(Callback::new(callback));
        self
    }

    /// Set the priority for this request
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set whether to bypass the duplicate filter
    pub fn with_dont_filter(mut self, dont_filter: bool) -> Self {
        self.dont_filter = dont_filter;
        self
    }

    /// Look up a header by name, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The referring URL, if the request carries one
    pub fn referer(&self) -> Option<&str> {
        self.header("Referer")
    }

    /// Link distance from the seed request
    pub fn depth(&self) -> u64 {
        self.meta
            .get(meta::DEPTH)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Per-request delay override stored in meta
    pub fn download_delay(&self) -> Option<Duration> {
        self.meta
            .get(meta::DOWNLOAD_DELAY)
            .and_then(|v| v.as_f64())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Slot key assigned by the fetcher, if any
    pub fn download_slot(&self) -> Option<&str> {
        self.meta.get(meta::DOWNLOAD_SLOT).and_then(|v| v.as_str())
    }

    /// Read an integer counter from meta
    pub fn meta_u32(&self, key: &str) -> u32 {
        self.meta
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Hex SHA-256 identifying this request for duplicate detection.
    ///
    /// Covers the method, the canonical URL and the body. Headers are ignored.
    /// The value is computed on first use and cached; `url`, `method` and `body`
    /// must not be mutated afterwards.
    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(self.method.as_str().as_bytes());
            hasher.update(canonicalize_url(&self.url).as_bytes());
            if let Some(body) = &self.body {
                hasher.update(body);
            }
            hex::encode(hasher.finalize())
        })
    }
}

/// Canonical form of a URL for fingerprinting.
///
/// Query arguments are sorted by key then value and re-encoded, arguments
/// with blank values are kept, and the fragment is removed.
pub fn canonicalize_url(url: &Url) -> String {
    let mut canonical = format!("{}://", url.scheme());
    if let Some(host) = url.host_str() {
        canonical.push_str(host);
    }
    if let Some(port) = url.port() {
        canonical.push_str(&format!(":{}", port));
    }
    canonical.push_str(url.path());

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if !pairs.is_empty() {
        pairs.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        canonical.push('?');
        canonical.push_str(&query);
    }
    canonical
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for Request {}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.method, self.url)
    }
}
