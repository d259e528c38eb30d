use std::collections::HashMap;
use std::time::Duration;

use arachne_core::async_trait;
use arachne_core::error::{Error, ErrorContext, Result};
use arachne_core::request::{Method, Request};
use arachne_core::response::Response;
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client};

pub mod fetcher;
pub mod mock;

pub use fetcher::{Fetcher, FetcherConfig};

/// Transport for one URL scheme
#[async_trait]
pub trait DownloadHandler: Send + Sync + 'static {
    /// Perform the transfer for `request`.
    ///
    /// The slot key chosen by the fetcher is available through
    /// [`Request::download_slot`].
    async fn download(&self, request: Request) -> Result<Response>;

    /// Release the handler's resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Configuration for the HTTP handler
#[derive(Debug, Clone)]
pub struct HttpHandlerConfig {
    /// User agent string
    pub user_agent: String,

    /// Whole-transfer timeout
    pub timeout: Duration,

    /// Connection establishment timeout
    pub connect_timeout: Duration,

    /// Headers sent with every request unless the request sets them
    pub default_headers: HashMap<String, String>,
}

impl Default for HttpHandlerConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("arachne/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(30),
            default_headers: HashMap::new(),
        }
    }
}

impl HttpHandlerConfig {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_default_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }
}

/// HTTP(S) transport backed by reqwest.
///
/// Redirects are not followed here; `RedirectMiddleware` turns them into
/// replacement requests so they go back through the scheduler.
pub struct HttpDownloadHandler {
    client: Client,
}

impl HttpDownloadHandler {
    /// Create a new HTTP handler with the given configuration
    pub fn new(config: HttpHandlerConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        for (key, value) in &config.default_headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::other(format!("Invalid header name {}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::other(format!("Invalid value for header {}: {}", key, e)))?;
            default_headers.insert(name, value);
        }

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .default_headers(default_headers)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| Error::other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn build_reqwest_request(&self, request: &Request) -> reqwest::RequestBuilder {
        let method = match request.method {
            Method::GET => reqwest::Method::GET,
            Method::POST => reqwest::Method::POST,
            Method::PUT => reqwest::Method::PUT,
            Method::DELETE => reqwest::Method::DELETE,
            Method::HEAD => reqwest::Method::HEAD,
            Method::OPTIONS => reqwest::Method::OPTIONS,
            Method::PATCH => reqwest::Method::PATCH,
        };

        let mut builder = self.client.request(method, request.url.clone());
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

#[async_trait]
impl DownloadHandler for HttpDownloadHandler {
    async fn download(&self, request: Request) -> Result<Response> {
        debug!(
            "Downloading {} (slot {})",
            request,
            request.download_slot().unwrap_or("-")
        );

        let context = || {
            ErrorContext::new()
                .with_url(request.url.as_str())
                .with_component("HttpDownloadHandler")
        };

        let response = self
            .build_reqwest_request(&request)
            .send()
            .await
            .map_err(|e| Error::transport(format!("HTTP request failed: {}", e), context()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| {
                Error::transport(
                    format!("Failed to read response body: {}", e),
                    context().with_status_code(status),
                )
            })?
            .to_vec();

        Ok(Response::new(request.url, status, headers, body))
    }
}
