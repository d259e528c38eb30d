use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arachne_core::async_trait;
use arachne_core::error::{Error, Result};
use arachne_core::request::{meta, Method, Request};
use arachne_core::response::Response;
use arachne_core::spider::Spider;
use arachne_core::stats::Stats;
use log::{debug, warn};

use crate::chain::{Direction, MiddlewareChain, PhaseList, Stage};

/// Decisive result of a fetch: a response, or a request to schedule instead
#[derive(Debug)]
pub enum FetchOutcome {
    /// A response to hand to the spider
    Response(Response),
    /// A replacement request to schedule (redirect, retry)
    Request(Request),
}

/// Request-side hook of a fetch middleware
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Inspect or modify a request before it is fetched.
    ///
    /// `Ok(None)` lets the request continue down the chain. Returning an
    /// outcome or an error stops the chain and skips the actual fetch.
    async fn process_request(
        &self,
        request: &mut Request,
        spider: &dyn Spider,
    ) -> Result<Option<FetchOutcome>>;
}

/// Response-side hook of a fetch middleware
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    /// Pass the response on (possibly changed), replace it with a request,
    /// or fail. Only a request or an error stops the chain.
    async fn process_response(
        &self,
        response: Response,
        request: &Request,
        spider: &dyn Spider,
    ) -> Result<FetchOutcome>;
}

/// Error-side hook of a fetch middleware
#[async_trait]
pub trait ErrorProcessor: Send + Sync {
    /// Try to recover from a failed fetch. `None` leaves the error to the next stage.
    async fn process_error(
        &self,
        error: &Error,
        request: &Request,
        spider: &dyn Spider,
    ) -> Option<FetchOutcome>;
}

/// A stage of the fetch chain. Each capability it implements is exposed
/// through the matching accessor so the manager can register it per phase.
pub trait FetchMiddleware: Stage {
    fn request_processor(self: Arc<Self>) -> Option<Arc<dyn RequestProcessor>> {
        None
    }

    fn response_processor(self: Arc<Self>) -> Option<Arc<dyn ResponseProcessor>> {
        None
    }

    fn error_processor(self: Arc<Self>) -> Option<Arc<dyn ErrorProcessor>> {
        None
    }
}

/// Runs fetch middlewares around the actual transfer
pub struct FetchMiddlewareManager {
    chain: MiddlewareChain<dyn FetchMiddleware>,
    request_processors: PhaseList<dyn RequestProcessor>,
    response_processors: PhaseList<dyn ResponseProcessor>,
    error_processors: PhaseList<dyn ErrorProcessor>,
}

impl FetchMiddlewareManager {
    pub fn new() -> Self {
        Self {
            chain: MiddlewareChain::new(),
            request_processors: PhaseList::new(Direction::Forward),
            response_processors: PhaseList::new(Direction::Reverse),
            error_processors: PhaseList::new(Direction::Reverse),
        }
    }

    /// Register a middleware into every phase it takes part in
    pub fn register<M: FetchMiddleware>(&mut self, middleware: M) {
        self.register_arc(Arc::new(middleware));
    }

    /// Register a shared middleware into every phase it takes part in
    pub fn register_arc(&mut self, middleware: Arc<dyn FetchMiddleware>) {
        if let Some(p) = middleware.clone().request_processor() {
            self.request_processors.insert(p);
        }
        if let Some(p) = middleware.clone().response_processor() {
            self.response_processors.insert(p);
        }
        if let Some(p) = middleware.clone().error_processor() {
            self.error_processors.insert(p);
        }
        self.chain.register(middleware);
    }

    /// Names of the registered middlewares in registration order
    pub fn names(&self) -> Vec<String> {
        self.chain.names()
    }

    pub async fn open_spider(&self, spider: &dyn Spider) -> Result<()> {
        self.chain.open_spider(spider).await
    }

    pub async fn close_spider(&self, spider: &dyn Spider) -> Result<()> {
        self.chain.close_spider(spider).await
    }

    /// Drive `request` through the chain, calling `fetch` when no request
    /// processor decides the outcome.
    ///
    /// Errors not recovered by an error processor are returned to the caller,
    /// as are errors raised by response processors.
    pub async fn process<F, Fut>(
        &self,
        mut request: Request,
        spider: &dyn Spider,
        fetch: F,
    ) -> Result<FetchOutcome>
    where
        F: FnOnce(Request) -> Fut + Send,
        Fut: Future<Output = Result<Response>> + Send,
    {
        let mut decided = None;
        for processor in self.request_processors.iter() {
            match processor.process_request(&mut request, spider).await {
                Ok(None) => continue,
                Ok(Some(outcome)) => {
                    decided = Some(Ok(outcome));
                    break;
                }
                Err(e) => {
                    decided = Some(Err(e));
                    break;
                }
            }
        }

        let result = match decided {
            Some(result) => result,
            None => fetch(request.clone()).await.map(FetchOutcome::Response),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => self.process_error(error, &request, spider).await?,
        };

        let mut response = match outcome {
            FetchOutcome::Response(response) => response,
            FetchOutcome::Request(replacement) => return Ok(FetchOutcome::Request(replacement)),
        };

        for processor in self.response_processors.iter() {
            match processor.process_response(response, &request, spider).await? {
                FetchOutcome::Response(next) => response = next,
                FetchOutcome::Request(replacement) => {
                    return Ok(FetchOutcome::Request(replacement))
                }
            }
        }

        Ok(FetchOutcome::Response(response))
    }

    async fn process_error(
        &self,
        error: Error,
        request: &Request,
        spider: &dyn Spider,
    ) -> Result<FetchOutcome> {
        for processor in self.error_processors.iter() {
            if let Some(outcome) = processor.process_error(&error, request, spider).await {
                return Ok(outcome);
            }
        }
        Err(error)
    }
}

impl Default for FetchMiddlewareManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A middleware that adds default headers to requests that lack them
pub struct DefaultHeadersMiddleware {
    headers: HashMap<String, String>,
}

impl DefaultHeadersMiddleware {
    /// Create a new DefaultHeadersMiddleware with the given headers
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self { headers }
    }

    /// Create a new DefaultHeadersMiddleware with common headers
    pub fn common() -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        );
        headers.insert("Accept-Language".to_string(), "en".to_string());
        Self::new(headers)
    }

    /// Add a header to the middleware
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

impl Stage for DefaultHeadersMiddleware {
    fn name(&self) -> &str {
        "DefaultHeadersMiddleware"
    }
}

impl FetchMiddleware for DefaultHeadersMiddleware {
    fn request_processor(self: Arc<Self>) -> Option<Arc<dyn RequestProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl RequestProcessor for DefaultHeadersMiddleware {
    async fn process_request(
        &self,
        request: &mut Request,
        _spider: &dyn Spider,
    ) -> Result<Option<FetchOutcome>> {
        for (key, value) in &self.headers {
            if request.header(key).is_none() {
                request.headers.insert(key.clone(), value.clone());
            }
        }
        Ok(None)
    }
}

/// A middleware that re-issues requests that failed with a retryable
/// status or transport error
pub struct RetryMiddleware {
    retry_status_codes: Vec<u16>,
    max_retries: u32,
    priority_adjust: i32,
    stats: Option<Arc<Stats>>,
}

impl RetryMiddleware {
    /// Create a new RetryMiddleware with the given parameters
    pub fn new(retry_status_codes: Vec<u16>, max_retries: u32) -> Self {
        Self {
            retry_status_codes,
            max_retries,
            priority_adjust: -1,
            stats: None,
        }
    }

    /// Create a new RetryMiddleware with common settings
    pub fn common() -> Self {
        Self::new(vec![500, 502, 503, 504, 522, 524, 408, 429], 2)
    }

    /// Record retries in the given stats
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Priority change applied to retried requests
    pub fn with_priority_adjust(mut self, adjust: i32) -> Self {
        self.priority_adjust = adjust;
        self
    }

    fn retry(&self, request: &Request, reason: &str) -> Option<Request> {
        let retries = request.meta_u32(meta::RETRY_TIMES) + 1;
        if retries > self.max_retries {
            warn!(
                "Gave up retrying {} (failed {} times): {}",
                request, retries, reason
            );
            if let Some(stats) = &self.stats {
                stats.inc("retry/max_reached");
            }
            return None;
        }

        debug!(
            "Retrying {} (failed {} times): {}",
            request, retries, reason
        );
        let mut retry = request.clone();
        retry
            .meta
            .insert(meta::RETRY_TIMES.to_string(), retries.into());
        retry.dont_filter = true;
        retry.priority += self.priority_adjust;
        if let Some(stats) = &self.stats {
            stats.inc("retry/count");
        }
        Some(retry)
    }
}

impl Stage for RetryMiddleware {
    fn name(&self) -> &str {
        "RetryMiddleware"
    }
}

impl FetchMiddleware for RetryMiddleware {
    fn response_processor(self: Arc<Self>) -> Option<Arc<dyn ResponseProcessor>> {
        Some(self)
    }

    fn error_processor(self: Arc<Self>) -> Option<Arc<dyn ErrorProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl ResponseProcessor for RetryMiddleware {
    async fn process_response(
        &self,
        response: Response,
        request: &Request,
        _spider: &dyn Spider,
    ) -> Result<FetchOutcome> {
        if !self.retry_status_codes.contains(&response.status) {
            return Ok(FetchOutcome::Response(response));
        }

        let reason = format!("status {}", response.status);
        match self.retry(request, &reason) {
            Some(retry) => Ok(FetchOutcome::Request(retry)),
            None => Ok(FetchOutcome::Response(response)),
        }
    }
}

#[async_trait]
impl ErrorProcessor for RetryMiddleware {
    async fn process_error(
        &self,
        error: &Error,
        request: &Request,
        _spider: &dyn Spider,
    ) -> Option<FetchOutcome> {
        if !error.is_retryable() {
            return None;
        }
        self.retry(request, &error.to_string())
            .map(FetchOutcome::Request)
    }
}

/// A middleware that turns redirect responses into replacement requests.
///
/// The replacement keeps the original meta, so it stays in the same fetch slot.
pub struct RedirectMiddleware {
    max_redirects: u32,
    priority_adjust: i32,
    stats: Option<Arc<Stats>>,
}

impl RedirectMiddleware {
    /// Create a new RedirectMiddleware following at most `max_redirects` hops
    pub fn new(max_redirects: u32) -> Self {
        Self {
            max_redirects,
            priority_adjust: 2,
            stats: None,
        }
    }

    /// Record redirects in the given stats
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn redirected(&self, request: &Request, status: u16, location: &url::Url) -> Result<Request> {
        let switch_to_get = (status == 303 && request.method != Method::HEAD)
            || (matches!(status, 301 | 302) && request.method == Method::POST);
        let method = if switch_to_get {
            Method::GET
        } else {
            request.method
        };

        let mut redirected = Request::new(method, location.as_str())?;
        redirected.headers = request.headers.clone();
        if switch_to_get {
            redirected
                .headers
                .retain(|k, _| !k.eq_ignore_ascii_case("content-type") && !k.eq_ignore_ascii_case("content-length"));
        } else {
            redirected.body = request.body.clone();
        }
        redirected.meta = request.meta.clone();
        redirected.priority = request.priority + self.priority_adjust;
        redirected.callback = request.callback.clone();
        redirected.dont_filter = request.dont_filter;
        Ok(redirected)
    }
}

impl Default for RedirectMiddleware {
    fn default() -> Self {
        Self::new(20)
    }
}

impl Stage for RedirectMiddleware {
    fn name(&self) -> &str {
        "RedirectMiddleware"
    }
}

impl FetchMiddleware for RedirectMiddleware {
    fn response_processor(self: Arc<Self>) -> Option<Arc<dyn ResponseProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl ResponseProcessor for RedirectMiddleware {
    async fn process_response(
        &self,
        response: Response,
        request: &Request,
        _spider: &dyn Spider,
    ) -> Result<FetchOutcome> {
        let location = match response.redirect_url() {
            Some(Ok(location)) => location,
            Some(Err(e)) => {
                warn!("Invalid redirect location from {}: {}", request, e);
                return Ok(FetchOutcome::Response(response));
            }
            None => return Ok(FetchOutcome::Response(response)),
        };

        let redirects = request.meta_u32(meta::REDIRECT_TIMES) + 1;
        if redirects > self.max_redirects {
            warn!("Discarding {}: max redirections reached", request);
            return Err(Error::IgnoreRequest);
        }

        let mut redirected = self.redirected(request, response.status, &location)?;
        redirected
            .meta
            .insert(meta::REDIRECT_TIMES.to_string(), redirects.into());
        if let Some(stats) = &self.stats {
            stats.inc("redirect/count");
        }
        debug!(
            "Redirecting ({}) to {} from {}",
            response.status, redirected, request
        );
        Ok(FetchOutcome::Request(redirected))
    }
}
