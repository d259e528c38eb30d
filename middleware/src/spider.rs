use std::sync::Arc;

use arachne_core::async_trait;
use arachne_core::error::{Error, ErrorContext, Result};
use arachne_core::request::{meta, Request};
use arachne_core::response::Response;
use arachne_core::spider::{CrawlResult, Spider};
use arachne_core::stats::Stats;
use log::{debug, info};
use regex::Regex;

use crate::chain::{Direction, MiddlewareChain, PhaseList, Stage};

/// Hook run on each response before it reaches the spider
#[async_trait]
pub trait SpiderInputProcessor: Send + Sync {
    /// Return an error to divert the response to the error phase
    async fn process_spider_input(&self, response: &Response, spider: &dyn Spider) -> Result<()>;
}

/// Hook run on each parse result
#[async_trait]
pub trait SpiderOutputProcessor: Send + Sync {
    /// Filter, transform or augment the requests and items of a result
    async fn process_spider_output(
        &self,
        result: CrawlResult,
        response: Option<&Response>,
        spider: &dyn Spider,
    ) -> Result<CrawlResult>;
}

/// Hook run when parsing (or an input processor) fails
#[async_trait]
pub trait SpiderErrorProcessor: Send + Sync {
    /// `None` leaves the error to the next stage. `Some` stops the phase with
    /// either a recovered result or a replacement error.
    async fn process_spider_error(
        &self,
        error: &Error,
        response: Option<&Response>,
        spider: &dyn Spider,
    ) -> Option<Result<CrawlResult>>;
}

/// Hook run once on the spider's seed requests
#[async_trait]
pub trait StartRequestsProcessor: Send + Sync {
    async fn process_start_requests(
        &self,
        requests: Vec<Request>,
        spider: &dyn Spider,
    ) -> Result<Vec<Request>>;
}

/// A stage of the scrape chain, exposing the phases it takes part in
pub trait SpiderMiddleware: Stage {
    fn input_processor(self: Arc<Self>) -> Option<Arc<dyn SpiderInputProcessor>> {
        None
    }

    fn output_processor(self: Arc<Self>) -> Option<Arc<dyn SpiderOutputProcessor>> {
        None
    }

    fn error_processor(self: Arc<Self>) -> Option<Arc<dyn SpiderErrorProcessor>> {
        None
    }

    fn start_requests_processor(self: Arc<Self>) -> Option<Arc<dyn StartRequestsProcessor>> {
        None
    }
}

/// Runs spider middlewares around the request callback or the spider's parse method
pub struct SpiderMiddlewareManager {
    chain: MiddlewareChain<dyn SpiderMiddleware>,
    input_processors: PhaseList<dyn SpiderInputProcessor>,
    output_processors: PhaseList<dyn SpiderOutputProcessor>,
    error_processors: PhaseList<dyn SpiderErrorProcessor>,
    start_requests_processors: PhaseList<dyn StartRequestsProcessor>,
}

impl SpiderMiddlewareManager {
    pub fn new() -> Self {
        Self {
            chain: MiddlewareChain::new(),
            input_processors: PhaseList::new(Direction::Forward),
            output_processors: PhaseList::new(Direction::Reverse),
            error_processors: PhaseList::new(Direction::Reverse),
            start_requests_processors: PhaseList::new(Direction::Reverse),
        }
    }

    /// Register a middleware into every phase it takes part in
    pub fn register<M: SpiderMiddleware>(&mut self, middleware: M) {
        self.register_arc(Arc::new(middleware));
    }

    /// Register a shared middleware into every phase it takes part in
    pub fn register_arc(&mut self, middleware: Arc<dyn SpiderMiddleware>) {
        if let Some(p) = middleware.clone().input_processor() {
            self.input_processors.insert(p);
        }
        if let Some(p) = middleware.clone().output_processor() {
            self.output_processors.insert(p);
        }
        if let Some(p) = middleware.clone().error_processor() {
            self.error_processors.insert(p);
        }
        if let Some(p) = middleware.clone().start_requests_processor() {
            self.start_requests_processors.insert(p);
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

    /// Scrape a fetched response.
    ///
    /// Input processors run first. The request callback, or the spider's
    /// parse method when there is none, then produces a result. Failures go
    /// through the error phase and successful results through the output phase.
    pub async fn scrape_response(
        &self,
        request: &Request,
        response: Response,
        spider: &dyn Spider,
    ) -> Result<CrawlResult> {
        let mut input_error = None;
        for processor in self.input_processors.iter() {
            if let Err(e) = processor.process_spider_input(&response, spider).await {
                input_error = Some(e);
                break;
            }
        }

        let parsed = match (input_error, &request.callback) {
            (None, Some(callback)) => callback.call(Ok(response.clone())).await,
            (None, None) => spider.parse(response.clone()).await,
            (Some(e), Some(callback)) => callback.call(Err(e)).await,
            (Some(e), None) => Err(e),
        };

        self.finish(parsed, Some(&response), spider).await
    }

    /// Route a fetch error through the error phase, for requests without a callback
    pub async fn scrape_error(&self, error: Error, spider: &dyn Spider) -> Result<CrawlResult> {
        self.finish(Err(error), None, spider).await
    }

    async fn finish(
        &self,
        parsed: Result<CrawlResult>,
        response: Option<&Response>,
        spider: &dyn Spider,
    ) -> Result<CrawlResult> {
        let mut result = match parsed {
            Ok(result) => result,
            Err(error) => self.process_error(error, response, spider).await?,
        };

        for processor in self.output_processors.iter() {
            result = processor
                .process_spider_output(result, response, spider)
                .await?;
        }
        Ok(result)
    }

    async fn process_error(
        &self,
        error: Error,
        response: Option<&Response>,
        spider: &dyn Spider,
    ) -> Result<CrawlResult> {
        for processor in self.error_processors.iter() {
            if let Some(outcome) = processor
                .process_spider_error(&error, response, spider)
                .await
            {
                return outcome;
            }
        }
        Err(error)
    }

    /// Run the seed requests through the start-requests phase
    pub async fn process_start_requests(
        &self,
        requests: Vec<Request>,
        spider: &dyn Spider,
    ) -> Result<Vec<Request>> {
        let mut requests = requests;
        for processor in self.start_requests_processors.iter() {
            requests = processor.process_start_requests(requests, spider).await?;
        }
        Ok(requests)
    }
}

impl Default for SpiderMiddlewareManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops follow-up requests to hosts outside the spider's allowed domains
pub struct OffsiteMiddleware {
    stats: Option<Arc<Stats>>,
}

impl OffsiteMiddleware {
    pub fn new() -> Self {
        Self { stats: None }
    }

    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn is_allowed(request: &Request, allowed_domains: &[String]) -> bool {
        if allowed_domains.is_empty() {
            return true;
        }
        let host = match request.url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return false,
        };
        allowed_domains.iter().any(|domain| {
            let domain = domain.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        })
    }
}

impl Default for OffsiteMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for OffsiteMiddleware {
    fn name(&self) -> &str {
        "OffsiteMiddleware"
    }
}

impl SpiderMiddleware for OffsiteMiddleware {
    fn output_processor(self: Arc<Self>) -> Option<Arc<dyn SpiderOutputProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl SpiderOutputProcessor for OffsiteMiddleware {
    async fn process_spider_output(
        &self,
        mut result: CrawlResult,
        _response: Option<&Response>,
        spider: &dyn Spider,
    ) -> Result<CrawlResult> {
        let allowed_domains = spider.allowed_domains();
        result.requests.retain(|request| {
            // requests that opt out of filtering are never offsite
            if request.dont_filter || Self::is_allowed(request, &allowed_domains) {
                return true;
            }
            debug!("Filtered offsite request to {}", request.url);
            if let Some(stats) = &self.stats {
                stats.inc("offsite/filtered");
            }
            false
        });
        Ok(result)
    }
}

/// Tracks link depth in request meta and drops requests beyond `max_depth`
pub struct DepthMiddleware {
    max_depth: u64,
    stats: Option<Arc<Stats>>,
}

impl DepthMiddleware {
    /// `max_depth` of zero means unlimited
    pub fn new(max_depth: u64) -> Self {
        Self {
            max_depth,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }
}

impl Stage for DepthMiddleware {
    fn name(&self) -> &str {
        "DepthMiddleware"
    }
}

impl SpiderMiddleware for DepthMiddleware {
    fn output_processor(self: Arc<Self>) -> Option<Arc<dyn SpiderOutputProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl SpiderOutputProcessor for DepthMiddleware {
    async fn process_spider_output(
        &self,
        mut result: CrawlResult,
        response: Option<&Response>,
        _spider: &dyn Spider,
    ) -> Result<CrawlResult> {
        let parent_depth = response
            .and_then(|r| r.request.as_ref())
            .map(|r| r.depth())
            .unwrap_or(0);
        let depth = parent_depth + 1;

        if self.max_depth > 0 && depth > self.max_depth {
            for request in &result.requests {
                debug!("Ignoring link (depth > {}): {}", self.max_depth, request.url);
            }
            result.requests.clear();
            return Ok(result);
        }

        for request in result.requests.iter_mut() {
            request.meta.insert(meta::DEPTH.to_string(), depth.into());
        }
        if let Some(stats) = &self.stats {
            if !result.requests.is_empty() {
                stats.max("request_depth_max", depth);
            }
        }
        Ok(result)
    }
}

/// Keeps follow-up requests whose URL matches an allow pattern and no deny pattern
pub struct UrlFilterMiddleware {
    allowed_patterns: Vec<Regex>,
    denied_patterns: Vec<Regex>,
}

impl UrlFilterMiddleware {
    /// Create a new UrlFilterMiddleware with the given patterns
    pub fn new(allowed_patterns: Vec<Regex>, denied_patterns: Vec<Regex>) -> Self {
        Self {
            allowed_patterns,
            denied_patterns,
        }
    }

    /// Create a new UrlFilterMiddleware from string patterns
    pub fn from_strings(allowed_patterns: &[&str], denied_patterns: &[&str]) -> Result<Self> {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| Error::middleware(format!("Invalid regex: {}", e)))
                })
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self::new(compile(allowed_patterns)?, compile(denied_patterns)?))
    }

    fn accepts(&self, url: &str) -> bool {
        if self.denied_patterns.iter().any(|p| p.is_match(url)) {
            return false;
        }
        self.allowed_patterns.is_empty() || self.allowed_patterns.iter().any(|p| p.is_match(url))
    }
}

impl Stage for UrlFilterMiddleware {
    fn name(&self) -> &str {
        "UrlFilterMiddleware"
    }
}

impl SpiderMiddleware for UrlFilterMiddleware {
    fn output_processor(self: Arc<Self>) -> Option<Arc<dyn SpiderOutputProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl SpiderOutputProcessor for UrlFilterMiddleware {
    async fn process_spider_output(
        &self,
        mut result: CrawlResult,
        _response: Option<&Response>,
        _spider: &dyn Spider,
    ) -> Result<CrawlResult> {
        result.requests.retain(|request| {
            let accepted = self.accepts(request.url.as_str());
            if !accepted {
                debug!("Filtered request by URL pattern: {}", request.url);
            }
            accepted
        });
        Ok(result)
    }
}

/// Rejects unsuccessful responses before parsing and swallows the resulting errors
pub struct HttpErrorMiddleware {
    allowed_statuses: Vec<u16>,
}

impl HttpErrorMiddleware {
    pub fn new() -> Self {
        Self {
            allowed_statuses: Vec::new(),
        }
    }

    /// Let responses with this status reach the spider
    pub fn allow_status(mut self, status: u16) -> Self {
        self.allowed_statuses.push(status);
        self
    }
}

impl Default for HttpErrorMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for HttpErrorMiddleware {
    fn name(&self) -> &str {
        "HttpErrorMiddleware"
    }
}

impl SpiderMiddleware for HttpErrorMiddleware {
    fn input_processor(self: Arc<Self>) -> Option<Arc<dyn SpiderInputProcessor>> {
        Some(self)
    }

    fn error_processor(self: Arc<Self>) -> Option<Arc<dyn SpiderErrorProcessor>> {
        Some(self)
    }
}

#[async_trait]
impl SpiderInputProcessor for HttpErrorMiddleware {
    async fn process_spider_input(&self, response: &Response, _spider: &dyn Spider) -> Result<()> {
        if response.is_success() || self.allowed_statuses.contains(&response.status) {
            return Ok(());
        }
        Err(Error::http(
            response.status,
            ErrorContext::new()
                .with_url(response.url.as_str())
                .with_status_code(response.status)
                .with_component("HttpErrorMiddleware"),
        ))
    }
}

#[async_trait]
impl SpiderErrorProcessor for HttpErrorMiddleware {
    async fn process_spider_error(
        &self,
        error: &Error,
        response: Option<&Response>,
        _spider: &dyn Spider,
    ) -> Option<Result<CrawlResult>> {
        match (error, response) {
            (Error::Http { status, .. }, Some(response)) if *status == response.status => {
                info!(
                    "Ignoring response {}: HTTP status code is not handled or not allowed",
                    response.url
                );
                Some(Ok(CrawlResult::new()))
            }
            _ => None,
        }
    }
}
