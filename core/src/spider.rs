use std::time::Duration;

use crate::async_trait;
use crate::error::Result;
use crate::item::Item;
use crate::request::Request;
use crate::response::Response;

/// The extraction policy driving a crawl
#[async_trait]
pub trait Spider: Send + Sync + 'static {
    /// Get the name of the spider
    fn name(&self) -> &str;

    /// Get the allowed domains for this spider
    fn allowed_domains(&self) -> Vec<String> {
        Vec::new()
    }

    /// Get the start URLs for this spider
    fn start_urls(&self) -> Vec<String> {
        Vec::new()
    }

    /// Seed requests. Defaults to a GET for each start URL.
    fn start_requests(&self) -> Vec<Result<Request>> {
        self.start_urls().into_iter().map(Request::get).collect()
    }

    /// Process a response and return items and/or follow-up requests
    async fn parse(&self, response: Response) -> Result<CrawlResult>;

    /// Fetch delay overriding the engine default for every slot
    fn download_delay(&self) -> Option<Duration> {
        None
    }

    /// Per-slot concurrency overriding the engine default
    fn concurrent_requests(&self) -> Option<usize> {
        None
    }

    /// Called when the spider is closed
    async fn closed(&self) -> Result<()> {
        Ok(())
    }
}

/// Output of parsing a response: follow-up requests and extracted items, both ordered
#[derive(Debug, Default)]
pub struct CrawlResult {
    /// Requests to follow
    pub requests: Vec<Request>,

    /// Items extracted from the response
    pub items: Vec<Item>,
}

impl CrawlResult {
    /// Create a new empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request to the result
    pub fn add_request(&mut self, request: Request) -> &mut Self {
        self.requests.push(request);
        self
    }

    /// Add an item to the result
    pub fn add_item(&mut self, item: Item) -> &mut Self {
        self.items.push(item);
        self
    }

    /// Create a result with a single item
    pub fn item(item: Item) -> Self {
        let mut result = Self::new();
        result.add_item(item);
        result
    }

    /// Create a result with a single request
    pub fn request(request: Request) -> Self {
        let mut result = Self::new();
        result.add_request(request);
        result
    }

    /// True when there is nothing to schedule and nothing to pipeline
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.items.is_empty()
    }
}

/// A spider built from a name and a list of start URLs that extracts nothing
pub struct BasicSpider {
    name: String,
    allowed_domains: Vec<String>,
    start_urls: Vec<String>,
    download_delay: Option<Duration>,
}

impl BasicSpider {
    /// Create a new basic spider
    pub fn new<S: Into<String>>(name: S, start_urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            allowed_domains: Vec::new(),
            start_urls,
            download_delay: None,
        }
    }

    /// Set the allowed domains for this spider
    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = domains;
        self
    }

    /// Set the fetch delay for this spider
    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }
}

#[async_trait]
impl Spider for BasicSpider {
    fn name(&self) -> &str {
        &self.name
    }

    fn allowed_domains(&self) -> Vec<String> {
        self.allowed_domains.clone()
    }

    fn start_urls(&self) -> Vec<String> {
        self.start_urls.clone()
    }

    async fn parse(&self, _response: Response) -> Result<CrawlResult> {
        Ok(CrawlResult::new())
    }

    fn download_delay(&self) -> Option<Duration> {
        self.download_delay
    }
}
