use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arachne_core::async_trait;
use arachne_core::error::{Error, Result};
use arachne_core::item::Item;
use arachne_core::request::Request;
use arachne_core::response::Response;
use arachne_core::signal::Signal;
use arachne_core::spider::{CrawlResult, Spider};
use arachne_downloader::mock::{FailingHandler, MockHandler};
use arachne_middleware::RedirectMiddleware;
use arachne_pipeline::FieldFilterPipeline;

use super::{components_with, test_config, EventLog};
use crate::Engine;

/// Follows `/c` and a reordered copy of its own URL from `/a`, and emits
/// one item per page
struct ReorderSpider;

#[async_trait]
impl Spider for ReorderSpider {
    fn name(&self) -> &str {
        "reorder"
    }

    fn start_urls(&self) -> Vec<String> {
        vec!["https://example.com/a?b=2&a=1".to_string()]
    }

    async fn parse(&self, response: Response) -> Result<CrawlResult> {
        let mut result = CrawlResult::new();
        if response.url.path() == "/a" {
            result.add_request(Request::get(response.urljoin("/c")?)?);
            result.add_request(Request::get(response.urljoin("/a?a=1&b=2")?)?);
            result.add_item(Item::new().with("url", response.url.as_str()));
        }
        Ok(result)
    }
}

#[tokio::test]
async fn test_duplicate_follow_up_is_dropped_and_item_scraped() {
    let handler = Arc::new(MockHandler::new());
    let config = test_config();
    let components = components_with(handler.clone(), &config);
    let events = EventLog::default();
    events
        .attach(
            &components.signals,
            &[
                Signal::RequestScheduled,
                Signal::RequestDropped,
                Signal::ItemScraped,
                Signal::ResponseReceived,
                Signal::SpiderOpened,
                Signal::SpiderClosed,
            ],
        )
        .await;

    let engine = Engine::with_components(Arc::new(ReorderSpider), components, config);
    let summary = engine.run().await.unwrap();

    let fetched: Vec<String> = handler.calls().into_iter().map(|c| c.url).collect();
    assert_eq!(
        fetched,
        vec![
            "https://example.com/a?b=2&a=1".to_string(),
            "https://example.com/c".to_string()
        ]
    );

    assert_eq!(
        events.details(Signal::RequestDropped),
        vec!["https://example.com/a?a=1&b=2".to_string()]
    );
    assert!(events
        .details(Signal::RequestScheduled)
        .contains(&"https://example.com/c".to_string()));
    assert_eq!(events.count(Signal::ItemScraped), 1);
    assert_eq!(events.count(Signal::ResponseReceived), 2);
    assert_eq!(events.count(Signal::SpiderOpened), 1);
    assert_eq!(events.count(Signal::SpiderClosed), 1);

    assert_eq!(summary.item_count, 1);
    assert_eq!(summary.response_count, 2);
    assert_eq!(summary.error_count, 0);
    assert_eq!(engine.stats().get("dupefilter/filtered"), 1);
}

/// Emits a single item, optionally with a title, for every response
struct ItemSpider {
    urls: Vec<String>,
    with_title: bool,
}

#[async_trait]
impl Spider for ItemSpider {
    fn name(&self) -> &str {
        "items"
    }

    fn start_urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    async fn parse(&self, response: Response) -> Result<CrawlResult> {
        let mut item = Item::new().with("url", response.url.as_str());
        if self.with_title {
            item.set("title", "Example");
        }
        Ok(CrawlResult::item(item))
    }
}

#[tokio::test]
async fn test_dropped_item_publishes_event() {
    let config = test_config();
    let mut components = components_with(Arc::new(MockHandler::new()), &config);
    components
        .pipelines
        .register(FieldFilterPipeline::new(["title"]));
    let events = EventLog::default();
    events
        .attach(
            &components.signals,
            &[Signal::ItemDropped, Signal::ItemScraped],
        )
        .await;

    let spider = ItemSpider {
        urls: vec!["https://example.com/".to_string()],
        with_title: false,
    };
    let engine = Engine::with_components(Arc::new(spider), components, config);
    let summary = engine.run().await.unwrap();

    assert_eq!(events.count(Signal::ItemDropped), 1);
    assert_eq!(events.count(Signal::ItemScraped), 0);
    assert_eq!(summary.item_dropped_count, 1);
    assert_eq!(summary.error_count, 0);
}

struct FailingParseSpider;

#[async_trait]
impl Spider for FailingParseSpider {
    fn name(&self) -> &str {
        "failing_parse"
    }

    fn start_urls(&self) -> Vec<String> {
        vec![
            "https://example.com/one".to_string(),
            "https://example.com/two".to_string(),
        ]
    }

    async fn parse(&self, _response: Response) -> Result<CrawlResult> {
        Err(Error::parse("unexpected markup"))
    }
}

#[tokio::test]
async fn test_spider_errors_are_counted_by_kind() {
    let config = test_config();
    let components = components_with(Arc::new(MockHandler::new()), &config);
    let events = EventLog::default();
    events
        .attach(&components.signals, &[Signal::SpiderError])
        .await;

    let engine = Engine::with_components(Arc::new(FailingParseSpider), components, config);
    let summary = engine.run().await.unwrap();

    // one failing request does not halt the crawl
    assert_eq!(summary.response_count, 2);
    assert_eq!(engine.stats().get("SpiderError/Parse"), 2);
    assert_eq!(summary.error_count, 2);
    assert_eq!(events.count(Signal::SpiderError), 2);
}

#[tokio::test]
async fn test_transport_error_without_callback_is_logged() {
    let config = test_config();
    let components = components_with(Arc::new(FailingHandler), &config);
    let spider = ItemSpider {
        urls: vec!["https://example.com/".to_string()],
        with_title: true,
    };

    let engine = Engine::with_components(Arc::new(spider), components, config);
    let summary = engine.run().await.unwrap();

    assert_eq!(engine.stats().get("SpiderError/Transport"), 1);
    assert_eq!(summary.item_count, 0);
}

/// Seeds a request whose callback records fetch failures
struct CallbackSpider {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Spider for CallbackSpider {
    fn name(&self) -> &str {
        "callback"
    }

    fn start_requests(&self) -> Vec<Result<Request>> {
        let seen = self.seen.clone();
        let request = Request::get("https://example.com/broken").map(|r| {
            r.with_callback(move |outcome: Result<Response>| {
                if let Err(e) = outcome {
                    seen.lock().unwrap().push(e.kind().to_string());
                }
                Ok(CrawlResult::item(Item::new().with("recovered", true)))
            })
        });
        vec![request]
    }

    async fn parse(&self, _response: Response) -> Result<CrawlResult> {
        Err(Error::other("parse must not run for requests with a callback"))
    }
}

#[tokio::test]
async fn test_callback_receives_fetch_error() {
    let config = test_config();
    let components = components_with(Arc::new(FailingHandler), &config);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let spider = CallbackSpider { seen: seen.clone() };

    let engine = Engine::with_components(Arc::new(spider), components, config);
    let summary = engine.run().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["Transport".to_string()]);
    assert_eq!(summary.error_count, 0);
    assert_eq!(summary.item_count, 1);
}

#[tokio::test]
async fn test_redirect_is_rescheduled() {
    let mut handler = MockHandler::new();
    let mut headers = HashMap::new();
    headers.insert("Location".to_string(), "/new".to_string());
    handler.add_response_with_headers("https://example.com/old", 302, headers, "");
    let handler = Arc::new(handler);

    let config = test_config();
    let mut components = components_with(handler.clone(), &config);
    components
        .fetcher
        .middlewares_mut()
        .register(RedirectMiddleware::default());
    let events = EventLog::default();
    events
        .attach(&components.signals, &[Signal::RequestScheduled])
        .await;

    let spider = ItemSpider {
        urls: vec!["https://example.com/old".to_string()],
        with_title: true,
    };
    let engine = Engine::with_components(Arc::new(spider), components, config);
    let summary = engine.run().await.unwrap();

    let fetched: Vec<String> = handler.calls().into_iter().map(|c| c.url).collect();
    assert_eq!(
        fetched,
        vec![
            "https://example.com/old".to_string(),
            "https://example.com/new".to_string()
        ]
    );
    assert_eq!(
        events.details(Signal::RequestScheduled),
        vec![
            "https://example.com/old".to_string(),
            "https://example.com/new".to_string()
        ]
    );
    assert_eq!(summary.item_count, 1);
}
