use std::sync::Arc;
use std::time::Duration;

use arachne_core::async_trait;
use arachne_core::error::Result;
use arachne_core::item::Item;
use arachne_core::request::Request;
use arachne_core::response::Response;
use arachne_core::spider::{CrawlResult, Spider};
use arachne_engine::{Engine, EngineConfig, EngineState, SchedulerType};
use tokio_test::assert_ok;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Follows every `href="..."` on a page and records its status
struct LinkSpider {
    start: String,
}

#[async_trait]
impl Spider for LinkSpider {
    fn name(&self) -> &str {
        "links"
    }

    fn start_urls(&self) -> Vec<String> {
        vec![self.start.clone()]
    }

    async fn parse(&self, response: Response) -> Result<CrawlResult> {
        let mut result = CrawlResult::new();
        result.add_item(
            Item::new()
                .with("url", response.url.as_str())
                .with("status", response.status),
        );

        let body = response.text()?;
        for part in body.split("href=\"").skip(1) {
            if let Some(end) = part.find('"') {
                let link = response.urljoin(&part[..end])?;
                result.add_request(Request::get(link)?);
            }
        }
        Ok(result)
    }
}

fn quick_config() -> EngineConfig {
    EngineConfig::default()
        .with_idle_poll_interval(Duration::from_millis(10))
        .with_idle_timeout(Duration::from_millis(200))
        .with_log_stats_interval(None)
}

async fn site() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"<a href="/one">one</a> <a href="/two">two</a>"#),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/one"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a href="/">home</a>"#))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/two"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_crawl_over_http() {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = site().await;

    let spider = Arc::new(LinkSpider {
        start: format!("{}/", server.uri()),
    });
    let engine = Engine::new(spider, quick_config()).unwrap();
    let summary = assert_ok!(engine.run().await);

    assert_eq!(engine.state().await, EngineState::Idle);
    assert_eq!(summary.request_count, 3);
    assert_eq!(summary.response_count, 3);
    // the 404 page is ignored by the HTTP error stage, not parsed
    assert_eq!(summary.item_count, 2);
    assert_eq!(summary.error_count, 0);
    assert_eq!(engine.stats().get("dupefilter/filtered"), 1);
}

#[tokio::test]
async fn test_persisted_fingerprints_skip_seen_pages() {
    let dir = tempfile::tempdir().unwrap();
    let fingerprints = dir.path().join("requests.seen");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("no links"))
        .expect(1)
        .mount(&server)
        .await;

    let config = quick_config()
        .with_dupefilter_path(&fingerprints)
        .with_scheduler_type(SchedulerType::Priority);

    let first = Engine::new(
        Arc::new(LinkSpider {
            start: format!("{}/", server.uri()),
        }),
        config.clone(),
    )
    .unwrap();
    let summary = assert_ok!(first.run().await);
    assert_eq!(summary.request_count, 1);

    let second = Engine::new(
        Arc::new(LinkSpider {
            start: format!("{}/", server.uri()),
        }),
        config,
    )
    .unwrap();
    let summary = assert_ok!(second.run().await);
    assert_eq!(summary.request_count, 0);
    assert_eq!(second.stats().get("dupefilter/filtered"), 1);
}
