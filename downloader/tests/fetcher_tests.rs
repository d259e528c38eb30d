use std::sync::Arc;

use arachne_core::request::{meta, Request};
use arachne_core::spider::{BasicSpider, Spider};
use arachne_core::stats::Stats;
use arachne_downloader::{Fetcher, FetcherConfig, HttpDownloadHandler, HttpHandlerConfig};
use arachne_middleware::{
    DefaultHeadersMiddleware, FetchMiddlewareManager, FetchOutcome, RedirectMiddleware,
};
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn http_fetcher(middlewares: FetchMiddlewareManager, stats: Arc<Stats>) -> Fetcher {
    let handler = Arc::new(HttpDownloadHandler::new(HttpHandlerConfig::default()).unwrap());
    Fetcher::new(FetcherConfig::default())
        .with_handler("http", handler.clone())
        .with_handler("https", handler)
        .with_middlewares(middlewares)
        .with_stats(stats)
}

#[tokio::test]
async fn test_fetch_over_http_with_default_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .and(header("accept-language", "en"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(1)
        .mount(&server)
        .await;

    let stats = Arc::new(Stats::new());
    let mut middlewares = FetchMiddlewareManager::new();
    middlewares.register(DefaultHeadersMiddleware::common());
    let fetcher = http_fetcher(middlewares, stats.clone());
    let spider: Arc<dyn Spider> = Arc::new(BasicSpider::new("http", vec![]));
    assert_ok!(fetcher.open(spider.as_ref()).await);

    let request = Request::get(format!("{}/page", server.uri())).unwrap();
    let outcome = assert_ok!(fetcher.fetch(request, spider.clone()).await);
    match outcome {
        FetchOutcome::Response(response) => {
            assert_eq!(response.status, 200);
            assert_eq!(response.text().unwrap(), "hello");
        }
        FetchOutcome::Request(request) => panic!("unexpected replacement {}", request),
    }

    assert_eq!(stats.get("fetcher/request_count"), 1);
    assert_eq!(stats.get("fetcher/response_count"), 1);
    assert_ok!(fetcher.close(spider.as_ref()).await);
}

#[tokio::test]
async fn test_redirect_becomes_replacement_request_in_same_slot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
        .mount(&server)
        .await;

    let stats = Arc::new(Stats::new());
    let mut middlewares = FetchMiddlewareManager::new();
    middlewares.register(RedirectMiddleware::default().with_stats(stats.clone()));
    let fetcher = http_fetcher(middlewares, stats.clone());
    let spider: Arc<dyn Spider> = Arc::new(BasicSpider::new("http", vec![]));

    let request = Request::get(format!("{}/old", server.uri())).unwrap();
    let outcome = assert_ok!(fetcher.fetch(request, spider.clone()).await);
    let replacement = match outcome {
        FetchOutcome::Request(request) => request,
        FetchOutcome::Response(response) => panic!("unexpected response {}", response.status),
    };

    assert_eq!(replacement.url.path(), "/new");
    assert_eq!(replacement.meta_u32(meta::REDIRECT_TIMES), 1);
    assert_eq!(replacement.download_slot(), Some("127.0.0.1"));
    assert_eq!(stats.get("redirect/count"), 1);
    assert_ok!(fetcher.close(spider.as_ref()).await);
}

#[tokio::test]
async fn test_refused_connection_surfaces_as_error() {
    let stats = Arc::new(Stats::new());
    let fetcher = http_fetcher(FetchMiddlewareManager::new(), stats.clone());
    let spider: Arc<dyn Spider> = Arc::new(BasicSpider::new("http", vec![]));

    let request = Request::get("http://127.0.0.1:9/").unwrap();
    let error = assert_err!(fetcher.fetch(request, spider.clone()).await);
    assert_eq!(error.kind(), "Transport");
    assert_eq!(stats.get("fetcher/exception_count"), 1);
    assert_eq!(fetcher.active(), 0);
    assert_ok!(fetcher.close(spider.as_ref()).await);
}
