use std::sync::Arc;

use super::*;
use arachne_core::request::Request;
use arachne_core::stats::Stats;

#[tokio::test]
async fn test_fifo_scheduler_order() {
    let scheduler = FifoScheduler::new();
    scheduler.open().await.unwrap();

    for i in 1..=3 {
        let request = Request::get(format!("https://example.com/{}", i)).unwrap();
        assert!(scheduler.enqueue_request(request).await.unwrap());
    }
    assert_eq!(scheduler.len().await, 3);

    for i in 1..=3 {
        let next = scheduler.next_request().await.unwrap();
        assert_eq!(next.url.as_str(), format!("https://example.com/{}", i));
    }

    assert!(scheduler.is_empty().await);
    assert!(scheduler.next_request().await.is_none());
    scheduler.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_is_admitted_once() {
    let stats = Arc::new(Stats::new());
    let filter = Arc::new(FingerprintDupeFilter::new().with_stats(stats.clone()));
    let scheduler = FifoScheduler::with_dupefilter(filter).with_stats(stats.clone());

    let request = Request::get("https://example.com/page").unwrap();
    assert!(scheduler.enqueue_request(request.clone()).await.unwrap());
    assert_eq!(scheduler.len().await, 1);

    assert!(!scheduler.enqueue_request(request).await.unwrap());
    assert_eq!(scheduler.len().await, 1);
    assert_eq!(stats.get("dupefilter/filtered"), 1);
    assert_eq!(stats.get("scheduler/enqueued"), 1);
}

#[tokio::test]
async fn test_dont_filter_bypasses_dupefilter() {
    let scheduler = FifoScheduler::new();
    let request = Request::get("https://example.com/page").unwrap();

    assert!(scheduler.enqueue_request(request.clone()).await.unwrap());
    assert!(scheduler
        .enqueue_request(request.with_dont_filter(true))
        .await
        .unwrap());
    assert_eq!(scheduler.len().await, 2);
}

#[tokio::test]
async fn test_concurrent_enqueue_admits_once() {
    let scheduler = Arc::new(FifoScheduler::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            let request = Request::get("https://example.com/a?b=2&a=1").unwrap();
            scheduler.enqueue_request(request).await.unwrap()
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(scheduler.len().await, 1);
}

#[tokio::test]
async fn test_persisted_dupefilter_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("requests.seen");

    let scheduler = FifoScheduler::with_dupefilter(Arc::new(FingerprintDupeFilter::with_path(&path)));
    scheduler.open().await.unwrap();
    assert!(scheduler
        .enqueue_request(Request::get("https://example.com/").unwrap())
        .await
        .unwrap());
    scheduler.close().await.unwrap();

    let restarted = FifoScheduler::with_dupefilter(Arc::new(FingerprintDupeFilter::with_path(&path)));
    restarted.open().await.unwrap();
    assert!(!restarted
        .enqueue_request(Request::get("https://example.com/").unwrap())
        .await
        .unwrap());
    assert!(restarted.is_empty().await);
    restarted.close().await.unwrap();
}

#[tokio::test]
async fn test_priority_scheduler() {
    let scheduler = PriorityScheduler::new();

    let requests = [
        ("https://example.com/low", 1),
        ("https://example.com/high-1", 5),
        ("https://example.com/mid", 3),
        ("https://example.com/high-2", 5),
    ];
    for (url, priority) in requests {
        let request = Request::get(url).unwrap().with_priority(priority);
        assert!(scheduler.enqueue_request(request).await.unwrap());
    }

    // duplicates are rejected here too
    assert!(!scheduler
        .enqueue_request(Request::get("https://example.com/mid").unwrap())
        .await
        .unwrap());
    assert_eq!(scheduler.len().await, 4);

    let mut order = Vec::new();
    while let Some(request) = scheduler.next_request().await {
        order.push(request.url.path().to_string());
    }
    assert_eq!(order, vec!["/high-1", "/high-2", "/mid", "/low"]);
}
