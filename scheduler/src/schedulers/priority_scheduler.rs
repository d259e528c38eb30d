use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use arachne_core::async_trait;
use arachne_core::error::Result;
use arachne_core::request::Request;
use arachne_core::stats::Stats;
use priority_queue::PriorityQueue;
use tokio::sync::Mutex;

use crate::dupefilter::{DupeFilter, FingerprintDupeFilter};
use crate::scheduler_trait::Scheduler;

#[derive(Default)]
struct Queue {
    /// Sequence number keyed by (priority, reverse insertion order)
    order: PriorityQueue<u64, (i32, Reverse<u64>)>,
    requests: HashMap<u64, Request>,
    next_seq: u64,
}

/// Serves higher-priority requests first, and equal priorities in insertion order
pub struct PriorityScheduler {
    queue: Mutex<Queue>,
    dupefilter: Arc<dyn DupeFilter>,
    stats: Option<Arc<Stats>>,
}

impl PriorityScheduler {
    /// Create a new priority scheduler with an in-memory fingerprint filter
    pub fn new() -> Self {
        Self::with_dupefilter(Arc::new(FingerprintDupeFilter::new()))
    }

    /// Create a new priority scheduler using the given duplicate filter
    pub fn with_dupefilter(dupefilter: Arc<dyn DupeFilter>) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            dupefilter,
            stats: None,
        }
    }

    /// Count enqueued and dequeued requests in the given stats
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for PriorityScheduler {
    async fn open(&self) -> Result<()> {
        self.dupefilter.open().await
    }

    async fn close(&self) -> Result<()> {
        self.dupefilter.close().await
    }

    async fn enqueue_request(&self, request: Request) -> Result<bool> {
        if !request.dont_filter && self.dupefilter.request_seen(&request).await? {
            return Ok(false);
        }

        let mut queue = self.queue.lock().await;
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.order.push(seq, (request.priority, Reverse(seq)));
        queue.requests.insert(seq, request);
        if let Some(stats) = &self.stats {
            stats.inc("scheduler/enqueued");
        }
        Ok(true)
    }

    async fn next_request(&self) -> Option<Request> {
        let mut queue = self.queue.lock().await;
        let (seq, _) = queue.order.pop()?;
        let request = queue.requests.remove(&seq);
        if let (Some(stats), Some(_)) = (&self.stats, &request) {
            stats.inc("scheduler/dequeued");
        }
        request
    }

    async fn len(&self) -> usize {
        self.queue.lock().await.requests.len()
    }
}
