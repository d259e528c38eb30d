use std::collections::VecDeque;
use std::sync::Arc;

use arachne_core::async_trait;
use arachne_core::error::Result;
use arachne_core::request::Request;
use arachne_core::stats::Stats;
use tokio::sync::Mutex;

use crate::dupefilter::{DupeFilter, FingerprintDupeFilter};
use crate::scheduler_trait::Scheduler;

/// A first-in-first-out scheduler backed by a duplicate filter
pub struct FifoScheduler {
    /// Queue of pending requests
    queue: Mutex<VecDeque<Request>>,

    /// Filter consulted for every request that does not opt out
    dupefilter: Arc<dyn DupeFilter>,

    stats: Option<Arc<Stats>>,
}

impl FifoScheduler {
    /// Create a new FIFO scheduler with an in-memory fingerprint filter
    pub fn new() -> Self {
        Self::with_dupefilter(Arc::new(FingerprintDupeFilter::new()))
    }

    /// Create a new FIFO scheduler using the given duplicate filter
    pub fn with_dupefilter(dupefilter: Arc<dyn DupeFilter>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
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

impl Default for FifoScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for FifoScheduler {
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

        self.queue.lock().await.push_back(request);
        if let Some(stats) = &self.stats {
            stats.inc("scheduler/enqueued");
        }
        Ok(true)
    }

    async fn next_request(&self) -> Option<Request> {
        let request = self.queue.lock().await.pop_front();
        if let (Some(stats), Some(_)) = (&self.stats, &request) {
            stats.inc("scheduler/dequeued");
        }
        request
    }

    async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}
