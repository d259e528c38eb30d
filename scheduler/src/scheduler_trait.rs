use arachne_core::async_trait;
use arachne_core::error::Result;
use arachne_core::request::Request;

/// Holds requests that have not been fetched yet and decides their admission
#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Prepare the scheduler, opening its duplicate filter
    async fn open(&self) -> Result<()>;

    /// Shut the scheduler down, closing its duplicate filter
    async fn close(&self) -> Result<()>;

    /// Queue a request. Returns `false` when it was rejected as a duplicate.
    async fn enqueue_request(&self, request: Request) -> Result<bool>;

    /// Remove and return the next request, if any
    async fn next_request(&self) -> Option<Request>;

    /// Get the number of pending requests
    async fn len(&self) -> usize;

    /// Check if the scheduler is empty
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
