use std::sync::Arc;
use std::time::Duration;

use arachne_core::error::Result;
use arachne_core::stats::Stats;
use arachne_downloader::{Fetcher, HttpDownloadHandler};
use arachne_middleware::{
    DefaultHeadersMiddleware, DepthMiddleware, FetchMiddlewareManager, HttpErrorMiddleware,
    OffsiteMiddleware, RedirectMiddleware, RetryMiddleware, SpiderMiddlewareManager,
};
use arachne_scheduler::{FifoScheduler, FingerprintDupeFilter, PriorityScheduler, Scheduler};

use crate::config::{EngineConfig, SchedulerType};

/// Create a scheduler based on the configuration
pub fn create_scheduler(config: &EngineConfig, stats: Arc<Stats>) -> Arc<dyn Scheduler> {
    let dupefilter = match &config.dupefilter_path {
        Some(path) => FingerprintDupeFilter::with_path(path.clone()),
        None => FingerprintDupeFilter::new(),
    };
    let dupefilter = Arc::new(dupefilter.with_stats(stats.clone()));

    match config.scheduler_type {
        SchedulerType::Fifo => {
            Arc::new(FifoScheduler::with_dupefilter(dupefilter).with_stats(stats))
        }
        SchedulerType::Priority => {
            Arc::new(PriorityScheduler::with_dupefilter(dupefilter).with_stats(stats))
        }
    }
}

/// Create the default fetch middleware stack: headers, retry and redirect
pub fn default_fetch_middlewares(
    config: &EngineConfig,
    stats: Arc<Stats>,
) -> FetchMiddlewareManager {
    let mut middlewares = FetchMiddlewareManager::new();
    middlewares.register(DefaultHeadersMiddleware::common());
    middlewares.register(
        RetryMiddleware::common()
            .with_max_retries(config.retry_times)
            .with_stats(stats.clone()),
    );
    middlewares.register(RedirectMiddleware::new(config.redirect_max_times).with_stats(stats));
    middlewares
}

/// Create a fetcher with an HTTP transport for both `http` and `https`
pub fn create_fetcher(config: &EngineConfig, stats: Arc<Stats>) -> Result<Fetcher> {
    let handler = Arc::new(HttpDownloadHandler::new(config.http.clone())?);
    Ok(Fetcher::new(config.fetcher.clone())
        .with_handler("http", handler.clone())
        .with_handler("https", handler)
        .with_middlewares(default_fetch_middlewares(config, stats.clone()))
        .with_stats(stats))
}

/// Create the default spider middleware stack
pub fn default_spider_middlewares(
    config: &EngineConfig,
    stats: Arc<Stats>,
) -> SpiderMiddlewareManager {
    let mut middlewares = SpiderMiddlewareManager::new();
    middlewares.register(HttpErrorMiddleware::new());
    middlewares.register(OffsiteMiddleware::new().with_stats(stats.clone()));
    middlewares.register(DepthMiddleware::new(config.depth_limit).with_stats(stats));
    middlewares
}

/// Format a duration as a human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else if seconds > 0 {
        format!("{}.{:03}s", seconds, millis)
    } else {
        format!("{}ms", millis)
    }
}
