// Configuration types for the engine

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use arachne_core::error::Error;
use arachne_downloader::{FetcherConfig, HttpHandlerConfig};
use serde::{Deserialize, Serialize};

/// Scheduler type to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SchedulerType {
    /// First-in first-out queue
    #[default]
    Fifo,
    /// Highest `Request::priority` first, FIFO among equals
    Priority,
}

impl fmt::Display for SchedulerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerType::Fifo => write!(f, "fifo"),
            SchedulerType::Priority => write!(f, "priority"),
        }
    }
}

impl FromStr for SchedulerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(SchedulerType::Fifo),
            "priority" => Ok(SchedulerType::Priority),
            other => Err(Error::other(format!("Unknown scheduler type: {}", other))),
        }
    }
}

/// Configuration for the crawler engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the worker pool running item pipelines and follow-up scheduling
    pub concurrent_items: usize,

    /// How long the scheduling loop sleeps when there is nothing to do
    pub idle_poll_interval: Duration,

    /// How long `run` waits in an idle state before finishing the crawl
    pub idle_timeout: Duration,

    /// Persist request fingerprints to this file
    pub dupefilter_path: Option<PathBuf>,

    /// Type of scheduler to use
    pub scheduler_type: SchedulerType,

    /// Interval for logging stats; `None` disables periodic logging
    pub log_stats_interval: Option<Duration>,

    /// Maximum number of retries per request
    pub retry_times: u32,

    /// Maximum number of redirects followed per request
    pub redirect_max_times: u32,

    /// Maximum crawl depth, 0 for unlimited
    pub depth_limit: u64,

    /// Fetch engine settings
    pub fetcher: FetcherConfig,

    /// HTTP transport settings
    pub http: HttpHandlerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let fetcher = FetcherConfig::default();
        Self {
            concurrent_items: fetcher.total_concurrency,
            idle_poll_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(1),
            dupefilter_path: None,
            scheduler_type: SchedulerType::Fifo,
            log_stats_interval: Some(Duration::from_secs(60)),
            retry_times: 2,
            redirect_max_times: 20,
            depth_limit: 0,
            fetcher,
            http: HttpHandlerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_concurrent_items(mut self, concurrent_items: usize) -> Self {
        self.concurrent_items = concurrent_items;
        self
    }

    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_dupefilter_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.dupefilter_path = Some(path.into());
        self
    }

    pub fn with_scheduler_type(mut self, scheduler_type: SchedulerType) -> Self {
        self.scheduler_type = scheduler_type;
        self
    }

    pub fn with_log_stats_interval(mut self, interval: Option<Duration>) -> Self {
        self.log_stats_interval = interval;
        self
    }

    pub fn with_retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn with_redirect_max_times(mut self, redirect_max_times: u32) -> Self {
        self.redirect_max_times = redirect_max_times;
        self
    }

    pub fn with_depth_limit(mut self, depth_limit: u64) -> Self {
        self.depth_limit = depth_limit;
        self
    }

    pub fn with_fetcher(mut self, fetcher: FetcherConfig) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_http(mut self, http: HttpHandlerConfig) -> Self {
        self.http = http;
        self
    }
}
