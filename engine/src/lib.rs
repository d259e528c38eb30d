use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use arachne_core::error::{Error, Result};
use arachne_core::item::Item;
use arachne_core::request::Request;
use arachne_core::response::Response;
use arachne_core::signal::{Signal, SignalArgs, SignalManager};
use arachne_core::spider::{CrawlResult, Spider};
use arachne_core::stats::Stats;
use arachne_downloader::Fetcher;
use arachne_middleware::{FetchOutcome, SpiderMiddlewareManager};
use arachne_pipeline::{ItemPipelineManager, LogPipeline};
use arachne_scheduler::Scheduler;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;

pub mod config;
pub mod pool;
pub mod stats;
pub mod utils;

pub use config::{EngineConfig, SchedulerType};
pub use pool::WorkPool;
pub use stats::{EngineState, EngineStats};

use crate::utils::{create_fetcher, create_scheduler, default_spider_middlewares, format_duration};

/// The parts an engine is assembled from
pub struct Components {
    pub scheduler: Arc<dyn Scheduler>,
    pub fetcher: Fetcher,
    pub spider_middlewares: SpiderMiddlewareManager,
    pub pipelines: ItemPipelineManager,
    pub signals: Arc<SignalManager>,
    pub stats: Arc<Stats>,
}

impl Components {
    /// Build the default components: fingerprint-filtered scheduler, HTTP
    /// fetcher with the standard middlewares, and a logging pipeline
    pub fn from_config(config: &EngineConfig, signals: Arc<SignalManager>) -> Result<Self> {
        let stats = Arc::new(Stats::new());
        let mut pipelines = ItemPipelineManager::new();
        pipelines.register(LogPipeline::default());

        Ok(Self {
            scheduler: create_scheduler(config, stats.clone()),
            fetcher: create_fetcher(config, stats.clone())?,
            spider_middlewares: default_spider_middlewares(config, stats.clone()),
            pipelines,
            signals,
            stats,
        })
    }
}

/// State shared between the engine handle, the scheduling loop and fetch tasks
struct Shared {
    spider: Arc<dyn Spider>,
    scheduler: Arc<dyn Scheduler>,
    fetcher: Fetcher,
    spider_middlewares: SpiderMiddlewareManager,
    pipelines: ItemPipelineManager,
    signals: Arc<SignalManager>,
    stats: Arc<Stats>,
    pool: WorkPool,
    config: EngineConfig,
    state: RwLock<EngineState>,
    wake: Notify,
    in_progress: Arc<AtomicUsize>,
    fetches: Mutex<JoinSet<()>>,
    start_time: RwLock<Option<Instant>>,
    end_time: RwLock<Option<Instant>>,
}

/// Counts a request from the moment it leaves the scheduler until its
/// results have been handed off
struct InProgress(Arc<AtomicUsize>);

impl InProgress {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn unix_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}

impl Shared {
    async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Sleep until new work is announced or the poll interval elapses
    async fn idle_wait(&self) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = sleep(self.config.idle_poll_interval) => {}
        }
    }

    async fn is_idle(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst) == 0
            && self.pool.active() == 0
            && self.fetcher.active() == 0
            && self.scheduler.is_empty().await
    }

    /// The single scheduling loop. Never waits on network I/O itself.
    async fn drive(self: Arc<Self>) {
        loop {
            match self.state().await {
                EngineState::Idle | EngineState::Stopping => break,
                EngineState::Paused => {
                    self.idle_wait().await;
                    continue;
                }
                EngineState::Running => {}
            }

            if self.fetcher.needs_backout() {
                self.idle_wait().await;
                continue;
            }

            let guard = InProgress::new(&self.in_progress);
            let request = match self.scheduler.next_request().await {
                Some(request) => request,
                None => {
                    drop(guard);
                    self.idle_wait().await;
                    continue;
                }
            };

            let shared = self.clone();
            let mut fetches = self.fetches.lock().await;
            while let Some(Some(finished)) = fetches.join_next().now_or_never() {
                if let Err(e) = finished {
                    error!("Fetch task failed: {}", e);
                }
            }
            fetches.spawn(async move {
                let _guard = guard;
                shared.fetch(request).await;
                shared.wake.notify_one();
            });
        }
        debug!("Scheduling loop for {} finished", self.spider.name());
    }

    async fn fetch(self: &Arc<Self>, request: Request) {
        let outcome = self
            .fetcher
            .fetch(request.clone(), self.spider.clone())
            .await;

        match outcome {
            Ok(FetchOutcome::Response(mut response)) => {
                response.attach_request(request.clone());
                debug!(
                    "Crawled ({}) {} (referer: {})",
                    response.status,
                    request,
                    request.referer().unwrap_or("None")
                );
                self.stats.inc("response_received_count");
                self.signals
                    .send_catch_log(
                        Signal::ResponseReceived,
                        SignalArgs::Response(Box::new(response.clone())),
                    )
                    .await;
                self.scrape(request, Ok(response)).await;
            }
            Ok(FetchOutcome::Request(replacement)) => {
                self.enqueue_request(replacement).await;
            }
            Err(error) => self.scrape(request, Err(error)).await,
        }
    }

    /// Run the scrape phase for a fetch outcome.
    ///
    /// A fetch error goes straight to the request callback when there is
    /// one, and through the scrape error phase otherwise.
    async fn scrape(self: &Arc<Self>, request: Request, outcome: Result<Response>) {
        let spider = self.spider.as_ref();
        let (result, response) = match outcome {
            Ok(response) => {
                let result = self
                    .spider_middlewares
                    .scrape_response(&request, response.clone(), spider)
                    .await;
                (result, Some(Arc::new(response)))
            }
            Err(error) => {
                let result = match &request.callback {
                    Some(callback) => callback.call(Err(error)).await,
                    None => self.spider_middlewares.scrape_error(error, spider).await,
                };
                (result, None)
            }
        };

        match result {
            Ok(result) => self.handle_result(result, response).await,
            Err(error) => self.spider_error(error, Some(&request)).await,
        }
    }

    /// Hand every follow-up request and every item to the worker pool
    async fn handle_result(self: &Arc<Self>, result: CrawlResult, response: Option<Arc<Response>>) {
        for request in result.requests {
            let shared = self.clone();
            self.pool
                .submit(async move { shared.enqueue_request(request).await })
                .await;
        }
        for item in result.items {
            let shared = self.clone();
            let response = response.clone();
            self.pool
                .submit(async move { shared.process_item(item, response).await })
                .await;
        }
    }

    async fn process_item(&self, item: Item, response: Option<Arc<Response>>) {
        let source = response
            .as_ref()
            .map(|r| r.url.to_string())
            .unwrap_or_else(|| "None".to_string());
        let original = item.clone();

        match self.pipelines.process_item(item, self.spider.as_ref()).await {
            Ok(item) => {
                debug!("Scraped item {} from {}", item, source);
                self.stats.inc("item_scraped_count");
                self.signals
                    .send_catch_log(
                        Signal::ItemScraped,
                        SignalArgs::Item {
                            item: Box::new(item),
                            response: response.map(|r| Box::new((*r).clone())),
                        },
                    )
                    .await;
            }
            Err(e) if e.is_item_dropped() => {
                warn!("Dropped item {} from {}: {}", original, source, e);
                self.stats.inc("item_dropped_count");
                self.signals
                    .send_catch_log(
                        Signal::ItemDropped,
                        SignalArgs::Item {
                            item: Box::new(original),
                            response: response.map(|r| Box::new((*r).clone())),
                        },
                    )
                    .await;
            }
            Err(e) => {
                error!("Error processing item {} from {}: {}", original, source, e);
            }
        }
    }

    async fn enqueue_request(&self, request: Request) {
        let args = SignalArgs::Request(Box::new(request.clone()));
        self.signals
            .send_catch_log(Signal::RequestScheduled, args.clone())
            .await;

        let url = request.url.clone();
        match self.scheduler.enqueue_request(request).await {
            Ok(true) => self.wake.notify_one(),
            Ok(false) => {
                debug!("Filtered duplicate request: {}", url);
                self.signals
                    .send_catch_log(Signal::RequestDropped, args)
                    .await;
            }
            Err(e) => self.spider_error(e, None).await,
        }
    }

    /// Log, count and publish an error that no stage handled
    async fn spider_error(&self, error: Error, request: Option<&Request>) {
        if error.is_spider_closed() || error.is_ignore() {
            return;
        }

        let url = request
            .map(|r| r.url.to_string())
            .or_else(|| error.context().and_then(|c| c.url.clone()));
        let referer = request.and_then(|r| r.referer()).unwrap_or("None");
        error!(
            "Processing request {} (referer: {}): {}",
            url.as_deref().unwrap_or("None"),
            referer,
            error
        );

        self.stats.inc(&format!("SpiderError/{}", error.kind()));
        self.signals
            .send_catch_log(
                Signal::SpiderError,
                SignalArgs::Error {
                    message: error.to_string(),
                    url,
                },
            )
            .await;
    }

    async fn summary(&self) -> EngineStats {
        EngineStats::from_snapshot(
            self.stats.snapshot(),
            *self.start_time.read().await,
            *self.end_time.read().await,
        )
    }
}

/// The crawl orchestrator.
///
/// Moves through `Idle -> Running -> (Paused <-> Running) -> Stopping -> Idle`.
/// An engine runs a single crawl; starting it twice panics.
pub struct Engine {
    shared: Arc<Shared>,
    started: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
    stats_logger: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine with the default components
    pub fn new(spider: Arc<dyn Spider>, config: EngineConfig) -> Result<Self> {
        let components = Components::from_config(&config, Arc::new(SignalManager::new()))?;
        Ok(Self::with_components(spider, components, config))
    }

    /// Create an engine from explicit components
    pub fn with_components(
        spider: Arc<dyn Spider>,
        components: Components,
        config: EngineConfig,
    ) -> Self {
        let shared = Shared {
            spider,
            scheduler: components.scheduler,
            fetcher: components.fetcher,
            spider_middlewares: components.spider_middlewares,
            pipelines: components.pipelines,
            signals: components.signals,
            stats: components.stats,
            pool: WorkPool::new(config.concurrent_items),
            config,
            state: RwLock::new(EngineState::Idle),
            wake: Notify::new(),
            in_progress: Arc::new(AtomicUsize::new(0)),
            fetches: Mutex::new(JoinSet::new()),
            start_time: RwLock::new(None),
            end_time: RwLock::new(None),
        };

        Self {
            shared: Arc::new(shared),
            started: AtomicBool::new(false),
            driver: Mutex::new(None),
            stats_logger: Mutex::new(None),
        }
    }

    /// Get the signal manager
    pub fn signals(&self) -> Arc<SignalManager> {
        self.shared.signals.clone()
    }

    /// Get the stats collector
    pub fn stats(&self) -> Arc<Stats> {
        self.shared.stats.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub async fn state(&self) -> EngineState {
        self.shared.state().await
    }

    /// Number of requests taken from the scheduler whose results are not handed off yet
    pub fn in_progress(&self) -> usize {
        self.shared.in_progress.load(Ordering::SeqCst)
    }

    /// Summary of the counters recorded so far
    pub async fn summary(&self) -> EngineStats {
        self.shared.summary().await
    }

    /// Open every component, schedule the seed requests and start the
    /// scheduling loop.
    ///
    /// # Panics
    ///
    /// Panics if the engine was started before.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("Engine for spider {} already started", self.shared.spider.name());
        }

        let shared = &self.shared;
        let spider = shared.spider.as_ref();
        *shared.state.write().await = EngineState::Running;
        *shared.start_time.write().await = Some(Instant::now());
        shared.stats.set_str("start_time", unix_timestamp());
        shared
            .signals
            .send_catch_log(Signal::CrawlerStarted, SignalArgs::None)
            .await;

        info!("Opening spider {}", spider.name());
        if let Err(e) = self.open_components().await {
            error!("Failed to open spider {}: {}", spider.name(), e);
            *shared.state.write().await = EngineState::Idle;
            return Err(e);
        }

        let mut seeds = Vec::new();
        for request in spider.start_requests() {
            match request {
                Ok(request) => seeds.push(request),
                Err(e) => shared.spider_error(e, None).await,
            }
        }
        let seeds = match shared
            .spider_middlewares
            .process_start_requests(seeds, spider)
            .await
        {
            Ok(seeds) => seeds,
            Err(e) => {
                shared.spider_error(e, None).await;
                Vec::new()
            }
        };

        shared
            .signals
            .send_catch_log(Signal::SpiderOpened, SignalArgs::Spider(spider.name().to_string()))
            .await;

        for request in seeds {
            shared.enqueue_request(request).await;
        }

        *self.driver.lock().await = Some(tokio::spawn(shared.clone().drive()));

        if let Some(period) = shared.config.log_stats_interval {
            let stats = shared.stats.clone();
            let name = spider.name().to_string();
            *self.stats_logger.lock().await = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    info!(
                        "[{}] Crawled {} pages, scraped {} items",
                        name,
                        stats.get("response_received_count"),
                        stats.get("item_scraped_count")
                    );
                }
            }));
        }

        Ok(())
    }

    async fn open_components(&self) -> Result<()> {
        let shared = &self.shared;
        let spider = shared.spider.as_ref();
        shared.fetcher.open(spider).await?;
        shared.spider_middlewares.open_spider(spider).await?;
        shared.scheduler.open().await?;
        shared.pipelines.open_spider(spider).await?;
        Ok(())
    }

    /// Stop pulling new requests until `resume` is called. Fetches already
    /// dispatched run to completion.
    pub async fn pause(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write().await;
            if *state != EngineState::Running {
                return Err(Error::other(format!("Cannot pause engine while {}", *state)));
            }
            *state = EngineState::Paused;
        }
        info!("Engine paused");
        self.shared
            .signals
            .send_catch_log(Signal::EnginePaused, SignalArgs::None)
            .await;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write().await;
            if *state != EngineState::Paused {
                return Err(Error::other(format!("Cannot resume engine while {}", *state)));
            }
            *state = EngineState::Running;
        }
        self.shared.wake.notify_one();
        info!("Engine resumed");
        self.shared
            .signals
            .send_catch_log(Signal::EngineResumed, SignalArgs::None)
            .await;
        Ok(())
    }

    /// Shut the crawl down.
    ///
    /// Stops the scheduling loop, fails fetches still queued in slots, waits
    /// for in-flight fetches and pool jobs, then closes pipelines, spider
    /// middlewares and the scheduler. Calling it on an idle or stopping
    /// engine does nothing.
    pub async fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.write().await;
            match *state {
                EngineState::Idle | EngineState::Stopping => return Ok(()),
                _ => *state = EngineState::Stopping,
            }
        }
        shared.wake.notify_one();

        let spider = shared.spider.as_ref();
        info!("Closing spider {}", spider.name());

        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.await {
                error!("Scheduling loop failed: {}", e);
            }
        }

        let mut first_error: Option<Error> = None;
        let mut record = |result: Result<()>, component: &str| {
            if let Err(e) = result {
                error!("Error closing {}: {}", component, e);
                first_error.get_or_insert(e);
            }
        };

        record(shared.fetcher.close(spider).await, "fetcher");
        loop {
            let mut fetches = shared.fetches.lock().await;
            match fetches.join_next().await {
                Some(Err(e)) => error!("Fetch task failed: {}", e),
                Some(Ok(())) => {}
                None => break,
            }
        }
        shared.pool.join().await;

        record(shared.pipelines.close_spider(spider).await, "item pipelines");
        record(
            shared.spider_middlewares.close_spider(spider).await,
            "spider middlewares",
        );
        record(shared.scheduler.close().await, "scheduler");
        record(spider.closed().await, "spider");

        if let Some(logger) = self.stats_logger.lock().await.take() {
            logger.abort();
        }

        *shared.end_time.write().await = Some(Instant::now());
        shared.stats.set_str("finish_time", unix_timestamp());
        shared
            .signals
            .send_catch_log(Signal::SpiderClosed, SignalArgs::Spider(spider.name().to_string()))
            .await;
        shared
            .signals
            .send_catch_log(Signal::CrawlerStopped, SignalArgs::None)
            .await;

        *shared.state.write().await = EngineState::Idle;

        let summary = shared.summary().await;
        let elapsed = summary.duration().map(format_duration).unwrap_or_default();
        info!("Spider {} closed after {}: {}", spider.name(), elapsed, summary);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Crawl until nothing is queued or in flight for `idle_timeout`, then stop
    pub async fn run(&self) -> Result<EngineStats> {
        self.start().await?;
        self.wait_idle().await;
        self.stop().await?;
        Ok(self.summary().await)
    }

    async fn wait_idle(&self) {
        let shared = &self.shared;
        let mut idle_since: Option<Instant> = None;

        loop {
            match shared.state().await {
                EngineState::Idle | EngineState::Stopping => return,
                EngineState::Running | EngineState::Paused => {}
            }

            if shared.is_idle().await {
                let since = match idle_since {
                    Some(since) => since,
                    None => {
                        debug!("Spider {} is idle", shared.spider.name());
                        shared
                            .signals
                            .send_catch_log(
                                Signal::SpiderIdle,
                                SignalArgs::Spider(shared.spider.name().to_string()),
                            )
                            .await;
                        *idle_since.insert(Instant::now())
                    }
                };
                if since.elapsed() >= shared.config.idle_timeout {
                    return;
                }
            } else {
                idle_since = None;
            }

            sleep(shared.config.idle_poll_interval).await;
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(logger) = self.stats_logger.get_mut().take() {
            logger.abort();
        }
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests;
