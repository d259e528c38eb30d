//! Per-target fetch slots with global backpressure.
//!
//! Every request is routed to a [`Slot`] keyed by host (or resolved IP).
//! Each slot owns a dispatch loop that enforces the slot's concurrency
//! ceiling and the inter-request delay, so the delay paces dispatches
//! rather than completions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use arachne_core::error::{Error, Result};
use arachne_core::request::{meta, Request};
use arachne_core::response::Response;
use arachne_core::spider::Spider;
use arachne_core::stats::Stats;
use arachne_middleware::{FetchMiddlewareManager, FetchOutcome};
use futures::FutureExt;
use log::{debug, info, warn};
use moka::sync::Cache;
use rand::Rng;
use tokio::sync::{oneshot, watch, Notify, RwLock};
use tokio::task::JoinSet;

use crate::DownloadHandler;

/// Configuration for the fetcher
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Maximum number of in-flight fetches across all slots
    pub total_concurrency: usize,

    /// Per-slot concurrency when slots are keyed by host
    pub domain_concurrency: usize,

    /// Per-slot concurrency when slots are keyed by IP; 0 disables IP keying
    pub ip_concurrency: usize,

    /// Default delay between dispatches to the same slot
    pub delay: Duration,

    /// Draw each delay uniformly from [0.5, 1.5) times the base delay
    pub randomize_delay: bool,

    /// How often idle slots are retired
    pub slot_gc_interval: Duration,

    /// Maximum number of cached DNS answers
    pub dns_cache_size: u64,

    /// How long a DNS answer stays cached
    pub dns_cache_ttl: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            total_concurrency: 16,
            domain_concurrency: 8,
            ip_concurrency: 0,
            delay: Duration::ZERO,
            randomize_delay: true,
            slot_gc_interval: Duration::from_secs(60),
            dns_cache_size: 8192,
            dns_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl FetcherConfig {
    pub fn with_total_concurrency(mut self, total: usize) -> Self {
        self.total_concurrency = total;
        self
    }

    pub fn with_domain_concurrency(mut self, concurrency: usize) -> Self {
        self.domain_concurrency = concurrency;
        self
    }

    pub fn with_ip_concurrency(mut self, concurrency: usize) -> Self {
        self.ip_concurrency = concurrency;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_randomize_delay(mut self, randomize: bool) -> Self {
        self.randomize_delay = randomize;
        self
    }

    pub fn with_slot_gc_interval(mut self, interval: Duration) -> Self {
        self.slot_gc_interval = interval;
        self
    }

    pub fn with_dns_cache(mut self, size: u64, ttl: Duration) -> Self {
        self.dns_cache_size = size;
        self.dns_cache_ttl = ttl;
        self
    }
}

type Handlers = HashMap<String, Arc<dyn DownloadHandler>>;

struct FetchTask {
    request: Request,
    spider: Arc<dyn Spider>,
    result: oneshot::Sender<Result<Response>>,
}

#[derive(Default)]
struct SlotState {
    queue: VecDeque<FetchTask>,
    in_flight: usize,
    last_dispatch: Option<Instant>,
    /// Earliest dispatch time of the queue head, drawn once per head
    ready_at: Option<Instant>,
    closed: bool,
}

enum Step {
    Dispatch(FetchTask),
    Wait(Option<Instant>),
    Exit,
}

/// Upper bound on any per-slot delay
const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy)]
struct DelayPolicy {
    base: Duration,
    randomize: bool,
}

impl DelayPolicy {
    /// Request meta beats the spider, which beats the fetcher default
    fn delay_for(&self, request: &Request, spider: &dyn Spider) -> Duration {
        let base = request
            .download_delay()
            .or_else(|| spider.download_delay())
            .unwrap_or(self.base)
            .min(MAX_DELAY);

        if self.randomize && !base.is_zero() {
            Duration::try_from_secs_f64(
                base.as_secs_f64() * rand::thread_rng().gen_range(0.5..1.5),
            )
            .unwrap_or(base)
        } else {
            base
        }
    }
}

/// Concurrency and pacing unit for one target
struct Slot {
    key: String,
    concurrency: usize,
    state: Mutex<SlotState>,
    wake: Notify,
}

impl Slot {
    fn new(key: &str, concurrency: usize) -> Self {
        Self {
            key: key.to_string(),
            concurrency: concurrency.max(1),
            state: Mutex::new(SlotState::default()),
            wake: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a task, handing it back if the slot was already retired
    fn admit(&self, task: FetchTask) -> std::result::Result<(), FetchTask> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(task);
            }
            state.queue.push_back(task);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Mark the slot closed if it has no queued or in-flight work.
    ///
    /// Shares the state lock with `admit`, so a task is never queued on a
    /// retired slot.
    fn retire_if_idle(&self) -> bool {
        let retired = {
            let mut state = self.state();
            if !state.closed && state.queue.is_empty() && state.in_flight == 0 {
                state.closed = true;
                true
            } else {
                false
            }
        };
        if retired {
            self.wake.notify_one();
        }
        retired
    }

    /// Stop admitting work and fail everything still queued
    fn close(&self) {
        let pending: Vec<FetchTask> = {
            let mut state = self.state();
            state.closed = true;
            state.queue.drain(..).collect()
        };
        for task in pending {
            let _ = task.result.send(Err(Error::SpiderClosed));
        }
        self.wake.notify_one();
    }

    fn finish(&self) {
        {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.wake.notify_one();
    }

    fn next_step(&self, policy: &DelayPolicy) -> Step {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.closed {
            return if state.in_flight == 0 {
                Step::Exit
            } else {
                Step::Wait(None)
            };
        }
        if state.in_flight >= self.concurrency {
            return Step::Wait(None);
        }

        let ready_at = match (state.ready_at, state.queue.front()) {
            (_, None) => return Step::Wait(None),
            (Some(ready_at), Some(_)) => ready_at,
            (None, Some(head)) => {
                let delay = policy.delay_for(&head.request, head.spider.as_ref());
                let ready_at = state
                    .last_dispatch
                    .and_then(|last| last.checked_add(delay))
                    .unwrap_or_else(Instant::now);
                state.ready_at = Some(ready_at);
                ready_at
            }
        };

        let now = Instant::now();
        if ready_at > now {
            return Step::Wait(Some(ready_at));
        }

        match state.queue.pop_front() {
            Some(task) => {
                state.ready_at = None;
                state.last_dispatch = Some(now);
                state.in_flight += 1;
                Step::Dispatch(task)
            }
            None => Step::Wait(None),
        }
    }
}

/// Releases one slot admission when dropped
struct InFlight(Arc<Slot>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Decrements the fetcher-wide in-flight counter when dropped
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_slot(
    slot: Arc<Slot>,
    handlers: Arc<Handlers>,
    policy: DelayPolicy,
    stats: Option<Arc<Stats>>,
) {
    debug!(
        "Slot {} started (concurrency {})",
        slot.key, slot.concurrency
    );
    loop {
        match slot.next_step(&policy) {
            Step::Exit => break,
            Step::Wait(None) => slot.wake.notified().await,
            Step::Wait(Some(ready_at)) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(ready_at.into()) => {}
                    _ = slot.wake.notified() => {}
                }
            }
            Step::Dispatch(task) => {
                tokio::spawn(transfer(
                    InFlight(slot.clone()),
                    handlers.clone(),
                    task,
                    stats.clone(),
                ));
            }
        }
    }
    debug!("Slot {} stopped", slot.key);
}

async fn transfer(
    _in_flight: InFlight,
    handlers: Arc<Handlers>,
    task: FetchTask,
    stats: Option<Arc<Stats>>,
) {
    let FetchTask {
        request, result, ..
    } = task;

    if let Some(stats) = &stats {
        stats.inc("fetcher/request_count");
    }

    let scheme = request.url.scheme().to_string();
    let outcome = match handlers.get(&scheme) {
        Some(handler) => handler.download(request).await,
        None => Err(Error::UnsupportedScheme(scheme)),
    };

    if let Some(stats) = &stats {
        match &outcome {
            Ok(_) => stats.inc("fetcher/response_count"),
            Err(_) => stats.inc("fetcher/exception_count"),
        }
    }

    if result.send(outcome).is_err() {
        debug!("Fetch result discarded, caller went away");
    }
}

/// Retire every idle slot, returning how many were removed
async fn collect_idle_slots(slots: &RwLock<HashMap<String, Arc<Slot>>>) -> usize {
    let mut slots = slots.write().await;
    let before = slots.len();
    slots.retain(|key, slot| {
        let retired = slot.retire_if_idle();
        if retired {
            debug!("Retired idle slot {}", key);
        }
        !retired
    });
    before - slots.len()
}

/// The fetch engine.
///
/// Wraps the fetch middleware chain around per-slot dispatch. One
/// [`DownloadHandler`] is registered per URL scheme.
pub struct Fetcher {
    config: FetcherConfig,
    handlers: Arc<Handlers>,
    middlewares: FetchMiddlewareManager,
    slots: Arc<RwLock<HashMap<String, Arc<Slot>>>>,
    dns_cache: Cache<String, String>,
    active: AtomicUsize,
    closed: AtomicBool,
    tasks: Arc<tokio::sync::Mutex<JoinSet<()>>>,
    shutdown: watch::Sender<bool>,
    stats: Option<Arc<Stats>>,
}

impl Fetcher {
    /// Create a fetcher with no handlers and an empty middleware chain
    pub fn new(config: FetcherConfig) -> Self {
        let dns_cache = Cache::builder()
            .max_capacity(config.dns_cache_size)
            .time_to_live(config.dns_cache_ttl)
            .build();
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            handlers: Arc::new(HashMap::new()),
            middlewares: FetchMiddlewareManager::new(),
            slots: Arc::new(RwLock::new(HashMap::new())),
            dns_cache,
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            tasks: Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
            shutdown,
            stats: None,
        }
    }

    /// Register the transport for a URL scheme
    pub fn with_handler(mut self, scheme: &str, handler: Arc<dyn DownloadHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).insert(scheme.to_ascii_lowercase(), handler);
        self
    }

    /// Replace the fetch middleware chain
    pub fn with_middlewares(mut self, middlewares: FetchMiddlewareManager) -> Self {
        self.middlewares = middlewares;
        self
    }

    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn middlewares_mut(&mut self) -> &mut FetchMiddlewareManager {
        &mut self.middlewares
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Number of fetches currently in flight
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the caller should stop issuing fetches for now
    pub fn needs_backout(&self) -> bool {
        self.active() >= self.config.total_concurrency
    }

    /// Number of live slots
    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Open the middleware chain and start the idle slot sweep
    pub async fn open(&self, spider: &dyn Spider) -> Result<()> {
        self.middlewares.open_spider(spider).await?;

        let interval = self.config.slot_gc_interval;
        if !interval.is_zero() {
            let slots = self.slots.clone();
            let tasks = self.tasks.clone();
            let mut shutdown = self.shutdown.subscribe();
            self.tasks.lock().await.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let retired = collect_idle_slots(&slots).await;
                            if retired > 0 {
                                debug!("Slot sweep retired {} slots", retired);
                            }
                            // close() holds the lock while it joins us
                            if let Ok(mut tasks) = tasks.try_lock() {
                                while let Some(Some(_)) = tasks.join_next().now_or_never() {}
                            }
                        }
                    }
                }
            });
        }

        info!("Fetcher opened for spider {}", spider.name());
        Ok(())
    }

    /// Stop every slot and wait for all in-flight transfers to finish.
    ///
    /// Requests still queued in a slot fail with [`Error::SpiderClosed`].
    pub async fn close(&self, spider: &dyn Spider) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);

        {
            let mut slots = self.slots.write().await;
            for (_, slot) in slots.drain() {
                slot.close();
            }
        }

        {
            let mut tasks = self.tasks.lock().await;
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!("Fetcher task failed: {}", e);
                }
            }
        }

        for (scheme, handler) in self.handlers.iter() {
            if let Err(e) = handler.close().await {
                warn!("Failed to close {} handler: {}", scheme, e);
            }
        }

        self.middlewares.close_spider(spider).await?;
        info!("Fetcher closed for spider {}", spider.name());
        Ok(())
    }

    /// Fetch `request` through the middleware chain.
    ///
    /// Returns the response, or a replacement request to schedule instead.
    pub async fn fetch(&self, mut request: Request, spider: Arc<dyn Spider>) -> Result<FetchOutcome> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let key = self.slot_key(&mut request).await;
        let transfer_spider = spider.clone();
        self.middlewares
            .process(request, spider.as_ref(), move |request| {
                self.enqueue(key, request, transfer_spider)
            })
            .await
    }

    async fn enqueue(
        &self,
        key: String,
        request: Request,
        spider: Arc<dyn Spider>,
    ) -> Result<Response> {
        let scheme = request.url.scheme();
        if !self.handlers.contains_key(scheme) {
            return Err(Error::UnsupportedScheme(scheme.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let mut task = FetchTask {
            request,
            spider: spider.clone(),
            result: tx,
        };
        loop {
            let slot = self.slot(&key, spider.as_ref()).await?;
            match slot.admit(task) {
                Ok(()) => break,
                // retired by the sweep between lookup and admission
                Err(rejected) => task = rejected,
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) if self.closed.load(Ordering::SeqCst) => Err(Error::SpiderClosed),
            Err(_) => Err(Error::other("fetch task aborted")),
        }
    }

    async fn slot(&self, key: &str, spider: &dyn Spider) -> Result<Arc<Slot>> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return Ok(slot.clone());
        }

        let mut slots = self.slots.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SpiderClosed);
        }
        if let Some(slot) = slots.get(key) {
            return Ok(slot.clone());
        }

        let slot = Arc::new(Slot::new(key, self.slot_concurrency(spider)));
        let policy = DelayPolicy {
            base: self.config.delay,
            randomize: self.config.randomize_delay,
        };
        self.tasks.lock().await.spawn(run_slot(
            slot.clone(),
            self.handlers.clone(),
            policy,
            self.stats.clone(),
        ));
        slots.insert(key.to_string(), slot.clone());
        Ok(slot)
    }

    fn slot_concurrency(&self, spider: &dyn Spider) -> usize {
        match spider.concurrent_requests() {
            Some(n) if n > 0 => n,
            _ if self.config.ip_concurrency > 0 => self.config.ip_concurrency,
            _ => self.config.domain_concurrency,
        }
    }

    /// Resolve the slot key for `request` and store it in the request meta
    async fn slot_key(&self, request: &mut Request) -> String {
        if let Some(key) = request.download_slot() {
            return key.to_string();
        }

        let host = request.url.host_str().unwrap_or_default().to_string();
        let key = if self.config.ip_concurrency > 0 {
            let port = request.url.port_or_known_default().unwrap_or(80);
            self.resolve(&host, port).await
        } else {
            host
        };

        request
            .meta
            .insert(meta::DOWNLOAD_SLOT.to_string(), key.clone().into());
        key
    }

    async fn resolve(&self, host: &str, port: u16) -> String {
        if let Some(ip) = self.dns_cache.get(host) {
            return ip;
        }

        match tokio::net::lookup_host((host, port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => {
                    let ip = addr.ip().to_string();
                    self.dns_cache.insert(host.to_string(), ip.clone());
                    ip
                }
                None => host.to_string(),
            },
            Err(e) => {
                debug!("DNS lookup for {} failed, keying slot by host: {}", host, e);
                host.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailingHandler, MockHandler};
    use arachne_core::spider::BasicSpider;
    use arachne_middleware::RetryMiddleware;
    use tokio::time::sleep;

    fn spider() -> Arc<dyn Spider> {
        Arc::new(BasicSpider::new("test", vec![]))
    }

    fn spawn_fetch(
        fetcher: &Arc<Fetcher>,
        spider: &Arc<dyn Spider>,
        request: Request,
    ) -> tokio::task::JoinHandle<Result<FetchOutcome>> {
        let fetcher = fetcher.clone();
        let spider = spider.clone();
        tokio::spawn(async move { fetcher.fetch(request, spider).await })
    }

    fn response(outcome: FetchOutcome) -> Response {
        match outcome {
            FetchOutcome::Response(response) => response,
            FetchOutcome::Request(request) => panic!("expected a response, got {}", request),
        }
    }

    #[tokio::test]
    async fn test_backout_while_fetch_in_flight() {
        let handler = Arc::new(MockHandler::new().with_latency(Duration::from_millis(200)));
        let fetcher = Arc::new(
            Fetcher::new(FetcherConfig::default().with_total_concurrency(1))
                .with_handler("https", handler.clone()),
        );
        let spider = spider();
        fetcher.open(spider.as_ref()).await.unwrap();
        assert!(!fetcher.needs_backout());

        let first = spawn_fetch(&fetcher, &spider, Request::get("https://a.example/").unwrap());
        let second = spawn_fetch(&fetcher, &spider, Request::get("https://b.example/").unwrap());
        sleep(Duration::from_millis(50)).await;

        assert!(fetcher.needs_backout());
        assert_eq!(fetcher.active(), 2);

        assert_eq!(response(first.await.unwrap().unwrap()).status, 200);
        assert_eq!(response(second.await.unwrap().unwrap()).status, 200);
        assert!(!fetcher.needs_backout());
        assert_eq!(fetcher.active(), 0);

        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_slot_paces_dispatches() {
        let delay = Duration::from_millis(200);
        let handler = Arc::new(MockHandler::new());
        let fetcher = Arc::new(
            Fetcher::new(
                FetcherConfig::default()
                    .with_delay(delay)
                    .with_randomize_delay(false),
            )
            .with_handler("https", handler.clone()),
        );
        let spider = spider();
        fetcher.open(spider.as_ref()).await.unwrap();

        let first = spawn_fetch(&fetcher, &spider, Request::get("https://example.com/1").unwrap());
        let second = spawn_fetch(&fetcher, &spider, Request::get("https://example.com/2").unwrap());
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let calls = handler.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].at.duration_since(calls[0].at) >= delay);

        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_delay_overrides_default() {
        let handler = Arc::new(MockHandler::new());
        let fetcher = Arc::new(
            Fetcher::new(FetcherConfig::default().with_randomize_delay(false))
                .with_handler("https", handler.clone()),
        );
        let spider = spider();

        let slow = |path: &str| {
            Request::get(format!("https://example.com/{}", path))
                .unwrap()
                .with_meta(meta::DOWNLOAD_DELAY, 0.15)
        };
        let first = spawn_fetch(&fetcher, &spider, slow("1"));
        let second = spawn_fetch(&fetcher, &spider, slow("2"));
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let calls = handler.calls();
        assert!(calls[1].at.duration_since(calls[0].at) >= Duration::from_millis(150));

        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_keeps_slot_running() {
        let handler = Arc::new(MockHandler::new());
        let fetcher = Arc::new(
            Fetcher::new(FetcherConfig::default().with_randomize_delay(false))
                .with_handler("https", handler.clone()),
        );
        let spider = spider();

        let get = |path: &str| Request::get(format!("https://example.com/{}", path)).unwrap();
        fetcher.fetch(get("1"), spider.clone()).await.unwrap();
        let second = spawn_fetch(
            &fetcher,
            &spider,
            get("2").with_meta(meta::DOWNLOAD_DELAY, 1e300),
        );
        let third = tokio::time::timeout(Duration::from_secs(1), fetcher.fetch(get("3"), spider.clone()))
            .await
            .expect("slot stalled");

        assert!(third.is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(handler.call_count(), 3);
        assert_eq!(fetcher.active(), 0);

        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[test]
    fn test_delay_is_capped() {
        let spider = spider();
        let request = Request::get("https://example.com/")
            .unwrap()
            .with_meta(meta::DOWNLOAD_DELAY, 1e12);

        let fixed = DelayPolicy {
            base: Duration::ZERO,
            randomize: false,
        };
        assert_eq!(fixed.delay_for(&request, spider.as_ref()), MAX_DELAY);

        let randomized = DelayPolicy {
            base: Duration::ZERO,
            randomize: true,
        };
        let delay = randomized.delay_for(&request, spider.as_ref());
        assert!(delay >= MAX_DELAY / 2 && delay < MAX_DELAY * 3 / 2);
    }

    #[tokio::test]
    async fn test_panicking_transport_is_not_a_shutdown() {
        struct PanickingHandler;

        #[arachne_core::async_trait]
        impl DownloadHandler for PanickingHandler {
            async fn download(&self, _request: Request) -> Result<Response> {
                panic!("transport bug")
            }
        }

        let fetcher = Fetcher::new(FetcherConfig::default())
            .with_handler("https", Arc::new(PanickingHandler));
        let spider = spider();

        let error = fetcher
            .fetch(Request::get("https://example.com/").unwrap(), spider.clone())
            .await
            .unwrap_err();
        assert!(!error.is_spider_closed());
        assert_eq!(fetcher.active(), 0);

        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_slot_key_is_written_to_meta() {
        let handler = Arc::new(MockHandler::new());
        let fetcher = Fetcher::new(FetcherConfig::default()).with_handler("https", handler.clone());
        let spider = spider();

        fetcher
            .fetch(Request::get("https://example.com:8443/x").unwrap(), spider.clone())
            .await
            .unwrap();
        fetcher
            .fetch(
                Request::get("https://other.example/").unwrap().with_meta(meta::DOWNLOAD_SLOT, "shared"),
                spider.clone(),
            )
            .await
            .unwrap();

        let slots: Vec<_> = handler.calls().into_iter().map(|c| c.slot).collect();
        assert_eq!(
            slots,
            vec![Some("example.com".to_string()), Some("shared".to_string())]
        );
        assert_eq!(fetcher.slot_count().await, 2);

        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_ip_concurrency_keys_slots_by_address() {
        let handler = Arc::new(MockHandler::new());
        let fetcher = Fetcher::new(FetcherConfig::default().with_ip_concurrency(2))
            .with_handler("http", handler.clone());
        let spider = spider();

        fetcher
            .fetch(Request::get("http://127.0.0.1:8080/").unwrap(), spider.clone())
            .await
            .unwrap();

        assert_eq!(handler.calls()[0].slot.as_deref(), Some("127.0.0.1"));
        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_terminal() {
        let handler = Arc::new(MockHandler::new());
        let fetcher = Fetcher::new(FetcherConfig::default()).with_handler("https", handler.clone());
        let spider = spider();

        let error = fetcher
            .fetch(Request::get("ftp://example.com/file").unwrap(), spider.clone())
            .await
            .unwrap_err();

        assert!(matches!(error, Error::UnsupportedScheme(ref s) if s == "ftp"));
        assert_eq!(handler.call_count(), 0);
        assert_eq!(fetcher.active(), 0);
        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_goes_through_error_phase() {
        let stats = Arc::new(Stats::new());
        let mut middlewares = FetchMiddlewareManager::new();
        middlewares.register(RetryMiddleware::common().with_stats(stats.clone()));
        let fetcher = Fetcher::new(FetcherConfig::default())
            .with_handler("https", Arc::new(FailingHandler))
            .with_middlewares(middlewares)
            .with_stats(stats.clone());
        let spider = spider();

        let outcome = fetcher
            .fetch(Request::get("https://example.com/").unwrap(), spider.clone())
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Request(retry) => {
                assert_eq!(retry.meta_u32(meta::RETRY_TIMES), 1);
                assert_eq!(retry.download_slot(), Some("example.com"));
                assert!(retry.dont_filter);
            }
            FetchOutcome::Response(_) => panic!("expected a retry request"),
        }
        assert_eq!(stats.get("retry/count"), 1);
        assert_eq!(stats.get("fetcher/exception_count"), 1);

        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_slots_are_retired() {
        let handler = Arc::new(MockHandler::new());
        let fetcher = Fetcher::new(
            FetcherConfig::default().with_slot_gc_interval(Duration::from_millis(50)),
        )
        .with_handler("https", handler.clone());
        let spider = spider();
        fetcher.open(spider.as_ref()).await.unwrap();

        fetcher
            .fetch(Request::get("https://example.com/1").unwrap(), spider.clone())
            .await
            .unwrap();
        assert_eq!(fetcher.slot_count().await, 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(fetcher.slot_count().await, 0);

        // a retired key gets a fresh slot
        fetcher
            .fetch(Request::get("https://example.com/2").unwrap(), spider.clone())
            .await
            .unwrap();
        assert_eq!(handler.call_count(), 2);

        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_slot_is_not_retired() {
        let handler = Arc::new(MockHandler::new().with_latency(Duration::from_millis(300)));
        let fetcher = Arc::new(
            Fetcher::new(
                FetcherConfig::default().with_slot_gc_interval(Duration::from_millis(50)),
            )
            .with_handler("https", handler.clone()),
        );
        let spider = spider();
        fetcher.open(spider.as_ref()).await.unwrap();

        let pending = spawn_fetch(&fetcher, &spider, Request::get("https://example.com/").unwrap());
        sleep(Duration::from_millis(150)).await;
        assert_eq!(fetcher.slot_count().await, 1);

        assert_eq!(response(pending.await.unwrap().unwrap()).status, 200);
        fetcher.close(spider.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_in_flight_and_fails_queued() {
        let handler = Arc::new(MockHandler::new().with_latency(Duration::from_millis(100)));
        let fetcher = Arc::new(
            Fetcher::new(
                FetcherConfig::default()
                    .with_delay(Duration::from_secs(10))
                    .with_randomize_delay(false),
            )
            .with_handler("https", handler.clone()),
        );
        let spider = spider();
        fetcher.open(spider.as_ref()).await.unwrap();

        let first = spawn_fetch(&fetcher, &spider, Request::get("https://example.com/1").unwrap());
        let queued = spawn_fetch(&fetcher, &spider, Request::get("https://example.com/2").unwrap());
        sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.call_count(), 1);

        fetcher.close(spider.as_ref()).await.unwrap();
        assert_eq!(fetcher.slot_count().await, 0);

        assert!(first.await.unwrap().is_ok());
        assert!(queued.await.unwrap().unwrap_err().is_spider_closed());
        assert_eq!(fetcher.active(), 0);

        // nothing is dispatched once closed
        let error = fetcher
            .fetch(Request::get("https://example.com/3").unwrap(), spider.clone())
            .await
            .unwrap_err();
        assert!(error.is_spider_closed());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.call_count(), 1);
    }
}
