mod crawl_test;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arachne_core::signal::{Signal, SignalArgs, SignalManager};
use arachne_core::stats::Stats;
use arachne_downloader::{DownloadHandler, Fetcher};
use arachne_middleware::SpiderMiddlewareManager;
use arachne_pipeline::ItemPipelineManager;

use crate::utils::create_scheduler;
use crate::{Components, EngineConfig};

/// Engine configuration with short idle timings for tests
pub(crate) fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_idle_poll_interval(Duration::from_millis(10))
        .with_idle_timeout(Duration::from_millis(150))
        .with_log_stats_interval(None)
}

/// Components with `handler` serving both http and https and no middlewares
pub(crate) fn components_with(
    handler: Arc<dyn DownloadHandler>,
    config: &EngineConfig,
) -> Components {
    let stats = Arc::new(Stats::new());
    let fetcher = Fetcher::new(config.fetcher.clone())
        .with_handler("http", handler.clone())
        .with_handler("https", handler)
        .with_stats(stats.clone());

    Components {
        scheduler: create_scheduler(config, stats.clone()),
        fetcher,
        spider_middlewares: SpiderMiddlewareManager::new(),
        pipelines: ItemPipelineManager::new(),
        signals: Arc::new(SignalManager::new()),
        stats,
    }
}

/// Records signals as `(signal, detail)` pairs, where the detail is the
/// request URL, item JSON or error message carried by the signal
#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<(Signal, String)>>>);

impl EventLog {
    pub(crate) async fn attach(&self, signals: &SignalManager, watched: &[Signal]) {
        for signal in watched {
            let events = self.0.clone();
            let signal = *signal;
            signals
                .connect(signal, move |args| {
                    let detail = match args {
                        SignalArgs::Request(request) => request.url.to_string(),
                        SignalArgs::Response(response) => response.url.to_string(),
                        SignalArgs::Item { item, .. } => item.to_string(),
                        SignalArgs::Error { message, .. } => message,
                        SignalArgs::Spider(name) => name,
                        _ => String::new(),
                    };
                    events.lock().unwrap().push((signal, detail));
                    Ok(())
                })
                .await
                .unwrap();
        }
    }

    pub(crate) fn details(&self, signal: Signal) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == signal)
            .map(|(_, detail)| detail.clone())
            .collect()
    }

    pub(crate) fn count(&self, signal: Signal) -> usize {
        self.details(signal).len()
    }
}
