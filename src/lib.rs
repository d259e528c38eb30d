//! # Arachne
//!
//! A concurrent, rate-limited web crawling engine.
//!
//! ## Components
//!
//! - **Core**: requests, responses, items, the `Spider` trait, errors, stats and signals.
//! - **Middleware**: capability-based chains for the fetch and scrape phases.
//! - **Scheduler**: FIFO and priority queues behind a fingerprint duplicate filter.
//! - **Downloader**: the fetcher with per-host or per-IP slots, and the HTTP transport.
//! - **Pipeline**: item pipelines.
//! - **Engine**: the crawl orchestrator.
//! - **Settings**: file-based configuration mapped onto the component configs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use arachne::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     env_logger::init();
//!
//!     let spider = Arc::new(LinkSpider::new(
//!         "example",
//!         vec!["https://example.com".to_string()],
//!     )?);
//!
//!     let engine = Engine::new(spider, EngineConfig::default())?;
//!     let stats = engine.run().await?;
//!
//!     println!("Requests: {}", stats.request_count);
//!     println!("Items: {}", stats.item_count);
//!     Ok(())
//! }
//! ```

pub use arachne_core as core;
pub use arachne_downloader as downloader;
pub use arachne_engine as engine;
pub use arachne_middleware as middleware;
pub use arachne_pipeline as pipeline;
pub use arachne_scheduler as scheduler;

pub mod config_adapters;
pub mod link_spider;
pub mod settings;

/// Prelude module that re-exports commonly used types
pub mod prelude {
    pub use arachne_core::error::{Error, Result};
    pub use arachne_core::item::Item;
    pub use arachne_core::request::{Method, Request};
    pub use arachne_core::response::Response;
    pub use arachne_core::signal::{Signal, SignalArgs, SignalManager};
    pub use arachne_core::spider::{BasicSpider, CrawlResult, Spider};
    pub use arachne_core::stats::Stats;
    pub use arachne_downloader::{
        DownloadHandler, Fetcher, FetcherConfig, HttpDownloadHandler, HttpHandlerConfig,
    };
    pub use arachne_engine::{Components, Engine, EngineConfig, EngineStats, SchedulerType};
    pub use arachne_middleware::{
        DefaultHeadersMiddleware, DepthMiddleware, FetchMiddleware, HttpErrorMiddleware,
        OffsiteMiddleware, RedirectMiddleware, RetryMiddleware, SpiderMiddleware,
        UrlFilterMiddleware,
    };
    pub use arachne_pipeline::{
        FieldFilterPipeline, FilterPipeline, ItemPipeline, JsonLinesPipeline, LogPipeline,
    };
    pub use arachne_scheduler::{FifoScheduler, PriorityScheduler, Scheduler};

    pub use crate::link_spider::LinkSpider;
    pub use crate::settings::{Settings, SettingsError, SettingsFormat};
}
