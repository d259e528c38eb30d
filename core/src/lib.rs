pub mod error;
pub mod item;
pub mod request;
pub mod response;
pub mod signal;
pub mod spider;
pub mod stats;

pub use error::{Error, ErrorContext, Result};
pub use item::Item;
pub use request::{Callback, Method, Request, RequestCallback};
pub use response::Response;
pub use signal::{Signal, SignalArgs, SignalManager};
pub use spider::{BasicSpider, CrawlResult, Spider};
pub use stats::{Stats, StatsSnapshot};

/// Re-export commonly used crates
pub use async_trait::async_trait;
pub use futures;
pub use serde;
pub use serde_json;
pub use url;
