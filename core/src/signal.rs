use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::item::Item;
use crate::request::Request;
use crate::response::Response;

/// Lifecycle and progress events published by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Sent when the crawler starts
    CrawlerStarted,
    /// Sent when the crawler stops
    CrawlerStopped,
    /// Sent when the engine pauses
    EnginePaused,
    /// Sent when the engine resumes
    EngineResumed,
    /// Sent when the spider opens
    SpiderOpened,
    /// Sent when the spider closes
    SpiderClosed,
    /// Sent when no work is queued or in flight
    SpiderIdle,
    /// Sent when processing a request fails
    SpiderError,
    /// Sent before a request is handed to the scheduler
    RequestScheduled,
    /// Sent when the scheduler rejects a request
    RequestDropped,
    /// Sent after a response is received
    ResponseReceived,
    /// Sent after an item passes the pipelines
    ItemScraped,
    /// Sent when a pipeline drops an item
    ItemDropped,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::CrawlerStarted => write!(f, "crawler_started"),
            Signal::CrawlerStopped => write!(f, "crawler_stopped"),
            Signal::EnginePaused => write!(f, "engine_paused"),
            Signal::EngineResumed => write!(f, "engine_resumed"),
            Signal::SpiderOpened => write!(f, "spider_opened"),
            Signal::SpiderClosed => write!(f, "spider_closed"),
            Signal::SpiderIdle => write!(f, "spider_idle"),
            Signal::SpiderError => write!(f, "spider_error"),
            Signal::RequestScheduled => write!(f, "request_scheduled"),
            Signal::RequestDropped => write!(f, "request_dropped"),
            Signal::ResponseReceived => write!(f, "response_received"),
            Signal::ItemScraped => write!(f, "item_scraped"),
            Signal::ItemDropped => write!(f, "item_dropped"),
        }
    }
}

/// Signal arguments
#[derive(Debug, Clone)]
pub enum SignalArgs {
    /// No arguments
    None,
    /// Spider name
    Spider(String),
    /// Request related
    Request(Box<Request>),
    /// Response related, with the originating request linked
    Response(Box<Response>),
    /// Item and the response it was extracted from
    Item {
        item: Box<Item>,
        response: Option<Box<Response>>,
    },
    /// Error message and the URL that caused it
    Error { message: String, url: Option<String> },
    /// Custom arguments
    Custom(serde_json::Value),
}

/// Signal handler type
pub type SignalHandler = Box<dyn Fn(SignalArgs) -> Result<()> + Send + Sync + 'static>;

/// Dispatches signals to connected handlers.
///
/// One manager is created per engine and handed to it at construction.
pub struct SignalManager {
    handlers: Arc<RwLock<HashMap<Signal, Vec<SignalHandler>>>>,
}

impl SignalManager {
    /// Create a new signal manager
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Connect signal handler
    pub async fn connect<F>(&self, signal: Signal, handler: F) -> Result<()>
    where
        F: Fn(SignalArgs) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(signal)
            .or_insert_with(Vec::new)
            .push(Box::new(handler));
        Ok(())
    }

    /// Send signal, stopping at the first handler error
    pub async fn send(&self, signal: Signal, args: SignalArgs) -> Result<()> {
        let handlers = self.handlers.read().await;
        if let Some(handlers) = handlers.get(&signal) {
            for handler in handlers {
                handler(args.clone())?;
            }
        }
        Ok(())
    }

    /// Send signal to every handler, logging handler errors instead of returning them
    pub async fn send_catch_log(&self, signal: Signal, args: SignalArgs) {
        let handlers = self.handlers.read().await;
        if let Some(handlers) = handlers.get(&signal) {
            for handler in handlers {
                if let Err(e) = handler(args.clone()) {
                    log::error!("Error sending signal {}: {}", signal, e);
                }
            }
        }
    }

    /// Disconnect all handlers for a specific signal
    pub async fn disconnect(&self, signal: Signal) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.remove(&signal);
        Ok(())
    }

    /// Disconnect all signal handlers
    pub async fn disconnect_all(&self) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.clear();
        Ok(())
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}
