use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::ParseError;

/// Error context information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// URL associated with the error
    pub url: Option<String>,

    /// HTTP status code (if applicable)
    pub status_code: Option<u16>,

    /// Spider name
    pub spider_name: Option<String>,

    /// Component where the error occurred
    pub component: Option<String>,

    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the status code
    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Set the spider name
    pub fn with_spider_name(mut self, spider_name: impl Into<String>) -> Self {
        self.spider_name = Some(spider_name.into());
        self
    }

    /// Set the component
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref url) = self.url {
            parts.push(format!("url={}", url));
        }

        if let Some(status_code) = self.status_code {
            parts.push(format!("status={}", status_code));
        }

        if let Some(ref spider_name) = self.spider_name {
            parts.push(format!("spider={}", spider_name));
        }

        if let Some(ref component) = self.component {
            parts.push(format!("component={}", component));
        }

        let mut metadata: Vec<_> = self.metadata.iter().collect();
        metadata.sort();
        for (key, value) in metadata {
            parts.push(format!("{}={}", key, value));
        }

        if parts.is_empty() {
            Ok(())
        } else {
            write!(f, "({})", parts.join(", "))
        }
    }
}

/// Error types for the arachne crawler
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Error when parsing a URL
    #[error("URL parse error: {0}")]
    UrlParse(#[from] ParseError),

    /// The transport failed to complete the transfer
    #[error("Transport error: {message} {context}")]
    Transport {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },

    /// No download handler is registered for the URL scheme
    #[error("Unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    /// A response arrived with a status the crawl does not accept
    #[error("HTTP status {status} {context}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Error context
        context: ErrorContext,
    },

    /// Error when parsing response content
    #[error("Parse error: {message} {context}")]
    Parse {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },

    /// Error in an item pipeline
    #[error("Item error: {message} {context}")]
    Item {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },

    /// Error in the scheduler or duplicate filter
    #[error("Scheduler error: {message} {context}")]
    Scheduler {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },

    /// Error raised by a middleware stage
    #[error("Middleware error: {message} {context}")]
    Middleware {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },

    /// I/O error
    #[error("IO error: {message}")]
    Io {
        /// Error message
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serde {
        /// Error message
        message: String,
    },

    /// The request should be silently discarded
    #[error("Request ignored")]
    IgnoreRequest,

    /// The spider is shutting down
    #[error("Spider closed")]
    SpiderClosed,

    /// An item pipeline deliberately discarded an item
    #[error("Item dropped: {0}")]
    ItemDropped(String),

    /// Other error
    #[error("{message} {context}")]
    Other {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde {
            message: err.to_string(),
        }
    }
}

/// Result type for arachne operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a transport error
    pub fn transport(message: impl Into<String>, context: ErrorContext) -> Self {
        Error::Transport {
            message: message.into(),
            context,
        }
    }

    /// Create an HTTP status error
    pub fn http(status: u16, context: ErrorContext) -> Self {
        Error::Http { status, context }
    }

    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Error::Parse {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create an item error
    pub fn item(message: impl Into<String>) -> Self {
        Error::Item {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a scheduler error
    pub fn scheduler(message: impl Into<String>) -> Self {
        Error::Scheduler {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a middleware error
    pub fn middleware(message: impl Into<String>) -> Self {
        Error::Middleware {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create an uncategorized error
    pub fn other(message: impl Into<String>) -> Self {
        Error::Other {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Stable name of the error variant, used as a stats key suffix
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UrlParse(_) => "UrlParse",
            Error::Transport { .. } => "Transport",
            Error::UnsupportedScheme(_) => "UnsupportedScheme",
            Error::Http { .. } => "Http",
            Error::Parse { .. } => "Parse",
            Error::Item { .. } => "Item",
            Error::Scheduler { .. } => "Scheduler",
            Error::Middleware { .. } => "Middleware",
            Error::Io { .. } => "Io",
            Error::Serde { .. } => "Serde",
            Error::IgnoreRequest => "IgnoreRequest",
            Error::SpiderClosed => "SpiderClosed",
            Error::ItemDropped(_) => "ItemDropped",
            Error::Other { .. } => "Other",
        }
    }

    /// Get the context attached to this error, if any
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Transport { context, .. }
            | Error::Http { context, .. }
            | Error::Parse { context, .. }
            | Error::Item { context, .. }
            | Error::Scheduler { context, .. }
            | Error::Middleware { context, .. }
            | Error::Other { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether this is the "ignore this request" condition
    pub fn is_ignore(&self) -> bool {
        matches!(self, Error::IgnoreRequest)
    }

    /// Whether this signals an orderly shutdown in progress
    pub fn is_spider_closed(&self) -> bool {
        matches!(self, Error::SpiderClosed)
    }

    /// Whether an item pipeline dropped the item on purpose
    pub fn is_item_dropped(&self) -> bool {
        matches!(self, Error::ItemDropped(_))
    }

    /// Whether retrying the same request could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Http { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}
