//! Middleware chains for the fetch and scrape phases.
//!
//! A middleware is a [`Stage`] that opts into individual phases by returning
//! itself from the matching capability accessor. Managers register each
//! stage into one list per capability, ordered forward for enter-side phases
//! (request, spider input) and in reverse for exit-side phases (response,
//! error, spider output, start requests).

pub mod chain;
pub mod fetch;
pub mod spider;

pub use chain::{Direction, MiddlewareChain, PhaseList, Stage};
pub use fetch::{
    DefaultHeadersMiddleware, ErrorProcessor, FetchMiddleware, FetchMiddlewareManager,
    FetchOutcome, RedirectMiddleware, RequestProcessor, ResponseProcessor, RetryMiddleware,
};
pub use spider::{
    DepthMiddleware, HttpErrorMiddleware, OffsiteMiddleware, SpiderErrorProcessor,
    SpiderInputProcessor, SpiderMiddleware, SpiderMiddlewareManager, SpiderOutputProcessor,
    StartRequestsProcessor, UrlFilterMiddleware,
};
