//! In-process transports for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use arachne_core::async_trait;
use arachne_core::error::{Error, ErrorContext, Result};
use arachne_core::request::Request;
use arachne_core::response::Response;

use crate::DownloadHandler;

/// One transfer observed by a [`MockHandler`]
#[derive(Debug, Clone)]
pub struct MockCall {
    pub url: String,
    pub slot: Option<String>,
    pub at: Instant,
}

/// Returns canned responses and records every call
pub struct MockHandler {
    /// Responses to return for specific URLs
    responses: HashMap<String, (u16, HashMap<String, String>, Vec<u8>)>,
    latency: Duration,
    calls: Mutex<Vec<MockCall>>,
}

impl MockHandler {
    /// Create a new mock handler
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Add a response for a specific URL
    pub fn add_response(&mut self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.responses
            .insert(url.to_string(), (status, HashMap::new(), body.into()));
    }

    /// Add a response with headers for a specific URL
    pub fn add_response_with_headers(
        &mut self,
        url: &str,
        status: u16,
        headers: HashMap<String, String>,
        body: impl Into<Vec<u8>>,
    ) {
        self.responses
            .insert(url.to_string(), (status, headers, body.into()));
    }

    /// Sleep this long inside every transfer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Calls seen so far, in call order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadHandler for MockHandler {
    async fn download(&self, request: Request) -> Result<Response> {
        let url = request.url.to_string();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                url: url.clone(),
                slot: request.download_slot().map(str::to_string),
                at: Instant::now(),
            });
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.responses.get(&url) {
            Some((status, headers, body)) => Ok(Response::new(
                request.url,
                *status,
                headers.clone(),
                body.clone(),
            )),
            None => {
                let mut headers = HashMap::new();
                headers.insert("Content-Type".to_string(), "text/html".to_string());
                let body = format!(
                    "<html><body><h1>Mock response for {}</h1></body></html>",
                    url
                )
                .into_bytes();
                Ok(Response::new(request.url, 200, headers, body))
            }
        }
    }
}

/// A handler whose every transfer fails with a transport error
pub struct FailingHandler;

#[async_trait]
impl DownloadHandler for FailingHandler {
    async fn download(&self, request: Request) -> Result<Response> {
        Err(Error::transport(
            "Mock transport failure",
            ErrorContext::new()
                .with_url(request.url.as_str())
                .with_component("FailingHandler"),
        ))
    }
}
