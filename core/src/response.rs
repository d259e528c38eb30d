use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

use crate::error::{Error, Result};
use crate::request::Request;

/// Represents an HTTP response received by the crawler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The URL of the response
    pub url: Url,

    /// The HTTP status code
    pub status: u16,

    /// HTTP headers received, with lower-case names
    pub headers: HashMap<String, String>,

    /// Response body
    pub body: Vec<u8>,

    /// The request that generated this response, linked by the engine
    #[serde(default)]
    pub request: Option<Box<Request>>,
}

impl Response {
    /// Create a new response. The originating request is not linked yet.
    pub fn new(url: Url, status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            url,
            status,
            headers,
            body,
            request: None,
        }
    }

    /// Link the response to the request it answers
    pub fn attach_request(&mut self, request: Request) {
        self.request = Some(Box::new(request));
    }

    /// Get the response body as a string
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.clone())
            .map_err(|e| Error::parse(format!("Failed to decode UTF-8: {}", e)))
    }

    /// Parse the response body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Look up a header by name, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// Check if the response was successful (status code 200-299)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if the response is a redirect
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// Get the redirect URL if this response is a redirect
    pub fn redirect_url(&self) -> Option<Result<Url>> {
        if !self.is_redirect() {
            return None;
        }

        self.header("location").map(|location| self.urljoin(location))
    }

    /// Resolve a possibly relative link against the response URL
    pub fn urljoin(&self, link: &str) -> Result<Url> {
        self.url.join(link).map_err(Error::UrlParse)
    }
}
