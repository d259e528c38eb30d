//! A spider that follows every link on a page and records a summary item for it

use arachne_core::async_trait;
use arachne_core::error::{Error, Result};
use arachne_core::item::Item;
use arachne_core::request::Request;
use arachne_core::response::Response;
use arachne_core::spider::{CrawlResult, Spider};
use log::debug;
use regex::Regex;
use serde_json::Value;

/// Follows `href` attributes found by a plain pattern scan and emits one
/// `{url, status, title}` item per page
pub struct LinkSpider {
    name: String,
    start_urls: Vec<String>,
    allowed_domains: Vec<String>,
    href: Regex,
    title: Regex,
}

impl LinkSpider {
    /// Create a spider whose allowed domains default to the hosts of the start URLs
    pub fn new<S: Into<String>>(name: S, start_urls: Vec<String>) -> Result<Self> {
        let compile =
            |pattern: &str| Regex::new(pattern).map_err(|e| Error::other(format!("Invalid regex: {}", e)));

        let allowed_domains = start_urls
            .iter()
            .filter_map(|u| url::Url::parse(u).ok())
            .filter_map(|u| u.host_str().map(str::to_string))
            .collect();

        Ok(Self {
            name: name.into(),
            start_urls,
            allowed_domains,
            href: compile(r#"(?i)href\s*=\s*["']([^"']+)["']"#)?,
            title: compile(r"(?is)<title[^>]*>(.*?)</title>")?,
        })
    }

    /// Restrict follow-up requests to these domains instead of the start URL hosts
    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = domains;
        self
    }

    fn title(&self, body: &str) -> Value {
        self.title
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty())
            .map(Value::String)
            .unwrap_or(Value::Null)
    }

    fn links(&self, response: &Response, body: &str) -> Vec<Request> {
        let mut requests = Vec::new();
        for captures in self.href.captures_iter(body) {
            let link = match captures.get(1) {
                Some(link) => link.as_str().trim(),
                None => continue,
            };
            if link.starts_with('#') {
                continue;
            }
            let mut url = match response.urljoin(link) {
                Ok(url) => url,
                Err(e) => {
                    debug!("Skipping link {} on {}: {}", link, response.url, e);
                    continue;
                }
            };
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            url.set_fragment(None);
            if let Ok(request) = Request::get(url) {
                requests.push(request.with_header("Referer", response.url.as_str()));
            }
        }
        requests
    }
}

#[async_trait]
impl Spider for LinkSpider {
    fn name(&self) -> &str {
        &self.name
    }

    fn allowed_domains(&self) -> Vec<String> {
        self.allowed_domains.clone()
    }

    fn start_urls(&self) -> Vec<String> {
        self.start_urls.clone()
    }

    async fn parse(&self, response: Response) -> Result<CrawlResult> {
        let body = String::from_utf8_lossy(&response.body);

        let mut result = CrawlResult::new();
        result.add_item(
            Item::new()
                .with("url", response.url.as_str())
                .with("status", response.status)
                .with("title", self.title(&body)),
        );
        for request in self.links(&response, &body) {
            result.add_request(request);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use url::Url;

    fn page(url: &str, body: &str) -> Response {
        Response::new(
            Url::parse(url).unwrap(),
            200,
            HashMap::new(),
            body.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn test_parse_extracts_title_and_links() {
        let spider = LinkSpider::new("links", vec!["https://example.com/".to_string()]).unwrap();
        let body = r##"
            <html><head><title>
                Example   Domain
            </title></head>
            <body>
                <a href="/about">About</a>
                <a HREF='docs/intro.html#top'>Docs</a>
                <a href="#section">Jump</a>
                <a href="mailto:team@example.com">Mail</a>
                <a href="https://other.org/">Other</a>
            </body></html>
        "##;

        let result = spider
            .parse(page("https://example.com/guide/", body))
            .await
            .unwrap();

        assert_eq!(result.items.len(), 1);
        let item = &result.items[0];
        assert_eq!(item.get("title"), Some(&Value::from("Example Domain")));
        assert_eq!(item.get("status"), Some(&Value::from(200)));

        let urls: Vec<String> = result.requests.iter().map(|r| r.url.to_string()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/about",
                "https://example.com/guide/docs/intro.html",
                "https://other.org/",
            ]
        );
        assert!(result
            .requests
            .iter()
            .all(|r| r.referer() == Some("https://example.com/guide/")));
    }

    #[tokio::test]
    async fn test_missing_title_is_null() {
        let spider = LinkSpider::new("links", vec![]).unwrap();
        let result = spider
            .parse(page("https://example.com/", "<p>no title</p>"))
            .await
            .unwrap();
        assert_eq!(result.items[0].get("title"), Some(&Value::Null));
        assert!(result.requests.is_empty());
    }

    #[test]
    fn test_allowed_domains_default_to_start_hosts() {
        let spider = LinkSpider::new(
            "links",
            vec![
                "https://example.com/a".to_string(),
                "http://docs.example.org/".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(spider.allowed_domains(), vec!["example.com", "docs.example.org"]);

        let spider = spider.with_allowed_domains(vec!["example.net".to_string()]);
        assert_eq!(spider.allowed_domains(), vec!["example.net"]);
    }
}
