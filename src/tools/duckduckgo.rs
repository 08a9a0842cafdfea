//! DuckDuckGo search tool.
//!
//! Provides web search via DuckDuckGo's HTML interface and returns the
//! results as plain text for the model to read.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ChatError, Result};

const NO_RESULTS: &str = "No good DuckDuckGo Search Result was found";

/// DuckDuckGo search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub href: String,
    pub body: String,
}

/// Configuration for the DuckDuckGo tool
#[derive(Debug, Clone)]
pub struct DuckDuckGoConfig {
    pub base_url: String,
    pub max_results: usize,
    pub timeout_secs: u64,
}

impl Default for DuckDuckGoConfig {
    fn default() -> Self {
        Self {
            base_url: "https://html.duckduckgo.com".to_string(),
            max_results: 5,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchArgs {
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct DuckDuckGoSearchTool {
    http: reqwest::Client,
    config: DuckDuckGoConfig,
}

impl DuckDuckGoSearchTool {
    pub fn new(config: DuckDuckGoConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("Mozilla/5.0 (compatible; toolchat/0.1)")
            .build()
            .map_err(|e| ChatError::ToolInvocation {
                name: "duckduckgo_search".into(),
                source: Box::new(e),
            })?;
        Ok(Self { http, config })
    }

    pub fn name(&self) -> &str {
        "duckduckgo_search"
    }

    pub fn description(&self) -> &str {
        "Search the web using DuckDuckGo. Useful for current events and facts. Input should be a search query."
    }

    pub fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"}
            },
            "required": ["query"]
        })
    }

    pub async fn call(&self, args: WebSearchArgs) -> Result<Value> {
        let results = self.search(&args.query).await?;
        Ok(Value::String(render_results(&results)))
    }

    /// Perform a DuckDuckGo search using the HTML interface
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let url = format!(
            "{}/html/?q={}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(query)
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ChatError::ToolInvocation {
                name: self.name().into(),
                source: Box::new(e),
            })?;

        let html = response.text().await.map_err(|e| ChatError::ToolInvocation {
            name: self.name().into(),
            source: Box::new(e),
        })?;

        Ok(parse_duckduckgo_html(&html, self.config.max_results))
    }
}

fn render_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return NO_RESULTS.to_string();
    }
    results
        .iter()
        .map(|r| {
            if r.body.is_empty() {
                format!("{} ({})", r.title, r.href)
            } else {
                format!("{} ({}): {}", r.title, r.href, r.body)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse DuckDuckGo HTML response to extract search results
fn parse_duckduckgo_html(html: &str, max_results: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();

    // Results are in <a class="result__a" href="...">title</a>
    // followed by <a class="result__snippet" ...>body</a>
    for chunk in html.split("class=\"result__a\"").skip(1) {
        if results.len() >= max_results {
            break;
        }

        let href = chunk
            .split("href=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .map(resolve_redirect)
            .unwrap_or_default();

        let title = chunk
            .split_once('>')
            .and_then(|(_, rest)| rest.split("</a>").next())
            .map(strip_tags)
            .unwrap_or_default();

        let body = chunk
            .split("result__snippet")
            .nth(1)
            .and_then(|s| s.split_once('>'))
            .and_then(|(_, rest)| rest.split("</a>").next())
            .map(strip_tags)
            .unwrap_or_default();

        if !title.is_empty() && href.starts_with("http") {
            results.push(SearchResult { title, href, body });
        }
    }

    results
}

/// DuckDuckGo wraps links as `//duckduckgo.com/l/?uddg=<encoded target>&..`.
fn resolve_redirect(href: &str) -> String {
    let href = html_decode(href);
    if let Some((_, target)) = href.split_once("uddg=") {
        let target = target.split('&').next().unwrap_or_default();
        if let Ok(decoded) = urlencoding::decode(target) {
            return decoded.into_owned();
        }
    }
    href
}

fn strip_tags(fragment: &str) -> String {
    let mut text = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    html_decode(text.trim())
}

/// Simple HTML entity decoding
fn html_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
}
