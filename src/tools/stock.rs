//! Stock quote tool.
//!
//! Fetches the latest quote for a ticker symbol from Alpha Vantage's
//! `GLOBAL_QUOTE` endpoint. The response is handed to the model as-is.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ChatError, Result};

/// Configuration for the stock quote tool
#[derive(Clone)]
pub struct StockQuoteConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for StockQuoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.alphavantage.co".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for StockQuoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockQuoteConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockQuoteArgs {
    pub symbol: String,
}

#[derive(Debug, Clone)]
pub struct StockQuoteTool {
    http: reqwest::Client,
    config: StockQuoteConfig,
}

impl StockQuoteTool {
    pub fn new(config: StockQuoteConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::ToolInvocation {
                name: "get_stock_price".into(),
                source: Box::new(e),
            })?;
        if config.api_key.is_none() {
            tracing::warn!("no Alpha Vantage API key configured; quote lookups will be rejected upstream");
        }
        Ok(Self { http, config })
    }

    pub fn name(&self) -> &str {
        "get_stock_price"
    }

    pub fn description(&self) -> &str {
        "Fetch the latest stock price for a given symbol (e.g. 'AAPL', 'TSLA') using Alpha Vantage."
    }

    pub fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string", "description": "Ticker symbol, e.g. AAPL"}
            },
            "required": ["symbol"]
        })
    }

    pub async fn call(&self, args: StockQuoteArgs) -> Result<Value> {
        let url = format!("{}/query", self.config.base_url.trim_end_matches('/'));
        let mut params = vec![("function", "GLOBAL_QUOTE"), ("symbol", args.symbol.as_str())];
        if let Some(ref api_key) = self.config.api_key {
            params.push(("apikey", api_key.as_str()));
        }

        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| ChatError::ToolInvocation {
                name: self.name().into(),
                source: Box::new(e),
            })?;

        let body = response.text().await.map_err(|e| ChatError::ToolInvocation {
            name: self.name().into(),
            source: Box::new(e),
        })?;

        Ok(serde_json::from_str(&body).unwrap_or_else(|_| json!({ "text": body })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn tool_for(server: &MockServer, api_key: Option<&str>) -> StockQuoteTool {
        StockQuoteTool::new(StockQuoteConfig {
            base_url: server.base_url(),
            api_key: api_key.map(str::to_string),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn passes_the_quote_through() {
        let server = MockServer::start_async().await;
        let quote = json!({
            "Global Quote": {
                "01. symbol": "AAPL",
                "05. price": "189.9800"
            }
        });
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/query")
                    .query_param("function", "GLOBAL_QUOTE")
                    .query_param("symbol", "AAPL")
                    .query_param("apikey", "secret");
                then.status(200).json_body(quote.clone());
            })
            .await;

        let output = tool_for(&server, Some("secret"))
            .call(StockQuoteArgs {
                symbol: "AAPL".into(),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(output, quote);
    }

    #[tokio::test]
    async fn wraps_non_json_bodies() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/query");
                then.status(200).body("rate limited, try later");
            })
            .await;

        let output = tool_for(&server, None)
            .call(StockQuoteArgs {
                symbol: "TSLA".into(),
            })
            .await
            .unwrap();

        assert_eq!(output, json!({"text": "rate limited, try later"}));
    }

    #[test]
    fn debug_output_hides_the_api_key() {
        let config = StockQuoteConfig {
            api_key: Some("secret".into()),
            ..StockQuoteConfig::default()
        };
        assert!(!format!("{config:?}").contains("secret"));
    }
}
