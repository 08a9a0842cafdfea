//! Built-in tools the agent can call.
//!
//! - Calculator: add, sub, mul and div on two numbers
//! - DuckDuckGo: web search
//! - Stock quote: Alpha Vantage `GLOBAL_QUOTE` lookups

pub mod calculator;
pub mod duckduckgo;
pub mod stock;

pub use calculator::{calculate, CalculatorArgs, CalculatorTool};
pub use duckduckgo::{DuckDuckGoConfig, DuckDuckGoSearchTool, SearchResult, WebSearchArgs};
pub use stock::{StockQuoteArgs, StockQuoteConfig, StockQuoteTool};
