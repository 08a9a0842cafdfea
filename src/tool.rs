use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ToolsConfig;
use crate::error::{ChatError, Result};
use crate::message::{Message, ToolCallRequest};
use crate::tools::{
    CalculatorArgs, CalculatorTool, DuckDuckGoConfig, DuckDuckGoSearchTool, StockQuoteArgs,
    StockQuoteConfig, StockQuoteTool, WebSearchArgs,
};

/// Name, description and JSON schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Option<Value>,
}

/// The closed set of tools the agent can dispatch to.
#[derive(Debug, Clone)]
pub enum BuiltinTool {
    Calculator(CalculatorTool),
    WebSearch(DuckDuckGoSearchTool),
    StockQuote(StockQuoteTool),
}

impl BuiltinTool {
    pub fn name(&self) -> &str {
        match self {
            BuiltinTool::Calculator(tool) => tool.name(),
            BuiltinTool::WebSearch(tool) => tool.name(),
            BuiltinTool::StockQuote(tool) => tool.name(),
        }
    }

    pub fn describe(&self) -> ToolDescription {
        let (description, parameters) = match self {
            BuiltinTool::Calculator(tool) => (tool.description(), tool.parameters()),
            BuiltinTool::WebSearch(tool) => (tool.description(), tool.parameters()),
            BuiltinTool::StockQuote(tool) => (tool.description(), tool.parameters()),
        };
        ToolDescription {
            name: self.name().to_string(),
            description: description.to_string(),
            parameters: Some(parameters),
        }
    }

    /// Decode `arguments` into the tool's typed input and run it.
    ///
    /// Malformed arguments come back as an `{"error": ..}` payload. Only
    /// transport failures of the remote tools surface as `Err`.
    pub async fn call(&self, arguments: Value) -> Result<Value> {
        match self {
            BuiltinTool::Calculator(tool) => match decode::<CalculatorArgs>(tool.name(), arguments) {
                Ok(args) => Ok(tool.call(args)),
                Err(payload) => Ok(payload),
            },
            BuiltinTool::WebSearch(tool) => match decode::<WebSearchArgs>(tool.name(), arguments) {
                Ok(args) => tool.call(args).await,
                Err(payload) => Ok(payload),
            },
            BuiltinTool::StockQuote(tool) => match decode::<StockQuoteArgs>(tool.name(), arguments) {
                Ok(args) => tool.call(args).await,
                Err(payload) => Ok(payload),
            },
        }
    }
}

fn decode<T: DeserializeOwned>(tool: &str, arguments: Value) -> std::result::Result<T, Value> {
    // Some providers send the arguments as a JSON-encoded string.
    let arguments = match arguments {
        Value::Null => json!({}),
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    };
    serde_json::from_value(arguments)
        .map_err(|err| json!({ "error": format!("Invalid arguments for `{tool}`: {err}") }))
}

#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<BuiltinTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Calculator, DuckDuckGo search and Alpha Vantage quotes.
    pub fn standard(config: &ToolsConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(BuiltinTool::WebSearch(DuckDuckGoSearchTool::new(
            DuckDuckGoConfig {
                base_url: config.search_base_url.clone(),
                max_results: config.search_max_results,
                timeout_secs: config.timeout_secs,
            },
        )?));
        registry.register(BuiltinTool::StockQuote(StockQuoteTool::new(StockQuoteConfig {
            base_url: config.alphavantage_base_url.clone(),
            api_key: config.alphavantage_api_key.clone(),
            timeout_secs: config.timeout_secs,
        })?));
        registry.register(BuiltinTool::Calculator(CalculatorTool));
        Ok(registry)
    }

    /// Adds a tool, replacing any tool already registered under the same name.
    pub fn register(&mut self, tool: BuiltinTool) {
        match self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            Some(slot) => *slot = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinTool> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name().to_string()).collect()
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        self.tools.iter().map(BuiltinTool::describe).collect()
    }

    /// Run a single request. Unknown tools produce an error payload.
    pub async fn call(&self, request: &ToolCallRequest) -> Result<Value> {
        let Some(tool) = self.get(&request.name) else {
            let err = ChatError::ToolNotFound(request.name.clone());
            warn!(tool = %request.name, call_id = %request.id, "model requested an unknown tool");
            return Ok(json!({ "error": err.to_string() }));
        };
        debug!(tool = %request.name, call_id = %request.id, "invoking tool");
        tool.call(request.arguments.clone()).await
    }

    /// Run every request of one AI message and return one tool result per
    /// request, in request order. Requests run concurrently; a transport
    /// fault in any of them fails the whole batch.
    pub async fn execute(&self, requests: &[ToolCallRequest]) -> Result<Vec<Message>> {
        let outputs = join_all(requests.iter().map(|request| self.call(request))).await;
        requests
            .iter()
            .zip(outputs)
            .map(|(request, output)| output.map(|payload| Message::tool_result(request, payload)))
            .collect()
    }
}
