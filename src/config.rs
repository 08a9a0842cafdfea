use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            base_url: None,
        }
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn default_model() -> String {
    "llama-3.3-70b-versatile".into()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = ChatError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "file" => Ok(StorageBackend::File),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(ChatError::Config(format!(
                "unknown storage backend `{other}` (expected sqlite, file or memory)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Directory used by the file backend.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_url: default_database_url(),
            path: default_storage_path(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:chatbot.db".into()
}

fn default_storage_path() -> String {
    "checkpoints".into()
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_search_base_url")]
    pub search_base_url: String,
    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,
    #[serde(default = "default_alphavantage_base_url")]
    pub alphavantage_base_url: String,
    #[serde(default)]
    pub alphavantage_api_key: Option<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_base_url: default_search_base_url(),
            search_max_results: default_search_max_results(),
            alphavantage_base_url: default_alphavantage_base_url(),
            alphavantage_api_key: None,
            timeout_secs: default_tool_timeout(),
        }
    }
}

impl std::fmt::Debug for ToolsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsConfig")
            .field("search_base_url", &self.search_base_url)
            .field("search_max_results", &self.search_max_results)
            .field("alphavantage_base_url", &self.alphavantage_base_url)
            .field(
                "alphavantage_api_key",
                &self.alphavantage_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_search_base_url() -> String {
    "https://html.duckduckgo.com".into()
}

fn default_search_max_results() -> usize {
    5
}

fn default_alphavantage_base_url() -> String {
    "https://www.alphavantage.co".into()
}

fn default_tool_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_steps: default_max_steps(),
        }
    }
}

fn default_max_steps() -> usize {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|err| ChatError::Config(format!("Failed to parse configuration: {err}")))?;
        Ok(cfg)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_overrides(|key| env::var(key).ok())?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| env::var(key).ok())?;
        Ok(cfg)
    }

    /// Apply environment-style overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("GROQ_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(model) = lookup("TOOLCHAT_MODEL") {
            self.model.model = model;
        }
        if let Some(base_url) = lookup("TOOLCHAT_MODEL_BASE_URL") {
            self.model.base_url = Some(base_url);
        }
        if let Some(key) = lookup("ALPHAVANTAGE_API_KEY") {
            self.tools.alphavantage_api_key = Some(key);
        }
        if let Some(backend) = lookup("TOOLCHAT_STORAGE_BACKEND") {
            self.storage.backend = backend.parse()?;
        }
        if let Some(url) = lookup("TOOLCHAT_DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(path) = lookup("TOOLCHAT_STORAGE_PATH") {
            self.storage.path = path;
        }
        if let Some(steps) = lookup("TOOLCHAT_MAX_STEPS") {
            self.agent.max_steps = steps
                .parse::<usize>()
                .ok()
                .filter(|steps| *steps > 0)
                .ok_or_else(|| {
                    ChatError::Config(format!("TOOLCHAT_MAX_STEPS must be a positive integer, got `{steps}`"))
                })?;
        }
        if let Some(prompt) = lookup("TOOLCHAT_SYSTEM_PROMPT") {
            self.agent.system_prompt = Some(prompt);
        }
        if let Some(filter) = lookup("TOOLCHAT_LOG") {
            self.logging.filter = filter;
        }
        if let Some(json) = lookup("TOOLCHAT_LOG_JSON") {
            if let Ok(parsed) = json.parse::<bool>() {
                self.logging.json = parsed;
            }
        }
        Ok(())
    }
}
