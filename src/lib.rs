//! A checkpointed, tool-calling chat agent.
//!
//! The crate provides:
//! - A language model abstraction (`LanguageModel`) with a Groq client and a scripted `StubModel`.
//! - A closed set of built-in tools (calculator, DuckDuckGo search, Alpha Vantage quotes).
//! - An `Agent` that alternates between the model and the tools, committing a
//!   checkpoint after every step so any thread can be resumed after a failure or restart.
//! - Checkpoint stores backed by SQLite, JSON files or memory.

mod agent;
mod checkpoint;
mod config;
mod context;
mod error;
mod llm;
mod message;
mod telemetry;
mod tool;
pub mod tools;

pub use agent::{reasoning_step, Agent};
#[cfg(feature = "persistence")]
pub use checkpoint::SqliteCheckpointStore;
pub use checkpoint::{
    list_threads, Checkpoint, CheckpointStore, FileCheckpointStore, LoopPosition,
    MemoryCheckpointStore,
};
pub use config::{
    AgentConfig, AppConfig, LoggingConfig, ModelConfig, StorageBackend, StorageConfig, ToolsConfig,
};
pub use context::{open_store, AppContext, StorageStatus};
pub use error::{ChatError, Result};
pub use llm::{GroqClient, LanguageModel, ModelCompletion, StubModel};
pub use message::{Message, ToolCallRequest};
pub use telemetry::init_tracing;
pub use tool::{BuiltinTool, ToolDescription, ToolRegistry};
