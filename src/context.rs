//! Process-wide handles, built once at startup and owned by the agent.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::config::{AppConfig, StorageBackend, StorageConfig};
use crate::error::Result;
use crate::llm::{GroqClient, LanguageModel};
use crate::tool::ToolRegistry;

/// How conversation state is being kept for this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StorageStatus {
    /// The configured backend opened successfully.
    Durable { backend: StorageBackend },
    /// The in-memory backend was configured explicitly.
    Volatile,
    /// The configured backend failed; checkpoints live in memory only.
    Degraded { reason: String },
}

impl StorageStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, StorageStatus::Degraded { .. })
    }
}

pub struct AppContext {
    pub model: Arc<dyn LanguageModel>,
    pub tools: ToolRegistry,
    pub store: Arc<dyn CheckpointStore>,
    pub storage_status: StorageStatus,
}

impl AppContext {
    /// Assemble a context from ready-made parts.
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tools: ToolRegistry,
        store: Arc<dyn CheckpointStore>,
        storage_status: StorageStatus,
    ) -> Self {
        Self {
            model,
            tools,
            store,
            storage_status,
        }
    }

    /// Groq client, standard tools and the configured checkpoint store.
    pub async fn from_config(cfg: &AppConfig) -> Result<Self> {
        let model = Arc::new(GroqClient::from_config(&cfg.model)?);
        Self::with_model(cfg, model).await
    }

    /// Like [`AppContext::from_config`] but with a caller-supplied model.
    pub async fn with_model(cfg: &AppConfig, model: Arc<dyn LanguageModel>) -> Result<Self> {
        let tools = ToolRegistry::standard(&cfg.tools)?;
        let (store, storage_status) = open_store(&cfg.storage).await;
        Ok(Self::new(model, tools, store, storage_status))
    }
}

/// Open the configured backend, falling back to memory when it is unavailable.
pub async fn open_store(cfg: &StorageConfig) -> (Arc<dyn CheckpointStore>, StorageStatus) {
    match cfg.backend {
        StorageBackend::Memory => {
            let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
            (store, StorageStatus::Volatile)
        }
        StorageBackend::File => match tokio::fs::create_dir_all(&cfg.path).await {
            Ok(()) => {
                info!(path = %cfg.path, "using file checkpoint store");
                durable(Arc::new(FileCheckpointStore::new(&cfg.path)), StorageBackend::File)
            }
            Err(err) => degrade(format!("checkpoint directory `{}` unavailable: {err}", cfg.path)),
        },
        StorageBackend::Sqlite => open_sqlite(&cfg.database_url).await,
    }
}

#[cfg(feature = "persistence")]
async fn open_sqlite(database_url: &str) -> (Arc<dyn CheckpointStore>, StorageStatus) {
    match crate::checkpoint::SqliteCheckpointStore::connect(database_url).await {
        Ok(store) => {
            info!(url = %database_url, "using SQLite checkpoint store");
            durable(Arc::new(store), StorageBackend::Sqlite)
        }
        Err(err) => degrade(err.to_string()),
    }
}

#[cfg(not(feature = "persistence"))]
async fn open_sqlite(_database_url: &str) -> (Arc<dyn CheckpointStore>, StorageStatus) {
    degrade("SQLite support was not compiled in (enable the `persistence` feature)".into())
}

fn durable(
    store: Arc<dyn CheckpointStore>,
    backend: StorageBackend,
) -> (Arc<dyn CheckpointStore>, StorageStatus) {
    (store, StorageStatus::Durable { backend })
}

fn degrade(reason: String) -> (Arc<dyn CheckpointStore>, StorageStatus) {
    warn!(%reason, "checkpoint store unavailable; conversations will not survive a restart");
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    (store, StorageStatus::Degraded { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[tokio::test]
    async fn memory_backend_is_volatile() {
        let (store, status) = open_store(&StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        })
        .await;
        assert_eq!(status, StorageStatus::Volatile);
        assert!(store.list_thread_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_backend_creates_its_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("threads");
        let (_, status) = open_store(&StorageConfig {
            backend: StorageBackend::File,
            path: path.display().to_string(),
            ..StorageConfig::default()
        })
        .await;
        assert_eq!(
            status,
            StorageStatus::Durable {
                backend: StorageBackend::File
            }
        );
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn unusable_file_backend_degrades() {
        let blocker = NamedTempFile::new().unwrap();
        let (store, status) = open_store(&StorageConfig {
            backend: StorageBackend::File,
            path: blocker.path().join("threads").display().to_string(),
            ..StorageConfig::default()
        })
        .await;
        assert!(status.is_degraded());
        assert!(store.list_thread_ids().await.unwrap().is_empty());
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn unreachable_sqlite_degrades() {
        let dir = tempdir().unwrap();
        let url = format!(
            "sqlite://{}",
            dir.path().join("missing").join("chatbot.db").display()
        );
        let (_, status) = open_store(&StorageConfig {
            backend: StorageBackend::Sqlite,
            database_url: url,
            ..StorageConfig::default()
        })
        .await;
        assert!(status.is_degraded());
    }
}
