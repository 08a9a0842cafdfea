//! Durable per-thread checkpoints of the conversation loop.
//!
//! A [`Checkpoint`] is everything needed to pick a thread up again: the full
//! message sequence and the [`LoopPosition`] the loop had reached when it
//! last committed. Stores keep only the latest checkpoint per thread id.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::message::{Message, ToolCallRequest};

/// Where the conversation loop stands for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPosition {
    AwaitingModel,
    AwaitingTools,
    Done,
}

impl LoopPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopPosition::AwaitingModel => "awaiting_model",
            LoopPosition::AwaitingTools => "awaiting_tools",
            LoopPosition::Done => "done",
        }
    }
}

impl std::str::FromStr for LoopPosition {
    type Err = ChatError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "awaiting_model" => Ok(LoopPosition::AwaitingModel),
            "awaiting_tools" => Ok(LoopPosition::AwaitingTools),
            "done" => Ok(LoopPosition::Done),
            other => Err(ChatError::Storage(format!("unknown loop position `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: Uuid,
    /// Number of commits made for this thread.
    pub step: u64,
    pub position: LoopPosition,
    pub messages: Vec<Message>,
}

impl Checkpoint {
    /// An empty thread that has not been committed yet.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id: Uuid::nil(),
            step: 0,
            position: LoopPosition::Done,
            messages: Vec::new(),
        }
    }

    /// Move to `position` and stamp a fresh checkpoint id for the next commit.
    pub fn advance(&mut self, position: LoopPosition) {
        self.position = position;
        self.step += 1;
        self.checkpoint_id = Uuid::new_v4();
    }

    /// Tool calls of the latest AI message that have no result yet.
    pub fn pending_tool_calls(&self) -> Vec<ToolCallRequest> {
        let Some(index) = self
            .messages
            .iter()
            .rposition(|msg| matches!(msg, Message::Ai { .. }))
        else {
            return Vec::new();
        };
        let answered: HashSet<&str> = self.messages[index + 1..]
            .iter()
            .filter_map(|msg| match msg {
                Message::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        self.messages[index]
            .tool_calls()
            .iter()
            .filter(|call| !answered.contains(call.id.as_str()))
            .cloned()
            .collect()
    }

    /// Content of the final AI message once the turn is done.
    pub fn last_answer(&self) -> Option<String> {
        if self.position != LoopPosition::Done {
            return None;
        }
        match self.messages.last() {
            Some(Message::Ai {
                content,
                tool_calls,
            }) if tool_calls.is_empty() => Some(content.clone()),
            _ => None,
        }
    }
}

/// Persistence contract for loop checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Atomically replace the stored checkpoint for `checkpoint.thread_id`.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>>;
    async fn list_thread_ids(&self) -> Result<BTreeSet<String>>;
    async fn delete(&self, thread_id: &str) -> Result<()>;
}

/// Thread ids known to `store`. Enumeration faults yield an empty set.
pub async fn list_threads(store: &dyn CheckpointStore) -> BTreeSet<String> {
    match store.list_thread_ids().await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(error = %err, "failed to enumerate threads; reporting none");
            BTreeSet::new()
        }
    }
}

/// Volatile store; state is lost on exit.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.thread_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(thread_id).cloned())
    }

    async fn list_thread_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.checkpoints.read().await.keys().cloned().collect())
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        self.checkpoints.write().await.remove(thread_id);
        Ok(())
    }
}

/// One JSON document per thread inside a directory.
///
/// Files are named after the SHA-256 of the thread id, so any id fits the
/// file-name limit. The id itself is read back from the document.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

#[derive(Deserialize)]
struct StoredThreadId {
    thread_id: String,
}

impl FileCheckpointStore {
    const EXTENSION: &'static str = ".json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, thread_id: &str) -> PathBuf {
        let digest = Sha256::digest(thread_id.as_bytes());
        self.dir.join(format!("{digest:x}{}", Self::EXTENSION))
    }

    async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(|err| {
            ChatError::Storage(format!("failed creating `{}`: {err}", self.dir.display()))
        })?;

        let target = self.path_for(&checkpoint.thread_id);
        let tmp = target.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let serialized = serde_json::to_vec(checkpoint)?;
        let written = match Self::write_synced(&tmp, &serialized).await {
            Ok(()) => fs::rename(&tmp, &target).await.map_err(|err| {
                ChatError::Storage(format!("failed to move `{}` into place: {err}", tmp.display()))
            }),
            Err(err) => Err(ChatError::Storage(format!("failed to persist checkpoint: {err}"))),
        };
        if written.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        written
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(thread_id);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ChatError::Storage(format!(
                    "failed to read checkpoint `{}`: {err}",
                    path.display()
                )))
            }
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&raw)
            .map_err(|err| ChatError::Storage(format!("invalid checkpoint `{}`: {err}", path.display())))?;
        if checkpoint.thread_id != thread_id {
            return Err(ChatError::Storage(format!(
                "checkpoint `{}` belongs to thread `{}`",
                path.display(),
                checkpoint.thread_id
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn list_thread_ids(&self) -> Result<BTreeSet<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(ChatError::Storage(format!(
                    "failed to list `{}`: {err}",
                    self.dir.display()
                )))
            }
        };

        let mut ids = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(Self::EXTENSION))
            {
                continue;
            }
            let stored = fs::read(&path)
                .await
                .map_err(|err| err.to_string())
                .and_then(|raw| {
                    serde_json::from_slice::<StoredThreadId>(&raw).map_err(|err| err.to_string())
                });
            match stored {
                Ok(stored) => {
                    ids.insert(stored.thread_id);
                }
                Err(err) => warn!(file = %path.display(), error = %err, "skipping unreadable checkpoint file"),
            }
        }
        Ok(ids)
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        fs::remove_file(self.path_for(thread_id))
            .await
            .or_else(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(err)
                }
            })
            .map_err(|err| ChatError::Storage(format!("failed deleting `{thread_id}`: {err}")))
    }
}

#[cfg(feature = "persistence")]
pub use sqlite::SqliteCheckpointStore;

#[cfg(feature = "persistence")]
mod sqlite {
    use std::collections::BTreeSet;
    use std::str::FromStr;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::{Row, SqlitePool};
    use uuid::Uuid;

    use super::{Checkpoint, CheckpointStore, LoopPosition};
    use crate::error::{ChatError, Result};

    /// SQLite-backed store; one row per thread.
    pub struct SqliteCheckpointStore {
        pool: SqlitePool,
    }

    impl SqliteCheckpointStore {
        const INIT_STATEMENT: &'static str = r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT PRIMARY KEY,
                checkpoint_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                position TEXT NOT NULL,
                messages TEXT NOT NULL
            )
        "#;

        const UPSERT_STATEMENT: &'static str = r#"
            INSERT INTO checkpoints (thread_id, checkpoint_id, step, position, messages)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET
                checkpoint_id = excluded.checkpoint_id,
                step = excluded.step,
                position = excluded.position,
                messages = excluded.messages
        "#;

        pub async fn connect(connection_url: impl AsRef<str>) -> Result<Self> {
            let url = connection_url.as_ref();
            let options = SqliteConnectOptions::from_str(url)
                .map_err(|err| ChatError::Storage(format!("invalid SQLite url `{url}`: {err}")))?
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .map_err(|err| {
                    ChatError::Storage(format!("failed connecting to SQLite backend `{url}`: {err}"))
                })?;

            sqlx::query(Self::INIT_STATEMENT)
                .execute(&pool)
                .await
                .map_err(|err| ChatError::Storage(format!("failed initializing schema: {err}")))?;

            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl CheckpointStore for SqliteCheckpointStore {
        async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
            let messages = serde_json::to_string(&checkpoint.messages)?;
            sqlx::query(Self::UPSERT_STATEMENT)
                .bind(&checkpoint.thread_id)
                .bind(checkpoint.checkpoint_id.to_string())
                .bind(checkpoint.step as i64)
                .bind(checkpoint.position.as_str())
                .bind(messages)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|err| ChatError::Storage(format!("failed writing checkpoint: {err}")))
        }

        async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
            let row = sqlx::query(
                "SELECT checkpoint_id, step, position, messages FROM checkpoints WHERE thread_id = ?",
            )
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| ChatError::Storage(format!("failed loading checkpoint: {err}")))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let decode = |err: sqlx::Error| {
                ChatError::Storage(format!("failed decoding checkpoint row: {err}"))
            };
            let checkpoint_id: String = row.try_get("checkpoint_id").map_err(decode)?;
            let step: i64 = row.try_get("step").map_err(decode)?;
            let position: String = row.try_get("position").map_err(decode)?;
            let messages: String = row.try_get("messages").map_err(decode)?;

            Ok(Some(Checkpoint {
                thread_id: thread_id.to_string(),
                checkpoint_id: Uuid::parse_str(&checkpoint_id)
                    .map_err(|err| ChatError::Storage(format!("invalid checkpoint id: {err}")))?,
                step: step.max(0) as u64,
                position: position.parse::<LoopPosition>()?,
                messages: serde_json::from_str(&messages)
                    .map_err(|err| ChatError::Storage(format!("invalid message payload: {err}")))?,
            }))
        }

        async fn list_thread_ids(&self) -> Result<BTreeSet<String>> {
            let rows = sqlx::query("SELECT DISTINCT thread_id FROM checkpoints")
                .fetch_all(&self.pool)
                .await
                .map_err(|err| ChatError::Storage(format!("failed listing threads: {err}")))?;
            rows.into_iter()
                .map(|row| {
                    row.try_get::<String, _>("thread_id")
                        .map_err(|err| ChatError::Storage(format!("failed decoding thread id: {err}")))
                })
                .collect()
        }

        async fn delete(&self, thread_id: &str) -> Result<()> {
            sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
                .bind(thread_id)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|err| ChatError::Storage(format!("failed deleting checkpoint: {err}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample(thread_id: &str) -> Checkpoint {
        let call = ToolCallRequest::new("call_1", "calculator", json!({"a": 12, "b": 4, "op": "div"}));
        let mut checkpoint = Checkpoint::new(thread_id);
        checkpoint.messages = vec![
            Message::human("What is 12 divided by 4?"),
            Message::ai_with_tool_calls("", vec![call]),
        ];
        checkpoint.advance(LoopPosition::AwaitingTools);
        checkpoint
    }

    async fn exercise(store: &dyn CheckpointStore) {
        assert!(store.list_thread_ids().await.unwrap().is_empty());
        assert!(store.load("t-1").await.unwrap().is_none());

        let mut checkpoint = sample("t-1");
        store.save(&checkpoint).await.unwrap();
        store.save(&sample("user/42 #2")).await.unwrap();
        let long = sample(&"会話".repeat(50));
        store.save(&long).await.unwrap();
        assert_eq!(store.load("t-1").await.unwrap(), Some(checkpoint.clone()));
        assert_eq!(store.load(&long.thread_id).await.unwrap(), Some(long.clone()));

        checkpoint.messages.push(Message::ai("3"));
        checkpoint.advance(LoopPosition::Done);
        store.save(&checkpoint).await.unwrap();
        let reloaded = store.load("t-1").await.unwrap().unwrap();
        assert_eq!(reloaded.step, 2);
        assert_eq!(reloaded.position, LoopPosition::Done);
        assert_eq!(reloaded.messages, checkpoint.messages);

        let ids = store.list_thread_ids().await.unwrap();
        assert_eq!(
            ids,
            BTreeSet::from(["t-1".to_string(), "user/42 #2".to_string(), long.thread_id.clone()])
        );
        assert_eq!(store.list_thread_ids().await.unwrap(), ids);

        store.delete("t-1").await.unwrap();
        store.delete("t-1").await.unwrap();
        assert!(store.load("t-1").await.unwrap().is_none());
        assert!(store.load(&long.thread_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        exercise(&MemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempdir().unwrap();
        exercise(&FileCheckpointStore::new(dir.path().join("threads"))).await;
    }

    #[tokio::test]
    async fn file_store_cleans_up_after_a_failed_write() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let checkpoint = sample("blocked");
        let target = store.path_for("blocked");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        assert!(matches!(store.save(&checkpoint).await, Err(ChatError::Storage(_))));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temporary files left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn file_store_skips_unreadable_documents() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&sample("kept")).await.unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"not json").unwrap();

        assert_eq!(
            store.list_thread_ids().await.unwrap(),
            BTreeSet::from(["kept".to_string()])
        );
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn sqlite_store_round_trip() {
        let store = SqliteCheckpointStore::connect("sqlite::memory:").await.unwrap();
        exercise(&store).await;
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn sqlite_store_survives_reconnect() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("chatbot.db").display());
        let checkpoint = sample("persisted");
        SqliteCheckpointStore::connect(&url)
            .await
            .unwrap()
            .save(&checkpoint)
            .await
            .unwrap();

        let reopened = SqliteCheckpointStore::connect(&url).await.unwrap();
        assert_eq!(reopened.load("persisted").await.unwrap(), Some(checkpoint));
    }

    struct BrokenStore;

    #[async_trait]
    impl CheckpointStore for BrokenStore {
        async fn save(&self, _: &Checkpoint) -> Result<()> {
            Err(ChatError::Storage("offline".into()))
        }
        async fn load(&self, _: &str) -> Result<Option<Checkpoint>> {
            Err(ChatError::Storage("offline".into()))
        }
        async fn list_thread_ids(&self) -> Result<BTreeSet<String>> {
            Err(ChatError::Storage("offline".into()))
        }
        async fn delete(&self, _: &str) -> Result<()> {
            Err(ChatError::Storage("offline".into()))
        }
    }

    #[tokio::test]
    async fn list_threads_swallows_faults() {
        assert!(list_threads(&BrokenStore).await.is_empty());
    }

    #[test]
    fn pending_calls_exclude_answered_ones() {
        let first = ToolCallRequest::new("call_a", "calculator", json!({}));
        let second = ToolCallRequest::new("call_b", "calculator", json!({}));
        let mut checkpoint = Checkpoint::new("t");
        checkpoint.messages = vec![
            Message::human("hi"),
            Message::ai_with_tool_calls("", vec![first.clone(), second.clone()]),
            Message::tool_result(&first, json!({"result": 1.0})),
        ];

        assert_eq!(checkpoint.pending_tool_calls(), vec![second]);
        assert_eq!(checkpoint.last_answer(), None);
    }

    #[test]
    fn last_answer_requires_done() {
        let mut checkpoint = Checkpoint::new("t");
        checkpoint.messages = vec![Message::human("hi"), Message::ai("hello")];
        checkpoint.advance(LoopPosition::AwaitingModel);
        assert_eq!(checkpoint.last_answer(), None);
        checkpoint.advance(LoopPosition::Done);
        assert_eq!(checkpoint.last_answer().as_deref(), Some("hello"));
    }
}
