use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument};

use crate::checkpoint::{self, Checkpoint, LoopPosition};
use crate::config::AppConfig;
use crate::context::{AppContext, StorageStatus};
use crate::error::{ChatError, Result};
use crate::llm::LanguageModel;
use crate::message::Message;
use crate::tool::ToolRegistry;

/// Ask the model for the next AI message given the conversation so far.
pub async fn reasoning_step(
    model: &dyn LanguageModel,
    system_prompt: Option<&str>,
    messages: &[Message],
    tools: &ToolRegistry,
) -> Result<Message> {
    let completion = model
        .complete_chat(system_prompt, messages, &tools.describe())
        .await?;
    Ok(completion.into_message())
}

/// Checkpointed conversation loop alternating between the model and tools.
///
/// Every transition is committed to the checkpoint store before the loop
/// moves on, so a failed or interrupted call can be picked up again with
/// [`Agent::resume`]. Calls for the same thread id run one at a time.
pub struct Agent {
    context: AppContext,
    system_prompt: Option<String>,
    max_steps: usize,
    thread_locks: ThreadLocks,
}

type ThreadLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// A handle on one thread's mutex. The map entry is removed when the last
/// handle for that thread is dropped.
struct ThreadSlot<'a> {
    locks: &'a ThreadLocks,
    thread_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for ThreadSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map plus ours.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.thread_id);
        }
    }
}

impl Agent {
    pub const DEFAULT_MAX_STEPS: usize = 25;

    pub fn new(context: AppContext) -> Self {
        Self {
            context,
            system_prompt: None,
            max_steps: Self::DEFAULT_MAX_STEPS,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn from_config(cfg: &AppConfig) -> Result<Self> {
        let context = AppContext::from_config(cfg).await?;
        Ok(Self::new(context).with_agent_config(cfg))
    }

    /// Apply the `[agent]` section of `cfg`.
    pub fn with_agent_config(mut self, cfg: &AppConfig) -> Self {
        if let Some(prompt) = &cfg.agent.system_prompt {
            self = self.with_system_prompt(prompt.clone());
        }
        self.with_max_steps(cfg.agent.max_steps)
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Maximum number of model calls made by one `run_turn` or `resume`.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn storage_status(&self) -> &StorageStatus {
        &self.context.storage_status
    }

    /// Send `user_text` on `thread_id` and drive the loop until the model
    /// answers without requesting tools.
    #[instrument(skip(self, user_text))]
    pub async fn run_turn(&self, thread_id: &str, user_text: impl Into<String>) -> Result<String> {
        let slot = self.thread_slot(thread_id);
        let _guard = slot.lock.lock().await;

        let mut checkpoint = self
            .context
            .store
            .load(thread_id)
            .await?
            .unwrap_or_else(|| Checkpoint::new(thread_id));

        if checkpoint.position == LoopPosition::AwaitingTools {
            info!("settling tool calls left pending by an interrupted turn");
            self.tool_step(&mut checkpoint).await?;
        }

        checkpoint.messages.push(Message::human(user_text));
        self.commit(&mut checkpoint, LoopPosition::AwaitingModel).await?;
        self.drive(&mut checkpoint).await
    }

    /// Continue `thread_id` from its last committed position.
    ///
    /// Returns `None` for a thread the store has never seen. A thread that
    /// already finished its turn returns the last answer without calling the
    /// model or any tool.
    #[instrument(skip(self))]
    pub async fn resume(&self, thread_id: &str) -> Result<Option<String>> {
        let slot = self.thread_slot(thread_id);
        let _guard = slot.lock.lock().await;

        let Some(mut checkpoint) = self.context.store.load(thread_id).await? else {
            return Ok(None);
        };
        debug!(position = checkpoint.position.as_str(), step = checkpoint.step, "resuming thread");
        self.drive(&mut checkpoint).await.map(Some)
    }

    /// Stored messages of `thread_id`; empty for unknown threads.
    pub async fn conversation(&self, thread_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .context
            .store
            .load(thread_id)
            .await?
            .map(|checkpoint| checkpoint.messages)
            .unwrap_or_default())
    }

    /// Thread ids present in the checkpoint store. Never fails.
    pub async fn list_threads(&self) -> BTreeSet<String> {
        checkpoint::list_threads(self.context.store.as_ref()).await
    }

    async fn drive(&self, checkpoint: &mut Checkpoint) -> Result<String> {
        let mut model_calls = 0;
        loop {
            match checkpoint.position {
                LoopPosition::Done => return Ok(checkpoint.last_answer().unwrap_or_default()),
                LoopPosition::AwaitingTools => self.tool_step(checkpoint).await?,
                LoopPosition::AwaitingModel => {
                    if model_calls >= self.max_steps {
                        return Err(ChatError::StepLimit {
                            thread_id: checkpoint.thread_id.clone(),
                            limit: self.max_steps,
                        });
                    }
                    model_calls += 1;
                    let message = reasoning_step(
                        self.context.model.as_ref(),
                        self.system_prompt.as_deref(),
                        &checkpoint.messages,
                        &self.context.tools,
                    )
                    .await?;
                    let next = if message.tool_calls().is_empty() {
                        LoopPosition::Done
                    } else {
                        LoopPosition::AwaitingTools
                    };
                    checkpoint.messages.push(message);
                    self.commit(checkpoint, next).await?;
                }
            }
        }
    }

    #[instrument(skip_all, fields(thread_id = %checkpoint.thread_id))]
    async fn tool_step(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        let pending = checkpoint.pending_tool_calls();
        debug!(count = pending.len(), "executing tool calls");
        let results = self.context.tools.execute(&pending).await?;
        checkpoint.messages.extend(results);
        self.commit(checkpoint, LoopPosition::AwaitingModel).await
    }

    async fn commit(&self, checkpoint: &mut Checkpoint, position: LoopPosition) -> Result<()> {
        checkpoint.advance(position);
        self.context.store.save(checkpoint).await?;
        debug!(
            thread_id = %checkpoint.thread_id,
            step = checkpoint.step,
            position = position.as_str(),
            "checkpoint committed"
        );
        Ok(())
    }

    fn thread_slot(&self, thread_id: &str) -> ThreadSlot<'_> {
        let mut locks = self
            .thread_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = locks.entry(thread_id.to_string()).or_default().clone();
        ThreadSlot {
            locks: &self.thread_locks,
            thread_id: thread_id.to_string(),
            lock,
        }
    }
}
