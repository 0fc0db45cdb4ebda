//! Per-conversation turn-state checkpointing.
//!
//! Checkpoints are JSON records written atomically (temp file + rename)
//! under `<root>/<conversation_id>/checkpoints/<turn_index>.json`. One
//! writer per conversation: concurrent turns in the same conversation
//! serialize on an async mutex. A failed rename surfaces a persistence
//! error and leaves the previous latest checkpoint intact.

use crate::error::{AssistantError, Result};
use crate::state::TurnState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One durable checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Conversation this checkpoint belongs to.
    pub conversation_id: String,
    /// Thread within the conversation.
    pub thread_id: String,
    /// Monotonic turn counter.
    pub turn_index: u64,
    /// The serialized turn state.
    pub state: TurnState,
    /// Write timestamp.
    pub created_time: DateTime<Utc>,
}

/// Durable checkpoint storage.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Atomically persist one turn's state.
    async fn put(
        &self,
        conversation_id: &str,
        thread_id: &str,
        turn_index: u64,
        state: &TurnState,
    ) -> Result<()>;

    /// The latest checkpoint for a conversation, if any exists.
    async fn get_latest(&self, conversation_id: &str) -> Result<Option<CheckpointRecord>>;

    /// All stored turn indices for a conversation, ascending.
    async fn list(&self, conversation_id: &str) -> Result<Vec<u64>>;
}

/// Filesystem-backed checkpointer.
pub struct FsCheckpointer {
    root: PathBuf,
    /// Checkpoints retained per conversation; the latest never pruned.
    keep: usize,
    /// Per-conversation writer locks.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FsCheckpointer {
    /// Create a checkpointer rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            root: root.into(),
            keep: keep.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn checkpoint_dir(&self, conversation_id: &str) -> PathBuf {
        self.root.join(conversation_id).join("checkpoints")
    }

    /// Remove checkpoints beyond the retention window, oldest first.
    async fn prune(&self, dir: &Path) {
        let Ok(mut indices) = read_indices(dir).await else {
            return;
        };
        indices.sort_unstable();
        while indices.len() > self.keep {
            let oldest = indices.remove(0);
            let path = dir.join(format!("{oldest}.json"));
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to prune checkpoint");
                return;
            }
        }
    }
}

#[async_trait]
impl Checkpointer for FsCheckpointer {
    async fn put(
        &self,
        conversation_id: &str,
        thread_id: &str,
        turn_index: u64,
        state: &TurnState,
    ) -> Result<()> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let dir = self.checkpoint_dir(conversation_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AssistantError::Persistence(format!("create {}: {e}", dir.display())))?;

        let record = CheckpointRecord {
            conversation_id: conversation_id.to_owned(),
            thread_id: thread_id.to_owned(),
            turn_index,
            state: state.clone(),
            created_time: Utc::now(),
        };
        let payload = serde_json::to_vec_pretty(&record)?;

        let final_path = dir.join(format!("{turn_index}.json"));
        let temp_path = dir.join(format!("{turn_index}.json.tmp"));
        tokio::fs::write(&temp_path, &payload).await.map_err(|e| {
            AssistantError::Persistence(format!("write {}: {e}", temp_path.display()))
        })?;
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            // The previous latest checkpoint is untouched; clean up the temp.
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(AssistantError::Persistence(format!(
                "rename {}: {e}",
                final_path.display()
            )));
        }
        debug!(conversation_id, turn_index, "checkpoint written");

        self.prune(&dir).await;
        Ok(())
    }

    async fn get_latest(&self, conversation_id: &str) -> Result<Option<CheckpointRecord>> {
        let dir = self.checkpoint_dir(conversation_id);
        let indices = match read_indices(&dir).await {
            Ok(i) => i,
            Err(_) => return Ok(None),
        };
        let Some(latest) = indices.into_iter().max() else {
            return Ok(None);
        };
        let path = dir.join(format!("{latest}.json"));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AssistantError::Persistence(format!("read {}: {e}", path.display())))?;
        let record: CheckpointRecord = serde_json::from_str(&raw)?;
        Ok(Some(record))
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<u64>> {
        let dir = self.checkpoint_dir(conversation_id);
        let mut indices = match read_indices(&dir).await {
            Ok(i) => i,
            Err(_) => return Ok(Vec::new()),
        };
        indices.sort_unstable();
        Ok(indices)
    }
}

/// Turn indices present in a checkpoint directory.
async fn read_indices(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut indices = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".json")
            && let Ok(index) = stem.parse::<u64>()
        {
            indices.push(index);
        }
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChatMessage;

    fn state_with(content: &str) -> TurnState {
        let mut state = TurnState::default();
        state.messages.push(ChatMessage::user(content));
        state
    }

    #[tokio::test]
    async fn put_then_get_latest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointer::new(dir.path(), 10);
        store.put("conv-1", "main", 0, &state_with("first")).await.unwrap();
        store.put("conv-1", "main", 1, &state_with("second")).await.unwrap();

        let latest = store.get_latest("conv-1").await.unwrap().unwrap();
        assert_eq!(latest.turn_index, 1);
        assert_eq!(latest.state.messages[0].content, "second");
        assert_eq!(latest.thread_id, "main");
    }

    #[tokio::test]
    async fn missing_conversation_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointer::new(dir.path(), 10);
        assert!(store.get_latest("ghost").await.unwrap().is_none());
        assert!(store.list("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_returns_sorted_indices() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointer::new(dir.path(), 10);
        for index in [2u64, 0, 1] {
            store.put("conv", "main", index, &state_with("x")).await.unwrap();
        }
        assert_eq!(store.list("conv").await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn prunes_old_checkpoints_but_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointer::new(dir.path(), 2);
        for index in 0..5u64 {
            store.put("conv", "main", index, &state_with("x")).await.unwrap();
        }
        let indices = store.list("conv").await.unwrap();
        assert_eq!(indices, vec![3, 4]);
        assert_eq!(store.get_latest("conv").await.unwrap().unwrap().turn_index, 4);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointer::new(dir.path(), 10);
        store.put("conv", "main", 0, &state_with("x")).await.unwrap();
        let checkpoint_dir = dir.path().join("conv").join("checkpoints");
        let mut entries = std::fs::read_dir(checkpoint_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        entries.sort();
        assert_eq!(entries, vec!["0.json"]);
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointer::new(dir.path(), 10);
        store.put("a", "main", 0, &state_with("alpha")).await.unwrap();
        store.put("b", "main", 7, &state_with("beta")).await.unwrap();
        assert_eq!(store.get_latest("a").await.unwrap().unwrap().turn_index, 0);
        assert_eq!(store.get_latest("b").await.unwrap().unwrap().turn_index, 7);
    }
}
