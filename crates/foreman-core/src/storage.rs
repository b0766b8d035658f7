//! Durable record interface and the JSON-file store behind it.
//!
//! The engine only ever talks to [`ThreadStore`]; the schema/query machinery
//! behind it is a collaborator's concern. [`JsonStore`] is the in-tree
//! implementation: maps held in memory behind `RwLock`s, serialized to JSON
//! files under a base directory on every write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

use foreman_types::{Message, Thread, ThreadPatch, ToolCall};

#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn insert_thread(&self, thread: Thread) -> anyhow::Result<()>;
    async fn get_thread(&self, id: &str) -> Option<Thread>;
    /// Apply a partial update; returns the updated thread, or `None` for an
    /// unknown id.
    async fn update_thread(&self, id: &str, patch: ThreadPatch) -> anyhow::Result<Option<Thread>>;

    async fn insert_message(&self, message: Message) -> anyhow::Result<()>;
    /// Rewrite a message's cumulative content in place.
    async fn update_message(&self, id: &str, content: String) -> anyhow::Result<Option<Message>>;
    async fn list_messages(&self, thread_id: &str) -> Vec<Message>;

    async fn insert_tool_call(&self, call: ToolCall) -> anyhow::Result<()>;
    async fn update_tool_call_output(
        &self,
        id: &str,
        output: Value,
    ) -> anyhow::Result<Option<ToolCall>>;
    async fn get_tool_call(&self, id: &str) -> Option<ToolCall>;
    async fn find_tool_call(&self, message_id: &str, name: &str, input: &Value) -> Option<ToolCall>;
    async fn list_tool_calls(&self, message_id: &str) -> Vec<ToolCall>;
}

/// Insertion-ordered wrapper; `seq` is assigned by the store and keeps
/// listing order stable when timestamps tie.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sequenced<T> {
    seq: u64,
    #[serde(flatten)]
    record: T,
}

pub struct JsonStore {
    base: PathBuf,
    threads: RwLock<HashMap<String, Thread>>,
    messages: RwLock<HashMap<String, Sequenced<Message>>>,
    tool_calls: RwLock<HashMap<String, Sequenced<ToolCall>>>,
    seq: AtomicU64,
}

impl JsonStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;

        let threads = read_map::<Thread>(&base.join("threads.json")).await;
        let messages = read_map::<Sequenced<Message>>(&base.join("messages.json")).await;
        let tool_calls = read_map::<Sequenced<ToolCall>>(&base.join("tool_calls.json")).await;

        let max_seq = messages
            .values()
            .map(|row| row.seq)
            .chain(tool_calls.values().map(|row| row.seq))
            .max()
            .unwrap_or(0);

        Ok(Self {
            base,
            threads: RwLock::new(threads),
            messages: RwLock::new(messages),
            tool_calls: RwLock::new(tool_calls),
            seq: AtomicU64::new(max_seq + 1),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.threads.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.base.join("threads.json"), payload).await?;
        let messages_snapshot = self.messages.read().await.clone();
        let messages_payload = serde_json::to_string_pretty(&messages_snapshot)?;
        fs::write(self.base.join("messages.json"), messages_payload).await?;
        let calls_snapshot = self.tool_calls.read().await.clone();
        let calls_payload = serde_json::to_string_pretty(&calls_snapshot)?;
        fs::write(self.base.join("tool_calls.json"), calls_payload).await?;
        Ok(())
    }
}

async fn read_map<T: serde::de::DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

#[async_trait]
impl ThreadStore for JsonStore {
    async fn insert_thread(&self, thread: Thread) -> anyhow::Result<()> {
        self.threads
            .write()
            .await
            .insert(thread.id.clone(), thread);
        self.flush().await
    }

    async fn get_thread(&self, id: &str) -> Option<Thread> {
        self.threads.read().await.get(id).cloned()
    }

    async fn update_thread(&self, id: &str, patch: ThreadPatch) -> anyhow::Result<Option<Thread>> {
        let updated = {
            let mut guard = self.threads.write().await;
            match guard.get_mut(id) {
                Some(thread) => {
                    patch.apply_to(thread);
                    Some(thread.clone())
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.flush().await?;
        }
        Ok(updated)
    }

    async fn insert_message(&self, message: Message) -> anyhow::Result<()> {
        let seq = self.next_seq();
        self.messages.write().await.insert(
            message.id.clone(),
            Sequenced {
                seq,
                record: message,
            },
        );
        self.flush().await
    }

    async fn update_message(&self, id: &str, content: String) -> anyhow::Result<Option<Message>> {
        let updated = {
            let mut guard = self.messages.write().await;
            match guard.get_mut(id) {
                Some(row) => {
                    row.record.content = content;
                    Some(row.record.clone())
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.flush().await?;
        }
        Ok(updated)
    }

    async fn list_messages(&self, thread_id: &str) -> Vec<Message> {
        let guard = self.messages.read().await;
        let mut rows: Vec<&Sequenced<Message>> = guard
            .values()
            .filter(|row| row.record.thread_id == thread_id)
            .collect();
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(|row| row.record.clone()).collect()
    }

    async fn insert_tool_call(&self, call: ToolCall) -> anyhow::Result<()> {
        let seq = self.next_seq();
        self.tool_calls
            .write()
            .await
            .insert(call.id.clone(), Sequenced { seq, record: call });
        self.flush().await
    }

    async fn update_tool_call_output(
        &self,
        id: &str,
        output: Value,
    ) -> anyhow::Result<Option<ToolCall>> {
        let updated = {
            let mut guard = self.tool_calls.write().await;
            match guard.get_mut(id) {
                Some(row) => {
                    row.record.output = Some(output);
                    Some(row.record.clone())
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.flush().await?;
        }
        Ok(updated)
    }

    async fn get_tool_call(&self, id: &str) -> Option<ToolCall> {
        self.tool_calls
            .read()
            .await
            .get(id)
            .map(|row| row.record.clone())
    }

    async fn find_tool_call(&self, message_id: &str, name: &str, input: &Value) -> Option<ToolCall> {
        let guard = self.tool_calls.read().await;
        let mut rows: Vec<&Sequenced<ToolCall>> = guard
            .values()
            .filter(|row| {
                row.record.message_id == message_id
                    && row.record.name == name
                    && row.record.input == *input
            })
            .collect();
        rows.sort_by_key(|row| row.seq);
        rows.first().map(|row| row.record.clone())
    }

    async fn list_tool_calls(&self, message_id: &str) -> Vec<ToolCall> {
        let guard = self.tool_calls.read().await;
        let mut rows: Vec<&Sequenced<ToolCall>> = guard
            .values()
            .filter(|row| row.record.message_id == message_id)
            .collect();
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(|row| row.record.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::{MessageRole, ThreadStatus};
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, JsonStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path()).await.expect("store");
        (dir, store)
    }

    #[tokio::test]
    async fn thread_patch_roundtrip() {
        let (_dir, store) = store().await;
        let thread = Thread::new("p1", "u1", "/tmp/w");
        let id = thread.id.clone();
        store.insert_thread(thread).await.unwrap();

        let patch = ThreadPatch {
            status: Some(ThreadStatus::Running),
            resume_token: Some("sess-1".to_string()),
            ..Default::default()
        };
        let updated = store.update_thread(&id, patch).await.unwrap().unwrap();
        assert_eq!(updated.status, ThreadStatus::Running);
        assert_eq!(updated.resume_token.as_deref(), Some("sess-1"));

        assert!(store
            .update_thread("missing", ThreadPatch::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn messages_list_in_insertion_order() {
        let (_dir, store) = store().await;
        for i in 0..5 {
            store
                .insert_message(Message::new("t1", MessageRole::Assistant, format!("m{i}")))
                .await
                .unwrap();
        }
        store
            .insert_message(Message::new("t2", MessageRole::User, "other thread"))
            .await
            .unwrap();

        let contents: Vec<String> = store
            .list_messages("t1")
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn tool_call_output_update_and_find() {
        let (_dir, store) = store().await;
        let call = ToolCall::new("m1", "Read", json!({"path": "a.rs"}));
        let id = call.id.clone();
        store.insert_tool_call(call).await.unwrap();

        let found = store
            .find_tool_call("m1", "Read", &json!({"path": "a.rs"}))
            .await
            .unwrap();
        assert_eq!(found.id, id);
        assert!(found.output.is_none());

        let updated = store
            .update_tool_call_output(&id, json!("file contents"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.output, Some(json!("file contents")));
    }

    #[tokio::test]
    async fn state_survives_reload_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let thread_id = {
            let store = JsonStore::new(dir.path()).await.unwrap();
            let thread = Thread::new("p1", "u1", "/tmp/w");
            let id = thread.id.clone();
            store.insert_thread(thread).await.unwrap();
            store
                .insert_message(Message::new(&id, MessageRole::User, "hello"))
                .await
                .unwrap();
            id
        };

        let reloaded = JsonStore::new(dir.path()).await.unwrap();
        assert!(reloaded.get_thread(&thread_id).await.is_some());
        let messages = reloaded.list_messages(&thread_id).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }
}
