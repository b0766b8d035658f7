//! Per-thread FIFO of deferred follow-up prompts, used while a thread is
//! busy under queue-mode follow-ups. Entries live in memory only; the
//! matching user message row is persisted at enqueue time by the
//! orchestrator so the UI reflects it immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use foreman_types::QueuedMessage;

/// Depth plus a truncated preview of the next pending entry, emitted with
/// every queue-update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub next_preview: Option<String>,
}

#[derive(Clone, Default)]
pub struct FollowupQueue {
    inner: Arc<Mutex<HashMap<String, VecDeque<QueuedMessage>>>>,
}

impl FollowupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(
        &self,
        thread_id: &str,
        message: QueuedMessage,
        preview_len: usize,
    ) -> QueueSnapshot {
        let mut guard = self.inner.lock().await;
        let queue = guard.entry(thread_id.to_string()).or_default();
        queue.push_back(message);
        snapshot_of(queue, preview_len)
    }

    /// Remove one pending entry by id. `None` when the id is not queued.
    pub async fn cancel(
        &self,
        thread_id: &str,
        message_id: &str,
        preview_len: usize,
    ) -> Option<QueueSnapshot> {
        let mut guard = self.inner.lock().await;
        let queue = guard.get_mut(thread_id)?;
        let before = queue.len();
        queue.retain(|entry| entry.id != message_id);
        if queue.len() == before {
            return None;
        }
        let snapshot = snapshot_of(queue, preview_len);
        if queue.is_empty() {
            guard.remove(thread_id);
        }
        Some(snapshot)
    }

    /// Pop the oldest entry; the caller feeds it into the next run once the
    /// current one resolves.
    pub async fn take_next(&self, thread_id: &str) -> Option<QueuedMessage> {
        let mut guard = self.inner.lock().await;
        let queue = guard.get_mut(thread_id)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            guard.remove(thread_id);
        }
        next
    }

    pub async fn list(&self, thread_id: &str) -> Vec<QueuedMessage> {
        self.inner
            .lock()
            .await
            .get(thread_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn depth(&self, thread_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .get(thread_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub async fn clear(&self, thread_id: &str) {
        self.inner.lock().await.remove(thread_id);
    }
}

fn snapshot_of(queue: &VecDeque<QueuedMessage>, preview_len: usize) -> QueueSnapshot {
    QueueSnapshot {
        depth: queue.len(),
        next_preview: queue.front().map(|next| preview(&next.content, preview_len)),
    }
}

/// Char-safe truncation with an ellipsis marker.
pub fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut out: String = content.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = FollowupQueue::new();
        queue.push("t1", QueuedMessage::new("first"), 80).await;
        let snapshot = queue.push("t1", QueuedMessage::new("second"), 80).await;
        assert_eq!(snapshot.depth, 2);
        assert_eq!(snapshot.next_preview.as_deref(), Some("first"));

        assert_eq!(queue.take_next("t1").await.unwrap().content, "first");
        assert_eq!(queue.take_next("t1").await.unwrap().content, "second");
        assert!(queue.take_next("t1").await.is_none());
    }

    #[tokio::test]
    async fn cancel_removes_a_specific_entry() {
        let queue = FollowupQueue::new();
        let keep = QueuedMessage::new("keep me");
        let drop = QueuedMessage::new("drop me");
        queue.push("t1", keep.clone(), 80).await;
        queue.push("t1", drop.clone(), 80).await;

        let snapshot = queue.cancel("t1", &drop.id, 80).await.unwrap();
        assert_eq!(snapshot.depth, 1);
        assert_eq!(snapshot.next_preview.as_deref(), Some("keep me"));

        assert!(queue.cancel("t1", "no-such-id", 80).await.is_none());
    }

    #[tokio::test]
    async fn clear_empties_the_thread_queue() {
        let queue = FollowupQueue::new();
        queue.push("t1", QueuedMessage::new("a"), 80).await;
        queue.push("t2", QueuedMessage::new("b"), 80).await;
        queue.clear("t1").await;
        assert_eq!(queue.depth("t1").await, 0);
        assert_eq!(queue.depth("t2").await, 1);
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("short", 80), "short");
        assert_eq!(preview("héllo wörld", 5), "héllo…");
    }
}
