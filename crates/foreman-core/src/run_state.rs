//! In-memory, invariant-bearing bookkeeping for each thread's runs.
//!
//! The registry is split into two scopes with different lifetimes, so the
//! preservation contract is enforced structurally:
//!
//! - [`RunScope`] is replaced wholesale at the start of every run.
//! - [`ThreadScope`] survives stop/resume and is removed only by full
//!   teardown — the tool-use dedup map must outlive runs so a resumed worker
//!   replaying an old tool use cannot create a duplicate row.
//!
//! The maps are intentionally unbounded for the life of the thread: bounding
//! them would reopen the duplicate-row window on long-lived sessions, so any
//! eviction policy is left to the embedder.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use foreman_types::WaitingReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPermission {
    pub tool_name: String,
}

/// State for the current run only.
#[derive(Debug, Default)]
struct RunScope {
    /// worker message id → durable assistant message id
    assistant_rows: HashMap<String, String>,
    result_received: bool,
    pending_input: Option<WaitingReason>,
    manually_stopped: bool,
}

/// State preserved across runs of the same thread.
#[derive(Debug, Default)]
struct ThreadScope {
    /// worker tool-use id → durable tool-call id
    recorded_tool_uses: HashMap<String, String>,
    pending_permission: Option<PendingPermission>,
}

#[derive(Debug, Default)]
struct ThreadRunState {
    run: RunScope,
    thread: ThreadScope,
}

/// Snapshot of the guard flags the status machine needs.
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    pub result_received: bool,
    pub manually_stopped: bool,
    pub pending_input: Option<WaitingReason>,
}

#[derive(Clone, Default)]
pub struct RunStateRegistry {
    inner: Arc<RwLock<HashMap<String, ThreadRunState>>>,
}

impl RunStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-run state ahead of a new run. Per-thread state (tool-use
    /// dedup, pending permission display state) is untouched.
    pub async fn clear_run_state(&self, thread_id: &str) {
        let mut guard = self.inner.write().await;
        guard.entry(thread_id.to_string()).or_default().run = RunScope::default();
    }

    /// Drop everything for the thread. Idempotent; safe on unknown ids.
    pub async fn cleanup_thread_state(&self, thread_id: &str) {
        self.inner.write().await.remove(thread_id);
    }

    pub async fn assistant_row(&self, thread_id: &str, worker_message_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(thread_id)
            .and_then(|state| state.run.assistant_rows.get(worker_message_id).cloned())
    }

    pub async fn map_assistant_row(
        &self,
        thread_id: &str,
        worker_message_id: &str,
        message_id: &str,
    ) {
        let mut guard = self.inner.write().await;
        guard
            .entry(thread_id.to_string())
            .or_default()
            .run
            .assistant_rows
            .insert(worker_message_id.to_string(), message_id.to_string());
    }

    pub async fn tool_call_for(&self, thread_id: &str, tool_use_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(thread_id)
            .and_then(|state| state.thread.recorded_tool_uses.get(tool_use_id).cloned())
    }

    pub async fn record_tool_use(&self, thread_id: &str, tool_use_id: &str, tool_call_id: &str) {
        let mut guard = self.inner.write().await;
        guard
            .entry(thread_id.to_string())
            .or_default()
            .thread
            .recorded_tool_uses
            .insert(tool_use_id.to_string(), tool_call_id.to_string());
    }

    pub async fn set_pending_input(&self, thread_id: &str, reason: WaitingReason) {
        let mut guard = self.inner.write().await;
        guard
            .entry(thread_id.to_string())
            .or_default()
            .run
            .pending_input = Some(reason);
    }

    /// Returns true the first time, false on every duplicate — the caller
    /// checks this before any terminal side effect.
    pub async fn mark_result_received(&self, thread_id: &str) -> bool {
        let mut guard = self.inner.write().await;
        let run = &mut guard.entry(thread_id.to_string()).or_default().run;
        if run.result_received {
            return false;
        }
        run.result_received = true;
        true
    }

    pub async fn mark_manually_stopped(&self, thread_id: &str) {
        let mut guard = self.inner.write().await;
        guard
            .entry(thread_id.to_string())
            .or_default()
            .run
            .manually_stopped = true;
    }

    pub async fn run_flags(&self, thread_id: &str) -> RunFlags {
        self.inner
            .read()
            .await
            .get(thread_id)
            .map(|state| RunFlags {
                result_received: state.run.result_received,
                manually_stopped: state.run.manually_stopped,
                pending_input: state.run.pending_input,
            })
            .unwrap_or_default()
    }

    pub async fn set_pending_permission(&self, thread_id: &str, pending: PendingPermission) {
        let mut guard = self.inner.write().await;
        guard
            .entry(thread_id.to_string())
            .or_default()
            .thread
            .pending_permission = Some(pending);
    }

    pub async fn pending_permission(&self, thread_id: &str) -> Option<PendingPermission> {
        self.inner
            .read()
            .await
            .get(thread_id)
            .and_then(|state| state.thread.pending_permission.clone())
    }
}
