use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{new_id, now_ms};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Idle,
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Stopped,
    Interrupted,
}

impl ThreadStatus {
    /// Terminal for the current run. `running`/`waiting` can recur on a
    /// later start; the four terminals only change through a new start.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ThreadStatus::Completed
                | ThreadStatus::Failed
                | ThreadStatus::Stopped
                | ThreadStatus::Interrupted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Idle => "idle",
            ThreadStatus::Pending => "pending",
            ThreadStatus::Running => "running",
            ThreadStatus::Waiting => "waiting",
            ThreadStatus::Completed => "completed",
            ThreadStatus::Failed => "failed",
            ThreadStatus::Stopped => "stopped",
            ThreadStatus::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitingReason {
    Question,
    Plan,
    Permission,
}

impl WaitingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitingReason::Question => "question",
            WaitingReason::Plan => "plan",
            WaitingReason::Permission => "permission",
        }
    }
}

/// One conversation thread. Mutated only by the orchestrator and the
/// protocol translator; deletion is an external concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(rename = "ownerID")]
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub directory: String,
    pub status: ThreadStatus,
    #[serde(rename = "waitingReason", skip_serializing_if = "Option::is_none")]
    pub waiting_reason: Option<WaitingReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(rename = "resumeToken", skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(rename = "permissionMode", skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "totalCostUsd", default)]
    pub total_cost_usd: f64,
    #[serde(rename = "completedAtMs", skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    #[serde(rename = "createdAtMs")]
    pub created_at_ms: u64,
    #[serde(rename = "updatedAtMs")]
    pub updated_at_ms: u64,
}

impl Thread {
    pub fn new(
        project_id: impl Into<String>,
        owner_id: impl Into<String>,
        directory: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            project_id: project_id.into(),
            owner_id: owner_id.into(),
            title: None,
            directory: directory.into(),
            status: ThreadStatus::Idle,
            waiting_reason: None,
            stage: None,
            resume_token: None,
            model: None,
            permission_mode: None,
            provider: None,
            total_cost_usd: 0.0,
            completed_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

/// Partial thread update. `None` fields are left untouched; the two
/// nullable fields the engine must be able to reset carry explicit
/// clear flags.
#[derive(Debug, Clone, Default)]
pub struct ThreadPatch {
    pub title: Option<String>,
    pub status: Option<ThreadStatus>,
    pub waiting_reason: Option<WaitingReason>,
    pub clear_waiting_reason: bool,
    pub stage: Option<String>,
    pub resume_token: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub provider: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub completed_at_ms: Option<u64>,
    pub clear_completed_at: bool,
}

impl ThreadPatch {
    pub fn apply_to(&self, thread: &mut Thread) {
        if let Some(title) = &self.title {
            thread.title = Some(title.clone());
        }
        if let Some(status) = self.status {
            thread.status = status;
        }
        if self.clear_waiting_reason {
            thread.waiting_reason = None;
        }
        if let Some(reason) = self.waiting_reason {
            thread.waiting_reason = Some(reason);
        }
        if let Some(stage) = &self.stage {
            thread.stage = Some(stage.clone());
        }
        if let Some(token) = &self.resume_token {
            thread.resume_token = Some(token.clone());
        }
        if let Some(model) = &self.model {
            thread.model = Some(model.clone());
        }
        if let Some(mode) = &self.permission_mode {
            thread.permission_mode = Some(mode.clone());
        }
        if let Some(provider) = &self.provider {
            thread.provider = Some(provider.clone());
        }
        if let Some(cost) = self.total_cost_usd {
            thread.total_cost_usd = cost;
        }
        if self.clear_completed_at {
            thread.completed_at_ms = None;
        }
        if let Some(at) = self.completed_at_ms {
            thread.completed_at_ms = Some(at);
        }
        thread.updated_at_ms = now_ms();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
}

/// One logical turn. Assistant rows are rewritten in place while their
/// turn streams; content is cumulative, never a delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    #[serde(rename = "threadID")]
    pub thread_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(rename = "createdAtMs")]
    pub created_at_ms: u64,
}

impl Message {
    pub fn new(thread_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            thread_id: thread_id.into(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            created_at_ms: now_ms(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A worker tool invocation attached to an assistant message. Created when
/// the worker announces the tool use; output is written exactly once when
/// the matching result arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    pub name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl ToolCall {
    pub fn new(message_id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: new_id(),
            message_id: message_id.into(),
            name: name.into(),
            input,
            output: None,
        }
    }
}

/// A deferred follow-up prompt, held in memory while its thread is busy
/// under queue-mode follow-ups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(rename = "permissionMode", skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(rename = "queuedAtMs")]
    pub queued_at_ms: u64,
}

impl QueuedMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            content: content.into(),
            model: None,
            permission_mode: None,
            provider: None,
            attachments: Vec::new(),
            queued_at_ms: now_ms(),
        }
    }
}
