use serde::{Deserialize, Serialize};

use crate::records::{Message, ThreadStatus, ToolCall, WaitingReason};

/// Outbound notification events, fanned out to the push channel. The
/// transport (WS/SSE framing) is the embedder's concern; this is only the
/// event contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "agent.initialized")]
    AgentInitialized {
        #[serde(rename = "threadID")]
        thread_id: String,
        tools: Vec<String>,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// A message row was inserted or rewritten. Carries the full cumulative
    /// row, never a delta.
    #[serde(rename = "message.updated")]
    MessageUpdated {
        #[serde(rename = "threadID")]
        thread_id: String,
        message: Message,
    },
    #[serde(rename = "tool.call")]
    ToolCallStarted {
        #[serde(rename = "threadID")]
        thread_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },
    #[serde(rename = "tool.output")]
    ToolOutput {
        #[serde(rename = "threadID")]
        thread_id: String,
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },
    #[serde(rename = "thread.status")]
    ThreadStatusChanged {
        #[serde(rename = "threadID")]
        thread_id: String,
        status: ThreadStatus,
        #[serde(rename = "waitingReason", skip_serializing_if = "Option::is_none")]
        waiting_reason: Option<WaitingReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        #[serde(rename = "permissionMode", skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
    },
    /// Exactly one per run, when the terminal result resolves it.
    #[serde(rename = "run.result")]
    RunResult {
        #[serde(rename = "threadID")]
        thread_id: String,
        status: ThreadStatus,
        #[serde(rename = "isError")]
        is_error: bool,
        #[serde(rename = "totalCostUsd")]
        total_cost_usd: f64,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        result: String,
    },
    #[serde(rename = "queue.updated")]
    QueueUpdated {
        #[serde(rename = "threadID")]
        thread_id: String,
        depth: usize,
        #[serde(rename = "nextPreview", skip_serializing_if = "Option::is_none")]
        next_preview: Option<String>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AgentInitialized { .. } => "agent.initialized",
            Event::MessageUpdated { .. } => "message.updated",
            Event::ToolCallStarted { .. } => "tool.call",
            Event::ToolOutput { .. } => "tool.output",
            Event::ThreadStatusChanged { .. } => "thread.status",
            Event::RunResult { .. } => "run.result",
            Event::QueueUpdated { .. } => "queue.updated",
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            Event::AgentInitialized { thread_id, .. }
            | Event::MessageUpdated { thread_id, .. }
            | Event::ToolCallStarted { thread_id, .. }
            | Event::ToolOutput { thread_id, .. }
            | Event::ThreadStatusChanged { thread_id, .. }
            | Event::RunResult { thread_id, .. }
            | Event::QueueUpdated { thread_id, .. } => thread_id,
        }
    }
}
