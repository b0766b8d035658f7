//! Protocol translator: consumes worker messages one at a time, in arrival
//! order, and turns them into durable records plus outbound notifications.
//!
//! Every incoming message is handled as one unit — each durable write pairs
//! with its notification before the next message is looked at. Replayed
//! worker ids (session resumption re-announcing old work) are expected and
//! benign; the dedup maps in run state absorb them silently.

use std::sync::Arc;

use tracing::{debug, warn, Level};

use foreman_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use foreman_types::{Event, Message, MessageRole, Thread, ThreadPatch, ToolCall, now_ms};
use foreman_wire::{
    collect_text, decode_unicode_escapes, is_permission_denial, AssistantMessage, ContentBlock,
    InitMessage, ResultMessage, UserMessage, WorkerMessage,
};

use crate::event_bus::EventBus;
use crate::run_state::{PendingPermission, RunStateRegistry};
use crate::status::{reduce, StatusEvent, StatusOutcome};
use crate::storage::ThreadStore;

/// Tool names that put the run into a user-input wait when the terminal
/// result lands.
const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";
const EXIT_PLAN_MODE_TOOL: &str = "ExitPlanMode";

pub struct Translator {
    store: Arc<dyn ThreadStore>,
    events: EventBus,
    run_state: RunStateRegistry,
}

impl Translator {
    pub fn new(store: Arc<dyn ThreadStore>, events: EventBus, run_state: RunStateRegistry) -> Self {
        Self {
            store,
            events,
            run_state,
        }
    }

    /// Apply one protocol message for the thread.
    pub async fn apply(&self, thread_id: &str, message: WorkerMessage) -> anyhow::Result<()> {
        match message {
            WorkerMessage::Init(init) => self.on_init(thread_id, init).await,
            WorkerMessage::Assistant { message } => self.on_assistant(thread_id, message).await,
            WorkerMessage::User { message } => self.on_user(thread_id, message).await,
            WorkerMessage::Result(result) => self.on_result(thread_id, result).await,
            WorkerMessage::Unknown => Ok(()),
        }
    }

    async fn on_init(&self, thread_id: &str, init: InitMessage) -> anyhow::Result<()> {
        let Some(thread) = self.store.get_thread(thread_id).await else {
            debug!(thread_id, "init for unknown thread dropped");
            return Ok(());
        };

        if let Some(token) = init.session_id.as_deref().filter(|t| !t.is_empty()) {
            self.store
                .update_thread(
                    thread_id,
                    ThreadPatch {
                        resume_token: Some(token.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "worker.init",
                component: "engine.translator",
                thread_id: Some(thread_id),
                run_id: None,
                message_id: None,
                tool_call_id: None,
                status: Some("ok"),
                error_code: None,
                detail: init.model.as_deref(),
            },
        );

        self.events.publish_to_user(
            &thread.owner_id,
            Event::AgentInitialized {
                thread_id: thread_id.to_string(),
                tools: init.tools,
                cwd: init.cwd.unwrap_or_else(|| thread.directory.clone()),
                model: init.model,
            },
        );
        Ok(())
    }

    async fn on_assistant(
        &self,
        thread_id: &str,
        message: AssistantMessage,
    ) -> anyhow::Result<()> {
        let Some(thread) = self.store.get_thread(thread_id).await else {
            debug!(thread_id, "assistant message for unknown thread dropped");
            return Ok(());
        };

        let text = decode_unicode_escapes(&collect_text(&message.content));

        // The worker sends cumulative text per message id; a mapped id means
        // rewrite-in-place, an unmapped one means a fresh row.
        let mut current_row = self.run_state.assistant_row(thread_id, &message.id).await;
        if let Some(row_id) = current_row.clone() {
            if !text.is_empty() {
                if let Some(updated) = self.store.update_message(&row_id, text).await? {
                    self.events.publish_to_user(
                        &thread.owner_id,
                        Event::MessageUpdated {
                            thread_id: thread_id.to_string(),
                            message: updated,
                        },
                    );
                }
            }
        } else if !text.is_empty() {
            let row_id = self
                .insert_assistant_row(&thread, &message.id, text)
                .await?;
            current_row = Some(row_id);
        }

        for block in &message.content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };
            if self.run_state.tool_call_for(thread_id, id).await.is_some() {
                debug!(thread_id, tool_use_id = %id, "replayed tool use dropped");
                continue;
            }

            // Tool use with no preceding text still needs an owning row.
            let row_id = if let Some(row_id) = current_row.clone() {
                row_id
            } else {
                let row_id = self
                    .insert_assistant_row(&thread, &message.id, String::new())
                    .await?;
                current_row = Some(row_id.clone());
                row_id
            };

            let call = ToolCall::new(&row_id, name.clone(), input.clone());
            self.store.insert_tool_call(call.clone()).await?;
            self.run_state
                .record_tool_use(thread_id, id, &call.id)
                .await;
            self.events.publish_to_user(
                &thread.owner_id,
                Event::ToolCallStarted {
                    thread_id: thread_id.to_string(),
                    message_id: row_id,
                    tool_call: call,
                },
            );

            match name.as_str() {
                ASK_USER_QUESTION_TOOL => {
                    self.run_state
                        .set_pending_input(thread_id, foreman_types::WaitingReason::Question)
                        .await;
                }
                EXIT_PLAN_MODE_TOOL => {
                    self.run_state
                        .set_pending_input(thread_id, foreman_types::WaitingReason::Plan)
                        .await;
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn insert_assistant_row(
        &self,
        thread: &Thread,
        worker_message_id: &str,
        content: String,
    ) -> anyhow::Result<String> {
        let row = Message::new(&thread.id, MessageRole::Assistant, content);
        let row_id = row.id.clone();
        self.store.insert_message(row.clone()).await?;
        self.run_state
            .map_assistant_row(&thread.id, worker_message_id, &row_id)
            .await;
        self.events.publish_to_user(
            &thread.owner_id,
            Event::MessageUpdated {
                thread_id: thread.id.clone(),
                message: row,
            },
        );
        Ok(row_id)
    }

    async fn on_user(&self, thread_id: &str, message: UserMessage) -> anyhow::Result<()> {
        let Some(thread) = self.store.get_thread(thread_id).await else {
            debug!(thread_id, "tool results for unknown thread dropped");
            return Ok(());
        };

        for block in &message.content {
            let ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } = block
            else {
                continue;
            };

            let Some(call_id) = self.run_state.tool_call_for(thread_id, tool_use_id).await else {
                debug!(thread_id, tool_use_id = %tool_use_id, "result for unrecorded tool use dropped");
                continue;
            };
            let Some(existing) = self.store.get_tool_call(&call_id).await else {
                debug!(thread_id, tool_call_id = %call_id, "tool call row missing");
                continue;
            };
            if existing.output.is_some() {
                debug!(thread_id, tool_call_id = %call_id, "replayed tool result dropped");
                continue;
            }

            let output = decode_unicode_escapes(&content.flatten());
            if is_permission_denial(&output) {
                self.run_state
                    .set_pending_permission(
                        thread_id,
                        PendingPermission {
                            tool_name: existing.name.clone(),
                        },
                    )
                    .await;
                self.run_state
                    .set_pending_input(thread_id, foreman_types::WaitingReason::Permission)
                    .await;
            }

            let updated = self
                .store
                .update_tool_call_output(&call_id, serde_json::Value::String(output))
                .await?;
            if let Some(call) = updated {
                self.events.publish_to_user(
                    &thread.owner_id,
                    Event::ToolOutput {
                        thread_id: thread_id.to_string(),
                        tool_call: call,
                    },
                );
            }
        }

        Ok(())
    }

    async fn on_result(&self, thread_id: &str, result: ResultMessage) -> anyhow::Result<()> {
        // The guard flips exactly once per run; a re-sent terminal message
        // must not mutate status or re-emit the terminal notification.
        if !self.run_state.mark_result_received(thread_id).await {
            debug!(thread_id, "duplicate result dropped");
            return Ok(());
        }

        let Some(thread) = self.store.get_thread(thread_id).await else {
            debug!(thread_id, "result for unknown thread dropped");
            return Ok(());
        };

        let flags = self.run_state.run_flags(thread_id).await;
        let outcome = reduce(
            thread.status,
            &StatusEvent::Result {
                is_error: result.is_error,
                pending_input: flags.pending_input,
            },
        );
        let StatusOutcome::Transition {
            next,
            waiting_reason,
        } = outcome
        else {
            return Ok(());
        };

        let mut patch = ThreadPatch {
            status: Some(next),
            clear_waiting_reason: true,
            total_cost_usd: Some(thread.total_cost_usd + result.total_cost_usd),
            ..Default::default()
        };
        if let Some(reason) = waiting_reason {
            patch.waiting_reason = Some(reason);
        }
        if next.is_terminal() {
            patch.completed_at_ms = Some(now_ms());
        }
        let updated = self.store.update_thread(thread_id, patch).await?;
        let Some(updated) = updated else {
            return Ok(());
        };

        let text = decode_unicode_escapes(result.result.as_deref().unwrap_or_default());
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.resolved",
                component: "engine.translator",
                thread_id: Some(thread_id),
                run_id: None,
                message_id: None,
                tool_call_id: None,
                status: Some(next.as_str()),
                error_code: None,
                detail: Some(&redact_text(&text)),
            },
        );

        self.events.publish_to_user(
            &updated.owner_id,
            Event::ThreadStatusChanged {
                thread_id: thread_id.to_string(),
                status: updated.status,
                waiting_reason: updated.waiting_reason,
                stage: updated.stage.clone(),
                permission_mode: updated.permission_mode.clone(),
            },
        );
        self.events.publish_to_user(
            &updated.owner_id,
            Event::RunResult {
                thread_id: thread_id.to_string(),
                status: updated.status,
                is_error: result.is_error,
                total_cost_usd: result.total_cost_usd,
                duration_ms: result.duration_ms,
                result: text,
            },
        );

        Ok(())
    }

    /// Process-level exit. Suppressed after a manual stop or once a result
    /// has already resolved the run; otherwise the run failed.
    pub async fn worker_exited(&self, thread_id: &str, code: i32) -> anyhow::Result<()> {
        let flags = self.run_state.run_flags(thread_id).await;
        let Some(thread) = self.store.get_thread(thread_id).await else {
            return Ok(());
        };

        let outcome = reduce(
            thread.status,
            &StatusEvent::WorkerExit {
                result_received: flags.result_received,
                manually_stopped: flags.manually_stopped,
            },
        );
        match outcome {
            StatusOutcome::Ignored => {
                debug!(thread_id, code, "late worker exit ignored");
                Ok(())
            }
            StatusOutcome::Transition { next, .. } => {
                warn!(thread_id, code, "worker exited without a result");
                self.resolve_process_failure(&thread, next).await
            }
        }
    }

    /// Process-level error (stream I/O failure, unexpected death).
    pub async fn worker_errored(&self, thread_id: &str, detail: &str) -> anyhow::Result<()> {
        let flags = self.run_state.run_flags(thread_id).await;
        let Some(thread) = self.store.get_thread(thread_id).await else {
            return Ok(());
        };

        let outcome = reduce(
            thread.status,
            &StatusEvent::WorkerError {
                result_received: flags.result_received,
                manually_stopped: flags.manually_stopped,
            },
        );
        match outcome {
            StatusOutcome::Ignored => {
                debug!(thread_id, detail, "late worker error ignored");
                Ok(())
            }
            StatusOutcome::Transition { next, .. } => {
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "worker.errored",
                        component: "engine.translator",
                        thread_id: Some(thread_id),
                        run_id: None,
                        message_id: None,
                        tool_call_id: None,
                        status: Some("failed"),
                        error_code: Some("WORKER_STREAM_ERROR"),
                        detail: Some(detail),
                    },
                );
                self.resolve_process_failure(&thread, next).await
            }
        }
    }

    async fn resolve_process_failure(
        &self,
        thread: &Thread,
        next: foreman_types::ThreadStatus,
    ) -> anyhow::Result<()> {
        let updated = self
            .store
            .update_thread(
                &thread.id,
                ThreadPatch {
                    status: Some(next),
                    clear_waiting_reason: true,
                    completed_at_ms: Some(now_ms()),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(updated) = updated {
            self.events.publish_to_user(
                &updated.owner_id,
                Event::ThreadStatusChanged {
                    thread_id: updated.id.clone(),
                    status: updated.status,
                    waiting_reason: updated.waiting_reason,
                    stage: updated.stage.clone(),
                    permission_mode: updated.permission_mode.clone(),
                },
            );
        }
        Ok(())
    }
}
