//! Orchestrator facade: owns the map of live worker handles keyed by thread
//! id, wires each handle's event stream through the translator, and exposes
//! the start/stop/cleanup surface the route and automation layers call.
//!
//! At most one live worker per thread: a replacing start cancels the old
//! pump, kills the old process, and records the superseded unresolved run as
//! interrupted before the new run claims the thread.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Level};

use foreman_observability::{emit_event, ObservabilityEvent, ProcessKind};
use foreman_types::{
    new_id, now_ms, Attachment, Event, Message, MessageRole, QueuedMessage, ThreadPatch,
};
use foreman_wire::WorkerMessage;
use foreman_worker::{SpawnError, WorkerEvent, WorkerFactory, WorkerHandle, WorkerSpawnOpts};

use crate::config::{ConfigStore, FollowupPolicy};
use crate::event_bus::EventBus;
use crate::queue::FollowupQueue;
use crate::run_state::RunStateRegistry;
use crate::status::{reduce, StatusEvent, StatusOutcome};
use crate::storage::ThreadStore;
use crate::translator::Translator;

#[derive(Error, Debug)]
pub enum StartError {
    #[error("unknown thread `{0}`")]
    UnknownThread(String),
    /// The worker binary could not be spawned — a configuration problem,
    /// reported distinctly from a mid-run failure.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct StartAgentRequest {
    pub thread_id: String,
    pub prompt: String,
    /// Defaults to the thread's stored directory.
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub attachments: Vec<Attachment>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub provider: Option<String>,
}

impl StartAgentRequest {
    pub fn new(thread_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            prompt: prompt.into(),
            working_dir: None,
            model: None,
            permission_mode: None,
            attachments: Vec::new(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            provider: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FollowupRequest {
    pub content: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub provider: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl FollowupRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
            permission_mode: None,
            provider: None,
            attachments: Vec::new(),
        }
    }
}

/// How `submit_prompt` routed the prompt.
#[derive(Debug, Clone)]
pub enum Submission {
    Started,
    Queued(QueuedMessage),
}

struct WorkerEntry {
    handle: Arc<dyn WorkerHandle>,
    run_token: String,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    store: Arc<dyn ThreadStore>,
    events: EventBus,
    factory: Arc<dyn WorkerFactory>,
    config: ConfigStore,
    run_state: RunStateRegistry,
    queue: FollowupQueue,
    translator: Arc<Translator>,
    workers: Arc<RwLock<HashMap<String, WorkerEntry>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        factory: Arc<dyn WorkerFactory>,
        config: ConfigStore,
    ) -> Self {
        let events = EventBus::new();
        let run_state = RunStateRegistry::new();
        let translator = Arc::new(Translator::new(
            store.clone(),
            events.clone(),
            run_state.clone(),
        ));
        Self {
            store,
            events,
            factory,
            config,
            run_state,
            queue: FollowupQueue::new(),
            translator,
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::event_bus::Outbound> {
        self.events.subscribe()
    }

    /// Start (or restart) a run for the thread. Kills any live worker first;
    /// a spawn failure propagates before any thread state is touched.
    pub async fn start_agent(&self, req: StartAgentRequest) -> Result<(), StartError> {
        let thread = self
            .store
            .get_thread(&req.thread_id)
            .await
            .ok_or_else(|| StartError::UnknownThread(req.thread_id.clone()))?;

        self.retire_live_worker(&req.thread_id).await?;
        self.run_state.clear_run_state(&req.thread_id).await;

        let settings = self.config.get().await;
        let opts = WorkerSpawnOpts {
            thread_id: req.thread_id.clone(),
            prompt: req.prompt.clone(),
            working_dir: req
                .working_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(&thread.directory)),
            resume_token: thread.resume_token.clone(),
            model: req.model.clone().or_else(|| thread.model.clone()),
            permission_mode: req
                .permission_mode
                .clone()
                .or_else(|| thread.permission_mode.clone()),
            allowed_tools: req.allowed_tools.clone(),
            disallowed_tools: req.disallowed_tools.clone(),
            provider: req.provider.clone().or_else(|| thread.provider.clone()),
        };
        let spawn = self.factory.create(opts).await?;
        spawn.handle.start().await?;

        let prompt_row = Message::new(&req.thread_id, MessageRole::User, req.prompt.clone())
            .with_attachments(req.attachments.clone());
        self.store
            .insert_message(prompt_row.clone())
            .await
            .map_err(StartError::Internal)?;
        self.events.publish_to_user(
            &thread.owner_id,
            Event::MessageUpdated {
                thread_id: req.thread_id.clone(),
                message: prompt_row,
            },
        );

        // Re-read after retirement: the superseded run may have just been
        // recorded interrupted.
        let current = self
            .store
            .get_thread(&req.thread_id)
            .await
            .ok_or_else(|| StartError::UnknownThread(req.thread_id.clone()))?;
        if let StatusOutcome::Transition { next, .. } = reduce(current.status, &StatusEvent::Start)
        {
            let patch = ThreadPatch {
                status: Some(next),
                clear_waiting_reason: true,
                clear_completed_at: true,
                model: req.model.clone(),
                permission_mode: req.permission_mode.clone(),
                provider: req.provider.clone(),
                ..Default::default()
            };
            if let Some(updated) = self
                .store
                .update_thread(&req.thread_id, patch)
                .await
                .map_err(StartError::Internal)?
            {
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
        }

        let run_token = new_id();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.start",
                component: "engine.orchestrator",
                thread_id: Some(&req.thread_id),
                run_id: Some(&run_token),
                message_id: None,
                tool_call_id: None,
                status: Some("running"),
                error_code: None,
                detail: Some(if thread.resume_token.is_some() {
                    "resume"
                } else {
                    "fresh"
                }),
            },
        );
        let cancel = CancellationToken::new();
        let (init_tx, init_rx) = oneshot::channel();
        self.workers.write().await.insert(
            req.thread_id.clone(),
            WorkerEntry {
                handle: spawn.handle.clone(),
                run_token: run_token.clone(),
                cancel: cancel.clone(),
            },
        );
        tokio::spawn(pump(
            self.translator.clone(),
            spawn.events,
            req.thread_id.clone(),
            run_token,
            cancel,
            self.workers.clone(),
            init_tx,
        ));

        // Bounded wait for the init handshake; the rest of the run proceeds
        // asynchronously through the pump either way.
        let timeout = Duration::from_millis(settings.handshake_timeout_ms);
        if tokio::time::timeout(timeout, init_rx).await.is_err() {
            warn!(
                thread_id = %req.thread_id,
                "worker handshake timed out; run continues in background"
            );
        }

        Ok(())
    }

    /// Explicit stop. Idempotent: a thread with no live worker still lands
    /// on `stopped`, and the dying process's late exit/error signals are
    /// suppressed by the manual-stop flag.
    pub async fn stop_agent(&self, thread_id: &str) -> anyhow::Result<()> {
        self.run_state.mark_manually_stopped(thread_id).await;
        let entry = self.workers.write().await.remove(thread_id);
        let had_worker = entry.is_some();
        if let Some(entry) = entry {
            // Pump keeps draining so trailing protocol messages still land;
            // the exit itself is suppressed by the flag above.
            entry.handle.kill().await;
        }
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.stop",
                component: "engine.orchestrator",
                thread_id: Some(thread_id),
                run_id: None,
                message_id: None,
                tool_call_id: None,
                status: Some("stopped"),
                error_code: None,
                detail: Some(if had_worker { "worker killed" } else { "no live worker" }),
            },
        );

        if let Some(thread) = self.store.get_thread(thread_id).await {
            if let StatusOutcome::Transition { next, .. } = reduce(thread.status, &StatusEvent::Stop)
            {
                if let Some(updated) = self
                    .store
                    .update_thread(
                        thread_id,
                        ThreadPatch {
                            status: Some(next),
                            clear_waiting_reason: true,
                            completed_at_ms: Some(now_ms()),
                            ..Default::default()
                        },
                    )
                    .await?
                {
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
            }
        }
        Ok(())
    }

    pub async fn is_agent_running(&self, thread_id: &str) -> bool {
        self.workers
            .read()
            .await
            .get(thread_id)
            .map(|entry| !entry.handle.has_exited())
            .unwrap_or(false)
    }

    /// Full teardown for archive/delete: kill any live worker, drop all run
    /// state and the follow-up queue. Idempotent; safe on unknown ids.
    pub async fn cleanup_thread_state(&self, thread_id: &str) {
        if let Some(entry) = self.workers.write().await.remove(thread_id) {
            entry.cancel.cancel();
            entry.handle.kill().await;
        }
        self.run_state.cleanup_thread_state(thread_id).await;
        self.queue.clear(thread_id).await;
    }

    /// Route a prompt according to the owning project's follow-up policy:
    /// queue it when the thread is busy under queue mode, otherwise start
    /// (killing and replacing any active worker).
    pub async fn submit_prompt(&self, req: StartAgentRequest) -> Result<Submission, StartError> {
        if self.is_agent_running(&req.thread_id).await {
            let thread = self
                .store
                .get_thread(&req.thread_id)
                .await
                .ok_or_else(|| StartError::UnknownThread(req.thread_id.clone()))?;
            if self.config.followup_policy_for(&thread.project_id).await == FollowupPolicy::Queue {
                let queued = self
                    .enqueue_followup(
                        &req.thread_id,
                        FollowupRequest {
                            content: req.prompt.clone(),
                            model: req.model.clone(),
                            permission_mode: req.permission_mode.clone(),
                            provider: req.provider.clone(),
                            attachments: req.attachments.clone(),
                        },
                    )
                    .await
                    .map_err(StartError::Internal)?;
                return Ok(Submission::Queued(queued));
            }
        }
        self.start_agent(req).await.map(|_| Submission::Started)
    }

    /// Defer a follow-up into the thread's FIFO. The user message row is
    /// persisted immediately so the UI reflects it without waiting for the
    /// current run to finish.
    pub async fn enqueue_followup(
        &self,
        thread_id: &str,
        req: FollowupRequest,
    ) -> anyhow::Result<QueuedMessage> {
        let thread = self
            .store
            .get_thread(thread_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown thread `{thread_id}`"))?;

        let mut queued = QueuedMessage::new(req.content.clone());
        queued.model = req.model;
        queued.permission_mode = req.permission_mode;
        queued.provider = req.provider;
        queued.attachments = req.attachments.clone();

        let row = Message::new(thread_id, MessageRole::User, req.content)
            .with_attachments(req.attachments);
        self.store.insert_message(row.clone()).await?;
        self.events.publish_to_user(
            &thread.owner_id,
            Event::MessageUpdated {
                thread_id: thread_id.to_string(),
                message: row,
            },
        );

        let preview_len = self.config.get().await.queue_preview_len;
        let snapshot = self.queue.push(thread_id, queued.clone(), preview_len).await;
        self.events.publish_to_user(
            &thread.owner_id,
            Event::QueueUpdated {
                thread_id: thread_id.to_string(),
                depth: snapshot.depth,
                next_preview: snapshot.next_preview,
            },
        );
        Ok(queued)
    }

    /// Remove one pending follow-up. Returns false when the id is not queued.
    pub async fn cancel_queued(&self, thread_id: &str, message_id: &str) -> anyhow::Result<bool> {
        let preview_len = self.config.get().await.queue_preview_len;
        let Some(snapshot) = self.queue.cancel(thread_id, message_id, preview_len).await else {
            return Ok(false);
        };
        if let Some(thread) = self.store.get_thread(thread_id).await {
            self.events.publish_to_user(
                &thread.owner_id,
                Event::QueueUpdated {
                    thread_id: thread_id.to_string(),
                    depth: snapshot.depth,
                    next_preview: snapshot.next_preview,
                },
            );
        }
        Ok(true)
    }

    /// Pop the next deferred follow-up; the caller feeds it back into
    /// `start_agent` once the current run resolves.
    pub async fn take_next_queued(&self, thread_id: &str) -> Option<QueuedMessage> {
        self.queue.take_next(thread_id).await
    }

    pub async fn queued_messages(&self, thread_id: &str) -> Vec<QueuedMessage> {
        self.queue.list(thread_id).await
    }

    /// Cancel and kill a superseded worker. An unresolved run is recorded
    /// interrupted; the kill never blocks on the process actually dying.
    async fn retire_live_worker(&self, thread_id: &str) -> anyhow::Result<()> {
        let entry = self.workers.write().await.remove(thread_id);
        let Some(entry) = entry else {
            return Ok(());
        };
        entry.cancel.cancel();
        entry.handle.kill().await;
        debug!(thread_id, "live worker superseded by a new start");

        let flags = self.run_state.run_flags(thread_id).await;
        if flags.result_received {
            return Ok(());
        }
        let Some(thread) = self.store.get_thread(thread_id).await else {
            return Ok(());
        };
        if let StatusOutcome::Transition { next, .. } = reduce(thread.status, &StatusEvent::Interrupt)
        {
            if let Some(updated) = self
                .store
                .update_thread(
                    thread_id,
                    ThreadPatch {
                        status: Some(next),
                        clear_waiting_reason: true,
                        ..Default::default()
                    },
                )
                .await?
            {
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
        }
        Ok(())
    }
}

/// One pump per run: drains the worker's event stream in order into the
/// translator, signals the init handshake, and deregisters its own entry on
/// stream end. Cancellation only lands between messages, never mid-unit.
async fn pump(
    translator: Arc<Translator>,
    mut events: mpsc::Receiver<WorkerEvent>,
    thread_id: String,
    run_token: String,
    cancel: CancellationToken,
    workers: Arc<RwLock<HashMap<String, WorkerEntry>>>,
    init_tx: oneshot::Sender<()>,
) {
    let mut init_tx = Some(init_tx);
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            WorkerEvent::Message(message) => {
                let is_init = matches!(message, WorkerMessage::Init(_));
                if let Err(err) = translator.apply(&thread_id, message).await {
                    warn!(thread_id = %thread_id, "translator failed: {err:?}");
                }
                if is_init {
                    if let Some(tx) = init_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
            WorkerEvent::Exit { code } => {
                if let Err(err) = translator.worker_exited(&thread_id, code).await {
                    warn!(thread_id = %thread_id, "exit handling failed: {err:?}");
                }
                break;
            }
            WorkerEvent::Error { detail } => {
                if let Err(err) = translator.worker_errored(&thread_id, &detail).await {
                    warn!(thread_id = %thread_id, "error handling failed: {err:?}");
                }
                break;
            }
        }
    }

    let mut guard = workers.write().await;
    if guard
        .get(&thread_id)
        .is_some_and(|entry| entry.run_token == run_token)
    {
        guard.remove(&thread_id);
    }
}
