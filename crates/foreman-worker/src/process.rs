//! Process-backed worker: spawns the CLI coding agent with piped stdio and
//! pumps its stdout protocol stream into the event channel.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use foreman_wire::parse_line;

use crate::{SpawnError, WorkerEvent, WorkerFactory, WorkerHandle, WorkerSpawn, WorkerSpawnOpts};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How to invoke the worker binary. `base_args` come first on the argv so
/// deployments can pin flags (sandbox level, config path) ahead of the
/// per-run arguments.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub base_args: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            base_args: Vec::new(),
        }
    }
}

pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    working_dir: PathBuf,
    thread_id: String,
    tx: mpsc::Sender<WorkerEvent>,
    child: Arc<Mutex<Option<Child>>>,
    started: AtomicBool,
    exited: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    async fn start(&self) -> Result<(), SpawnError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SpawnError::AlreadyStarted);
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(SpawnError::Stdio("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::Stdio("stderr"))?;
        *self.child.lock().await = Some(child);

        let thread_id = self.thread_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(thread_id = %thread_id, "worker stderr: {line}");
            }
        });

        // One task owns the whole event sequence so messages always precede
        // the single terminal exit/error.
        let tx = self.tx.clone();
        let child_slot = self.child.clone();
        let exited = self.exited.clone();
        let thread_id = self.thread_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(message) = parse_line(&line) {
                            if tx.send(WorkerEvent::Message(message)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(thread_id = %thread_id, "worker stdout read failed: {err}");
                        exited.store(true, Ordering::SeqCst);
                        if let Some(child) = child_slot.lock().await.as_mut() {
                            let _ = child.start_kill();
                        }
                        let _ = tx
                            .send(WorkerEvent::Error {
                                detail: err.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }

            let code = wait_for_exit(&child_slot).await;
            exited.store(true, Ordering::SeqCst);
            let _ = tx.send(WorkerEvent::Exit { code }).await;
        });

        Ok(())
    }

    async fn kill(&self) {
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

async fn wait_for_exit(child_slot: &Arc<Mutex<Option<Child>>>) -> i32 {
    loop {
        {
            let mut guard = child_slot.lock().await;
            let Some(child) = guard.as_mut() else {
                return -1;
            };
            match child.try_wait() {
                Ok(Some(status)) => return status.code().unwrap_or(-1),
                Ok(None) => {}
                Err(_) => return -1,
            }
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Factory for CLI-backed workers. Builds the per-run argv from the spawn
/// options and the configured command.
#[derive(Debug, Clone, Default)]
pub struct CliWorkerFactory {
    command: WorkerCommand,
}

impl CliWorkerFactory {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    fn build_argv(&self, opts: &WorkerSpawnOpts) -> Vec<String> {
        let mut args = self.command.base_args.clone();
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        if let Some(model) = trimmed(opts.model.as_deref()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(mode) = trimmed(opts.permission_mode.as_deref()) {
            args.push("--permission-mode".to_string());
            args.push(mode.to_string());
        }
        if !opts.allowed_tools.is_empty() {
            args.push("--allowed-tools".to_string());
            args.push(opts.allowed_tools.join(","));
        }
        if !opts.disallowed_tools.is_empty() {
            args.push("--disallowed-tools".to_string());
            args.push(opts.disallowed_tools.join(","));
        }
        if let Some(token) = trimmed(opts.resume_token.as_deref()) {
            args.push("--resume".to_string());
            args.push(token.to_string());
        }
        args.push("-p".to_string());
        args.push(opts.prompt.clone());
        args
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[async_trait]
impl WorkerFactory for CliWorkerFactory {
    async fn create(&self, opts: WorkerSpawnOpts) -> Result<WorkerSpawn, SpawnError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut envs = Vec::new();
        if let Some(provider) = trimmed(opts.provider.as_deref()) {
            envs.push(("FOREMAN_PROVIDER".to_string(), provider.to_string()));
        }
        let worker = ProcessWorker {
            program: self.command.program.clone(),
            args: self.build_argv(&opts),
            envs,
            working_dir: opts.working_dir.clone(),
            thread_id: opts.thread_id.clone(),
            tx,
            child: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
            exited: Arc::new(AtomicBool::new(false)),
        };
        Ok(WorkerSpawn {
            handle: Arc::new(worker),
            events: rx,
        })
    }
}
