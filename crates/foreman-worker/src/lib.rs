//! Worker handle and factory abstractions.
//!
//! One worker process serves one run of one thread. The engine talks to it
//! through a [`WorkerHandle`] (start / kill / exited flag) plus an in-order
//! event stream delivered over an mpsc channel; both come out of a
//! [`WorkerFactory`], which is the seam test doubles plug into.

mod process;

pub use process::{CliWorkerFactory, ProcessWorker, WorkerCommand};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use foreman_wire::WorkerMessage;

/// Events a worker emits, in arrival order. The stream ends with exactly one
/// `Exit` or `Error`.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    Exit { code: i32 },
    Error { detail: String },
}

#[derive(Error, Debug)]
pub enum SpawnError {
    /// The worker binary could not be launched at all — a configuration
    /// problem, distinct from a mid-run failure.
    #[error("failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker stdio unavailable: {0}")]
    Stdio(&'static str),
    #[error("worker already started")]
    AlreadyStarted,
}

/// Options the factory turns into one concrete worker invocation.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpawnOpts {
    pub thread_id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Opaque token from a previous run's init message; present means the
    /// worker resumes that session instead of starting fresh.
    pub resume_token: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub provider: Option<String>,
}

#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Launch the underlying process. Spawn failures surface here,
    /// synchronously, before the run has touched any durable state.
    async fn start(&self) -> Result<(), SpawnError>;

    /// Fire-and-forget kill. Returns before the process has necessarily
    /// terminated; the eventual `Exit` event is still delivered.
    async fn kill(&self);

    fn has_exited(&self) -> bool;
}

/// A handle plus the receiving end of its event stream.
pub struct WorkerSpawn {
    pub handle: Arc<dyn WorkerHandle>,
    pub events: mpsc::Receiver<WorkerEvent>,
}

#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create(&self, opts: WorkerSpawnOpts) -> Result<WorkerSpawn, SpawnError>;
}
