//! Layered engine configuration: a JSON file, environment overrides, and
//! runtime overrides, deep-merged in that order. Only the settings the
//! engine itself consumes live here; everything else rides along opaquely
//! for the embedder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FollowupPolicy {
    /// A new prompt on a busy thread kills and replaces the active worker.
    #[default]
    Interrupt,
    /// A new prompt on a busy thread is deferred into the thread's FIFO.
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_program")]
    pub program: String,
    #[serde(default)]
    pub base_args: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            base_args: Vec::new(),
        }
    }
}

fn default_worker_program() -> String {
    "claude".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FollowupSettings {
    #[serde(default)]
    pub default: FollowupPolicy,
    /// Per-project overrides, keyed by project id.
    #[serde(default)]
    pub projects: HashMap<String, FollowupPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_queue_preview_len")]
    pub queue_preview_len: usize,
    #[serde(default)]
    pub followup: FollowupSettings,
    /// Where the engine keeps its store and logs. `None` resolves to the
    /// platform data directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            queue_preview_len: default_queue_preview_len(),
            followup: FollowupSettings::default(),
            state_dir: None,
        }
    }
}

impl EngineSettings {
    pub fn resolve_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        if let Some(data_dir) = dirs::data_dir() {
            return data_dir.join("foreman");
        }
        PathBuf::from(".foreman")
    }
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_queue_preview_len() -> usize {
    80
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = read_json_file(&path).await?;
        let layers = ConfigLayers {
            file,
            env: env_layer(),
            runtime: empty_object(),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> EngineSettings {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    /// Merge into the persisted file layer.
    pub async fn patch_file(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.file, &patch);
        }
        self.save_file().await?;
        Ok(self.get_effective_value().await)
    }

    /// Merge into the in-memory runtime layer (highest precedence).
    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.get_effective_value().await
    }

    pub async fn followup_policy_for(&self, project_id: &str) -> FollowupPolicy {
        let settings = self.get().await;
        settings
            .followup
            .projects
            .get(project_id)
            .copied()
            .unwrap_or(settings.followup.default)
    }

    async fn save_file(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.file.clone();
        let raw = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&self.path, raw).await?;
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(program) = std::env::var("FOREMAN_WORKER_PROGRAM") {
        if !program.trim().is_empty() {
            deep_merge(&mut root, &json!({ "worker": { "program": program } }));
        }
    }
    if let Ok(args) = std::env::var("FOREMAN_WORKER_ARGS") {
        if !args.trim().is_empty() {
            deep_merge(
                &mut root,
                &json!({ "worker": { "base_args": parse_csv(&args) } }),
            );
        }
    }
    if let Ok(timeout) = std::env::var("FOREMAN_HANDSHAKE_TIMEOUT_MS") {
        if let Ok(ms) = timeout.trim().parse::<u64>() {
            deep_merge(&mut root, &json!({ "handshake_timeout_ms": ms }));
        }
    }
    if let Ok(policy) = std::env::var("FOREMAN_FOLLOWUP_POLICY") {
        let normalized = policy.trim().to_ascii_lowercase();
        if normalized == "interrupt" || normalized == "queue" {
            deep_merge(&mut root, &json!({ "followup": { "default": normalized } }));
        }
    }
    if let Ok(dir) = std::env::var("FOREMAN_STATE_DIR") {
        if !dir.trim().is_empty() {
            deep_merge(&mut root, &json!({ "state_dir": dir.trim() }));
        }
    }

    root
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
