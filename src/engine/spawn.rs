use crate::runtime::Runtime;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Detached subagent runs. Each spawn gets a status file under `spawn/`;
/// the caller polls it by id — the task itself is not owned by anyone.
pub struct SpawnStore {
    spawn_dir: PathBuf,
}

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_ERROR: &str = "error";

/// Records older than this are reaped by [`SpawnStore::reap`].
const SPAWN_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRecord {
    pub id: String,
    pub label: String,
    pub status: String,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpawnStore {
    pub fn new(spawn_dir: PathBuf) -> Self {
        Self { spawn_dir }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.spawn_dir
            .join(format!("{}.json", crate::memory::safe_filename(id)))
    }

    pub fn write(&self, record: &SpawnRecord) -> Result<()> {
        fs::create_dir_all(&self.spawn_dir)?;
        let path = self.record_path(&record.id);
        let tmp = self
            .spawn_dir
            .join(format!(".spawn-tmp-{}", crate::util::short_id()));
        fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read(&self, id: &str) -> Result<Option<SpawnRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("cannot read spawn record {}", path.display()))?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn list(&self) -> Vec<SpawnRecord> {
        let Ok(dir) = fs::read_dir(&self.spawn_dir) else {
            return Vec::new();
        };
        let mut records: Vec<SpawnRecord> = dir
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) != Some("json") {
                    return None;
                }
                fs::read_to_string(&path)
                    .ok()
                    .and_then(|c| serde_json::from_str(&c).ok())
            })
            .collect();
        records.sort_by(|a: &SpawnRecord, b: &SpawnRecord| b.started_at.cmp(&a.started_at));
        records
    }

    /// Drop finished records older than the TTL. Running records are kept.
    pub fn reap(&self) -> usize {
        let now = crate::util::now_ms();
        let mut removed = 0;
        for record in self.list() {
            if record.status == STATUS_RUNNING {
                continue;
            }
            let age = now.saturating_sub(record.completed_at.unwrap_or(record.started_at));
            if age > SPAWN_TTL_MS {
                if fs::remove_file(self.record_path(&record.id)).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }
}

/// `spawn` tool: kick off a subagent run in the background and return
/// immediately with the record id.
///
/// Returns a boxed future (rather than being an `async fn`) because this
/// function and `engine::run`/`tools::execute` form a mutual-recursion
/// cycle (a subagent can itself call the `spawn` tool); boxing erases the
/// opaque type at this edge so the compiler doesn't need to resolve an
/// infinite `Send` obligation through it.
pub fn tool_spawn<'a>(
    rt: &'a Arc<Runtime>,
    input: &'a Value,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Value> + Send + 'a>> {
    Box::pin(async move {
        let Some(task) = input.get("task").and_then(|v| v.as_str()) else {
            return json!({ "error": "spawn requires a task" });
        };
        let label = input
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("subagent")
            .to_string();
        let id = crate::util::short_id();
        let record = SpawnRecord {
            id: id.clone(),
            label,
            status: STATUS_RUNNING.to_string(),
            started_at: crate::util::now_ms(),
            completed_at: None,
            result: None,
            error: None,
        };
        if let Err(e) = rt.spawns.write(&record) {
            return json!({ "error": format!("failed to create spawn record: {e}") });
        }

        let rt_task = rt.clone();
        let task_text = task.to_string();
        let record_id = id.clone();
        tokio::spawn(async move {
            let agent_id = crate::routing::agent_for_channel(&rt_task.config, "spawn");
            let outcome = crate::engine::run(
                &rt_task,
                crate::engine::RunRequest {
                    agent_id,
                    message: task_text,
                    channel: "spawn".to_string(),
                    sender: Some(record_id.clone()),
                    is_subagent: true,
                    deadline: None,
                },
            )
            .await;

            let mut record = match rt_task.spawns.read(&record_id) {
                Ok(Some(r)) => r,
                _ => return,
            };
            record.completed_at = Some(crate::util::now_ms());
            match outcome {
                Ok(text) => {
                    record.status = STATUS_COMPLETED.to_string();
                    record.result = Some(text);
                }
                Err(e) => {
                    record.status = STATUS_ERROR.to_string();
                    record.error = Some(e.to_string());
                }
            }
            if let Err(e) = rt_task.spawns.write(&record) {
                tracing::warn!("spawn {}: failed to persist result: {}", record_id, e);
            }
        });

        json!({
            "id": id,
            "status": "started",
            "check": format!("spawn_status {id}"),
        })
    })
}

/// `spawn_status` tool: current record by id.
pub fn tool_spawn_status(rt: &Runtime, input: &Value) -> Value {
    let Some(id) = input.get("task_id").and_then(|v| v.as_str()) else {
        return json!({ "error": "spawn_status requires a task_id" });
    };
    match rt.spawns.read(id) {
        Ok(Some(record)) => serde_json::to_value(&record).unwrap_or_else(|_| json!({})),
        Ok(None) => json!({ "error": "not found" }),
        Err(e) => json!({ "error": format!("{e}") }),
    }
}
