pub mod schedule;

pub use schedule::{next_run, parse_schedule, parse_schedule_value, ScheduleSpec};

use crate::runtime::Runtime;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const RUN_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_STUCK_RUN_MS: u64 = 10 * 60 * 1000;
const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_CAP_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub schedule: ScheduleSpec,
    pub prompt: String,
    #[serde(rename = "sessionTarget", default)]
    pub session_target: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "lastRunAt", default)]
    pub last_run_at: u64,
    #[serde(default)]
    pub failures: u32,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct JobsDoc {
    version: u32,
    jobs: Vec<CronJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub ts: u64,
    pub job_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct RunStats {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
    pub avg_duration_ms: u64,
}

/// Consecutive-failure deferral: `min(3600, 30 × 2^failures)` seconds.
pub fn backoff_secs(failures: u32) -> u64 {
    BACKOFF_BASE_SECS
        .saturating_mul(2u64.saturating_pow(failures))
        .min(BACKOFF_CAP_SECS)
}

/// Flat-file job store: `cron/jobs.json` holding `{version:1, jobs:[…]}`,
/// per-job run logs under `cron/runs/<id>.jsonl`, and `.run` markers that
/// act as a cross-process mutex per job instance.
///
/// Duplicate job ids are permitted: `add` never deduplicates and the runner
/// evaluates every entry; `remove` drops all matches.
pub struct CronStore {
    cron_dir: PathBuf,
    lock: std::sync::Mutex<()>,
}

impl CronStore {
    pub fn new(cron_dir: PathBuf) -> Self {
        Self {
            cron_dir,
            lock: std::sync::Mutex::new(()),
        }
    }

    fn jobs_path(&self) -> PathBuf {
        self.cron_dir.join("jobs.json")
    }

    fn runs_dir(&self) -> PathBuf {
        self.cron_dir.join("runs")
    }

    fn run_log_path(&self, id: &str) -> PathBuf {
        self.runs_dir()
            .join(format!("{}.jsonl", crate::memory::safe_filename(id)))
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.read_doc().jobs
    }

    pub fn add(&self, job: CronJob) -> Result<()> {
        let _guard = self.lock.lock().expect("cron store lock poisoned");
        let mut doc = self.read_doc();
        doc.jobs.push(job);
        self.write_doc(&doc)
    }

    /// Remove every job with this id. Returns how many were dropped.
    pub fn remove(&self, id: &str) -> Result<usize> {
        let _guard = self.lock.lock().expect("cron store lock poisoned");
        let mut doc = self.read_doc();
        let before = doc.jobs.len();
        doc.jobs.retain(|j| j.id != id);
        let removed = before - doc.jobs.len();
        self.write_doc(&doc)?;
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<usize> {
        self.mutate(|jobs| {
            let mut changed = 0;
            for job in jobs.iter_mut().filter(|j| j.id == id) {
                job.enabled = enabled;
                changed += 1;
            }
            changed
        })
    }

    /// Run one read-modify-write cycle over the jobs array.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut Vec<CronJob>) -> T) -> Result<T> {
        let _guard = self.lock.lock().expect("cron store lock poisoned");
        let mut doc = self.read_doc();
        let out = f(&mut doc.jobs);
        self.write_doc(&doc)?;
        Ok(out)
    }

    fn read_doc(&self) -> JobsDoc {
        fs::read_to_string(self.jobs_path())
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or(JobsDoc {
                version: 1,
                jobs: Vec::new(),
            })
    }

    fn write_doc(&self, doc: &JobsDoc) -> Result<()> {
        fs::create_dir_all(&self.cron_dir)?;
        let tmp = self
            .cron_dir
            .join(format!(".jobs-tmp-{}", crate::util::short_id()));
        fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        fs::rename(&tmp, self.jobs_path())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Run markers
    // ------------------------------------------------------------------

    /// Create `<id>_<nonce>.run` containing the start epoch. Returns the
    /// marker path.
    pub fn create_marker(&self, id: &str) -> Result<PathBuf> {
        let runs = self.runs_dir();
        fs::create_dir_all(&runs)?;
        let marker = runs.join(format!(
            "{}_{}.run",
            crate::memory::safe_filename(id),
            crate::util::short_id()
        ));
        fs::write(&marker, crate::util::now_ts_secs().to_string())?;
        Ok(marker)
    }

    pub fn remove_marker(&self, marker: &PathBuf) {
        if let Err(e) = fs::remove_file(marker) {
            tracing::warn!("failed to remove run marker {}: {}", marker.display(), e);
        }
    }

    pub fn has_active_marker(&self, id: &str) -> bool {
        let prefix = format!("{}_", crate::memory::safe_filename(id));
        let Ok(dir) = fs::read_dir(self.runs_dir()) else {
            return false;
        };
        dir.flatten().any(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with(&prefix) && n.ends_with(".run"))
                .unwrap_or(false)
        })
    }

    /// Remove markers older than `stuck_ms` and log an error run for each.
    /// Returns the ids whose markers were reaped.
    pub fn check_stuck(&self, stuck_ms: u64) -> Vec<String> {
        let Ok(dir) = fs::read_dir(self.runs_dir()) else {
            return Vec::new();
        };
        let now = crate::util::now_ts_secs();
        let mut reaped = Vec::new();
        for entry in dir.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".run") else {
                continue;
            };
            let started = fs::read_to_string(&path)
                .ok()
                .and_then(|c| c.trim().parse::<u64>().ok())
                .unwrap_or(0);
            if now.saturating_sub(started) * 1000 <= stuck_ms {
                continue;
            }
            let job_id = stem.rsplit_once('_').map(|(id, _)| id).unwrap_or(stem);
            tracing::error!("cron job '{}' run marker stuck, removing {}", job_id, name);
            let _ = fs::remove_file(&path);
            if let Err(e) = self.log_run(
                job_id,
                "error",
                Some("run marker exceeded stuck threshold".to_string()),
                0,
                None,
            ) {
                tracing::warn!("failed to log stuck run for '{}': {}", job_id, e);
            }
            reaped.push(job_id.to_string());
        }
        reaped
    }

    // ------------------------------------------------------------------
    // Run log
    // ------------------------------------------------------------------

    pub fn log_run(
        &self,
        id: &str,
        status: &str,
        error: Option<String>,
        duration_ms: u64,
        summary: Option<String>,
    ) -> Result<()> {
        let path = self.run_log_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entry = RunLogEntry {
            ts: crate::util::now_ms(),
            job_id: id.to_string(),
            status: status.to_string(),
            error,
            duration_ms,
            summary,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        f.write_all(line.as_bytes())?;
        drop(f);

        if fs::metadata(&path).map(|m| m.len()).unwrap_or(0) > RUN_LOG_MAX_BYTES {
            self.rotate_run_log(&path)?;
        }
        Ok(())
    }

    /// Keep the newest half of the log, rewriting in place.
    fn rotate_run_log(&self, path: &PathBuf) -> Result<()> {
        let content = fs::read_to_string(path)?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let keep_from = lines.len() / 2;
        let tmp = path.with_extension("jsonl.rotating");
        let mut out = String::new();
        for line in &lines[keep_from..] {
            out.push_str(line);
            out.push('\n');
        }
        fs::write(&tmp, out)?;
        fs::rename(&tmp, path)?;
        tracing::info!(
            "rotated run log {}: kept {} of {} entries",
            path.display(),
            lines.len() - keep_from,
            lines.len()
        );
        Ok(())
    }

    /// Last `limit` entries, oldest-first. Missing log yields an empty list.
    pub fn get_run_history(&self, id: &str, limit: usize) -> Vec<RunLogEntry> {
        let Ok(content) = fs::read_to_string(self.run_log_path(id)) else {
            return Vec::new();
        };
        let mut entries: Vec<RunLogEntry> = content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        entries
    }

    pub fn get_run_stats(&self, id: &str) -> RunStats {
        let entries = self.get_run_history(id, usize::MAX);
        let total = entries.len();
        let success = entries.iter().filter(|e| e.status == "success").count();
        let errors = entries.iter().filter(|e| e.status == "error").count();
        let avg_duration_ms = if total == 0 {
            0
        } else {
            entries.iter().map(|e| e.duration_ms).sum::<u64>() / total as u64
        };
        RunStats {
            total,
            success,
            errors,
            avg_duration_ms,
        }
    }
}

// ----------------------------------------------------------------------
// Runner
// ----------------------------------------------------------------------

/// Tick loop: once per second, run every enabled job whose schedule is due
/// and which has no in-progress marker. Jobs on a failure streak are
/// deferred by the backoff window.
pub async fn runner_loop(rt: Arc<Runtime>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!("cron runner started");
    loop {
        interval.tick().await;
        tick(&rt).await;
    }
}

/// One scheduler pass. Due jobs run to completion sequentially; the `.run`
/// marker keeps other processes off the same job instance meanwhile.
pub async fn tick(rt: &Arc<Runtime>) {
    let stuck_ms = rt
        .config
        .get_u64("cron.stuckRunMs")
        .unwrap_or(DEFAULT_STUCK_RUN_MS);
    rt.cron.check_stuck(stuck_ms);

    let now = crate::util::now_ts_secs();
    let jobs = rt.cron.list();
    for (index, job) in jobs.into_iter().enumerate() {
        if !job.enabled {
            continue;
        }
        let due = next_run(&job.schedule, job.last_run_at);
        if due == 0 || due > now {
            continue;
        }
        if job.failures > 0 {
            let deferred_until = job.last_run_at + backoff_secs(job.failures);
            if now < deferred_until {
                continue;
            }
        }
        if rt.cron.has_active_marker(&job.id) {
            continue;
        }
        run_job(rt, index, job).await;
    }
}

async fn run_job(rt: &Arc<Runtime>, index: usize, job: CronJob) {
    let marker = match rt.cron.create_marker(&job.id) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("cron job '{}': cannot create run marker: {}", job.id, e);
            return;
        }
    };
    let started = std::time::Instant::now();
    let agent_id = if job.session_target.is_empty() {
        crate::routing::agent_for_channel(&rt.config, "cron")
    } else {
        job.session_target.clone()
    };
    tracing::info!("cron job '{}' firing for agent '{}'", job.id, agent_id);

    let result = crate::engine::run(
        rt,
        crate::engine::RunRequest {
            agent_id,
            message: job.prompt.clone(),
            channel: "cron".to_string(),
            sender: Some(job.id.clone()),
            is_subagent: false,
            deadline: None,
        },
    )
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    let now = crate::util::now_ts_secs();
    let success = result.is_ok();

    let log_result = match &result {
        Ok(text) => rt.cron.log_run(
            &job.id,
            "success",
            None,
            duration_ms,
            Some(summary_of(text)),
        ),
        Err(e) => rt
            .cron
            .log_run(&job.id, "error", Some(e.to_string()), duration_ms, None),
    };
    if let Err(e) = log_result {
        tracing::warn!("cron job '{}': failed to write run log: {}", job.id, e);
    }

    if let Err(e) = rt.cron.mutate(|jobs| {
        if let Some(entry) = jobs.get_mut(index).filter(|j| j.id == job.id) {
            entry.last_run_at = now;
            entry.failures = if success { 0 } else { entry.failures + 1 };
        } else {
            // Jobs shifted under us; fall back to the first matching id.
            if let Some(entry) = jobs.iter_mut().find(|j| j.id == job.id) {
                entry.last_run_at = now;
                entry.failures = if success { 0 } else { entry.failures + 1 };
            }
        }
    }) {
        tracing::warn!("cron job '{}': failed to update job record: {}", job.id, e);
    }

    rt.cron.remove_marker(&marker);
}

fn summary_of(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= 160 {
        return trimmed.to_string();
    }
    let mut end = 160;
    while !trimmed.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

/// Tool/CLI façade: add a job from loose JSON input.
pub fn add_job_from_input(rt: &Runtime, input: &Value) -> Result<Value> {
    let id = input
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(crate::util::new_id);
    let schedule = input
        .get("schedule")
        .and_then(parse_schedule_value)
        .context("cron add requires a schedule")?;
    let prompt = input
        .get("prompt")
        .and_then(|v| v.as_str())
        .context("cron add requires a prompt")?
        .to_string();
    let session_target = input
        .get("sessionTarget")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    rt.cron.add(CronJob {
        id: id.clone(),
        schedule,
        prompt,
        session_target,
        enabled: true,
        last_run_at: 0,
        failures: 0,
    })?;
    Ok(json!({ "ok": true, "id": id }))
}
