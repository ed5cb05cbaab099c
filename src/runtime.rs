use crate::config::ConfigStore;
use crate::cron::CronStore;
use crate::engine::spawn::SpawnStore;
use crate::hooks::HookDispatcher;
use crate::memory::MemoryStore;
use crate::provider::Provider;
use crate::sessions::{SessionLocks, SessionStore};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Shared state for one bashclaw process: every store plus the provider
/// hookup. Handlers, the cron runner, tools, and spawned subagents all hold
/// an `Arc<Runtime>`.
pub struct Runtime {
    pub config: ConfigStore,
    pub sessions: SessionStore,
    pub memory: MemoryStore,
    pub hooks: HookDispatcher,
    pub cron: CronStore,
    pub spawns: SpawnStore,
    pub session_locks: SessionLocks,
    pub agents_dir: PathBuf,
    pub usage_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub started_at: Instant,
    provider_override: Option<Arc<Provider>>,
}

impl Runtime {
    /// Build the runtime over a state directory, loading (or defaulting) the
    /// config document at `config_path`.
    pub fn new(state_dir: PathBuf, config_path: PathBuf) -> Result<Arc<Self>> {
        let config = ConfigStore::load(config_path)?;
        Ok(Arc::new(Self {
            config,
            sessions: SessionStore::new(state_dir.join("sessions")),
            memory: MemoryStore::new(state_dir.join("memory"), state_dir.join("agents")),
            hooks: HookDispatcher::new(state_dir.join("hooks")),
            cron: CronStore::new(state_dir.join("cron")),
            spawns: SpawnStore::new(state_dir.join("spawn")),
            session_locks: SessionLocks::new(),
            agents_dir: state_dir.join("agents"),
            usage_dir: state_dir.join("usage"),
            outbox_dir: state_dir.join("outbox"),
            started_at: Instant::now(),
            provider_override: None,
        }))
    }

    /// Provider for one agent, built from its `provider.{url,apiKey}` config
    /// (agent entry, then `agents.defaults`).
    pub fn provider_for(&self, agent_id: &str) -> Arc<Provider> {
        if let Some(p) = &self.provider_override {
            return p.clone();
        }
        let url = self
            .config
            .agent_get(agent_id, "provider.url")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let api_key = self
            .config
            .agent_get(agent_id, "provider.apiKey")
            .and_then(|v| v.as_str().map(String::from))
            .filter(|k| !k.is_empty());
        Arc::new(Provider::http(url, api_key))
    }

    pub fn agent_model(&self, agent_id: &str) -> String {
        self.config
            .agent_get(agent_id, "model")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn max_turns(&self, agent_id: &str) -> usize {
        self.config
            .agent_get(agent_id, "maxTurns")
            .and_then(|v| v.as_u64())
            .unwrap_or(50) as usize
    }

    #[cfg(test)]
    pub fn for_tests(state_dir: &std::path::Path, provider: Provider) -> Arc<Self> {
        let config = ConfigStore::load(state_dir.join("config.json")).expect("test config");
        Arc::new(Self {
            config,
            sessions: SessionStore::new(state_dir.join("sessions")),
            memory: MemoryStore::new(state_dir.join("memory"), state_dir.join("agents")),
            hooks: HookDispatcher::new(state_dir.join("hooks")),
            cron: CronStore::new(state_dir.join("cron")),
            spawns: SpawnStore::new(state_dir.join("spawn")),
            session_locks: SessionLocks::new(),
            agents_dir: state_dir.join("agents"),
            usage_dir: state_dir.join("usage"),
            outbox_dir: state_dir.join("outbox"),
            started_at: Instant::now(),
            provider_override: Some(Arc::new(provider)),
        })
    }
}
