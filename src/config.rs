use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Cached JSON config tree with dotted-path access.
///
/// Reads clone an `Arc` snapshot published behind a read lock; `set` writes
/// the file atomically (temp + rename) and swaps the snapshot. `${VAR}`
/// references in string values are substituted at read time, so the on-disk
/// document keeps them verbatim.
pub struct ConfigStore {
    path: PathBuf,
    cache: RwLock<Arc<Value>>,
}

const MAX_BACKUPS: u32 = 5;

pub const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "agents",
    "autoreply",
    "channels",
    "cron",
    "gateway",
    "identityLinks",
    "logging",
    "session",
];

const SESSION_SCOPES: &[&str] = &["global", "per-channel", "per-sender", "per-channel-peer"];

pub fn default_config() -> Value {
    json!({
        "agents": {
            "defaults": {
                "engine": "builtin",
                "model": "gpt-4o-mini",
                "provider": {
                    "url": "https://api.openai.com/v1",
                    "apiKey": "${OPENAI_API_KEY}"
                },
                "maxTurns": 50
            },
            "list": [ { "id": "main" } ]
        },
        "channels": { "defaults": {} },
        "session": { "scope": "per-sender", "idleResetMinutes": 0 },
        "gateway": { "port": 8800, "maxBodySize": 1048576 },
        "cron": { "stuckRunMs": 600000 }
    })
}

impl ConfigStore {
    /// Load the config at `path`, creating it with defaults when absent.
    pub fn load(path: PathBuf) -> Result<Self> {
        let store = Self {
            path,
            cache: RwLock::new(Arc::new(Value::Null)),
        };
        store.reload()?;
        Ok(store)
    }

    /// Write the default config document, refusing to clobber an existing one.
    pub fn init_default(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("config already exists at {}", path.display());
        }
        write_atomic(path, &default_config())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Discard the cache and re-read from disk. A missing file loads defaults
    /// without creating it.
    pub fn reload(&self) -> Result<()> {
        let tree = if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)
                .with_context(|| format!("failed to read config at {}", self.path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("config at {} is not valid JSON", self.path.display()))?
        } else {
            default_config()
        };
        *self.cache.write().expect("config cache poisoned") = Arc::new(tree);
        Ok(())
    }

    /// Current cached tree (raw, without env substitution).
    pub fn snapshot(&self) -> Arc<Value> {
        self.cache.read().expect("config cache poisoned").clone()
    }

    /// Read a value by dotted path, substituting `${VAR}` in string leaves.
    pub fn get(&self, path: &str) -> Option<Value> {
        let snap = self.snapshot();
        let mut value = lookup(&snap, path)?.clone();
        substitute_tree(&mut value);
        Some(value)
    }

    pub fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).unwrap_or(default)
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(|v| v.as_u64())
    }

    /// Write a value at a dotted path, creating intermediate objects.
    /// Persists atomically and updates the cache in the same critical section.
    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        if path.is_empty() {
            bail!("config path must not be empty");
        }
        let mut guard = self.cache.write().expect("config cache poisoned");
        let mut tree = (**guard).clone();
        if tree.is_null() {
            tree = Value::Object(Map::new());
        }
        insert_at(&mut tree, path, value)?;
        write_atomic(&self.path, &tree)?;
        *guard = Arc::new(tree);
        Ok(())
    }

    /// Validate what the tree would look like after `set(path, value)`,
    /// without persisting anything.
    pub fn validate_with(&self, path: &str, value: Value) -> Result<()> {
        let mut candidate = (*self.snapshot()).clone();
        if candidate.is_null() {
            candidate = Value::Object(Map::new());
        }
        insert_at(&mut candidate, path, value)?;
        let problems = validate_tree(&candidate);
        if problems.is_empty() {
            Ok(())
        } else {
            bail!("invalid config: {}", problems.join("; "))
        }
    }

    /// Validate the cached tree. Collects every problem before failing.
    pub fn validate(&self) -> Result<()> {
        let snap = self.snapshot();
        let problems = validate_tree(&snap);
        if problems.is_empty() {
            Ok(())
        } else {
            bail!("invalid config: {}", problems.join("; "))
        }
    }

    /// Rotate `<config>.bak.N` backups with the newest as `.bak.1`.
    pub fn backup(&self) -> Result<()> {
        if !self.path.exists() {
            bail!("nothing to back up: {} does not exist", self.path.display());
        }
        let bak = |n: u32| PathBuf::from(format!("{}.bak.{}", self.path.display(), n));
        let oldest = bak(MAX_BACKUPS);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..MAX_BACKUPS).rev() {
            let from = bak(n);
            if from.exists() {
                std::fs::rename(&from, bak(n + 1))?;
            }
        }
        std::fs::copy(&self.path, bak(1))?;
        Ok(())
    }

    /// Per-agent lookup: `agents.list[]` entry by id, falling back to
    /// `agents.defaults`, then `None`.
    pub fn agent_get(&self, agent_id: &str, field: &str) -> Option<Value> {
        let snap = self.snapshot();
        let from_list = snap
            .pointer("/agents/list")
            .and_then(|v| v.as_array())
            .and_then(|list| {
                list.iter()
                    .find(|a| a.get("id").and_then(|id| id.as_str()) == Some(agent_id))
            })
            .and_then(|agent| lookup(agent, field));
        let found = from_list.or_else(|| {
            snap.pointer("/agents/defaults")
                .and_then(|defaults| lookup(defaults, field))
        })?;
        let mut value = found.clone();
        substitute_tree(&mut value);
        Some(value)
    }

    pub fn agent_get_or(&self, agent_id: &str, field: &str, default: Value) -> Value {
        self.agent_get(agent_id, field).unwrap_or(default)
    }

    /// `channels.<name>.<field>` falling back to `channels.defaults.<field>`.
    pub fn channel_get(&self, channel: &str, field: &str) -> Option<Value> {
        let snap = self.snapshot();
        let channels = snap.get("channels")?;
        let found = channels
            .get(channel)
            .and_then(|c| lookup(c, field))
            .or_else(|| channels.get("defaults").and_then(|c| lookup(c, field)))?;
        let mut value = found.clone();
        substitute_tree(&mut value);
        Some(value)
    }

    /// True when `channels.<name>` is configured.
    pub fn has_channel(&self, channel: &str) -> bool {
        self.snapshot()
            .pointer(&format!("/channels/{channel}"))
            .is_some()
    }

    /// All configured agent ids.
    pub fn agent_ids(&self) -> Vec<String> {
        self.snapshot()
            .pointer("/agents/list")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|a| a.get("id").and_then(|id| id.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Map a sender alias through `identityLinks[]` to its canonical id.
    /// Unlinked senders pass through unchanged.
    pub fn resolve_identity(&self, sender: &str) -> String {
        let snap = self.snapshot();
        if let Some(links) = snap.get("identityLinks").and_then(|v| v.as_array()) {
            for link in links {
                let canonical = link.get("canonical").and_then(|v| v.as_str());
                let aliases = link.get("aliases").and_then(|v| v.as_array());
                if let (Some(canonical), Some(aliases)) = (canonical, aliases) {
                    if canonical == sender
                        || aliases.iter().any(|a| a.as_str() == Some(sender))
                    {
                        return canonical.to_string();
                    }
                }
            }
        }
        sender.to_string()
    }
}

/// Replace every `${NAME}` with the environment value, or the empty string
/// when the variable is unset. Missing variables never fail.
pub fn env_substitute(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference: keep the literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn substitute_tree(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = env_substitute(s);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(substitute_tree),
        Value::Object(map) => map.values_mut().for_each(substitute_tree),
        _ => {}
    }
}

fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = tree;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn insert_at(tree: &mut Value, path: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cur = tree;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            bail!("config path has an empty segment: {path}");
        }
        let obj = cur
            .as_object_mut()
            .with_context(|| format!("config path {path} crosses a non-object value"))?;
        if i == parts.len() - 1 {
            obj.insert(part.to_string(), value);
            return Ok(());
        }
        cur = obj
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    unreachable!("empty config path rejected above")
}

pub fn validate_tree(tree: &Value) -> Vec<String> {
    let mut problems = Vec::new();

    if !tree.is_object() {
        return vec!["config root must be a JSON object".to_string()];
    }

    match tree.pointer("/gateway/port") {
        None => {}
        Some(port) => match port.as_i64() {
            Some(p) if (1..=65535).contains(&p) => {}
            Some(p) => problems.push(format!("gateway.port {p} outside [1,65535]")),
            None => problems.push("gateway.port must be an integer".to_string()),
        },
    }

    if let Some(list) = tree.pointer("/agents/list") {
        match list.as_array() {
            Some(agents) => {
                for (i, agent) in agents.iter().enumerate() {
                    let has_id = agent
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|s| !s.is_empty())
                        .unwrap_or(false);
                    if !has_id {
                        problems.push(format!("agents.list[{i}] missing id"));
                    }
                }
            }
            None => problems.push("agents.list must be an array".to_string()),
        }
    }

    if let Some(scope) = tree.pointer("/session/dmScope") {
        match scope.as_str() {
            Some(s) if SESSION_SCOPES.contains(&s) => {}
            _ => problems.push(format!(
                "session.dmScope must be one of {SESSION_SCOPES:?}, got {scope}"
            )),
        }
    }

    if let Some(obj) = tree.as_object() {
        for key in obj.keys() {
            if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                tracing::warn!("unknown top-level config key '{key}'");
            }
        }
    }

    problems
}

fn write_atomic(path: &Path, tree: &Value) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("config"),
        crate::util::short_id()
    ));
    let content = serde_json::to_string_pretty(tree)?;
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
