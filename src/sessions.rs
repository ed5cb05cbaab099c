use anyhow::{bail, Context, Result};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SESSION_ENGINE: &str = "bashclaw";
pub const SESSION_VERSION: &str = "1";

/// Flat-file conversation store.
///
/// Directory layout:
/// ```text
/// <state>/sessions/
///   <agent>[__<channel>[__<sender>]].jsonl   # header line + one entry per line
///   <key>.jsonl.meta.json                    # mutable sidecar metadata
/// ```
///
/// The first line of every session file is the header
/// `{"type":"session","version":"1","engine":"bashclaw","id":...,"timestamp":...}`;
/// it is written exactly once and skipped by all loaders.
pub struct SessionStore {
    sessions_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScope {
    Global,
    PerChannel,
    PerSender,
    PerChannelPeer,
}

impl SessionScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "per-channel" => Some(Self::PerChannel),
            "per-sender" => Some(Self::PerSender),
            "per-channel-peer" => Some(Self::PerChannelPeer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub role: String,
    pub content: String,
    pub ts: u64,
}

/// Projection of an entry to what the provider sees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub entries: usize,
    pub last_ts: u64,
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

impl SessionStore {
    pub fn new(sessions_dir: PathBuf) -> Self {
        Self { sessions_dir }
    }

    pub fn dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Stable session file path for an (agent, channel, sender) tuple under
    /// the given scope. `per-channel-peer` keys on the direct-message peer,
    /// which callers pass in the `sender` position.
    pub fn file(
        &self,
        scope: SessionScope,
        agent: &str,
        channel: &str,
        sender: Option<&str>,
    ) -> PathBuf {
        let mut parts = vec![sanitize_component(agent)];
        match scope {
            SessionScope::Global => {}
            SessionScope::PerChannel => parts.push(sanitize_component(channel)),
            SessionScope::PerSender | SessionScope::PerChannelPeer => {
                parts.push(sanitize_component(channel));
                parts.push(sanitize_component(sender.unwrap_or("anonymous")));
            }
        }
        self.sessions_dir.join(format!("{}.jsonl", parts.join("__")))
    }

    /// Append one entry, writing the header first when the file is new or
    /// empty. Each line goes out in a single `write` call so concurrent
    /// readers always see whole lines; an exclusive advisory lock serialises
    /// writers across processes.
    pub fn append(&self, file: &Path, role: &str, content: &str) -> Result<()> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let f = OpenOptions::new().create(true).append(true).open(file)?;
        f.lock_exclusive()?;
        let needs_header = f.metadata().map(|m| m.len() == 0).unwrap_or(true);
        let result = (|| -> Result<()> {
            let mut f = &f;
            if needs_header {
                let header = json!({
                    "type": "session",
                    "version": SESSION_VERSION,
                    "engine": SESSION_ENGINE,
                    "id": crate::util::new_id(),
                    "timestamp": crate::util::now_iso(),
                });
                let mut line = serde_json::to_string(&header)?;
                line.push('\n');
                f.write_all(line.as_bytes())?;
            }
            let entry = SessionEntry {
                role: role.to_string(),
                content: content.to_string(),
                ts: crate::util::now_ms(),
            };
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            f.write_all(line.as_bytes())?;
            Ok(())
        })();
        let _ = FileExt::unlock(&f);
        result
    }

    /// Ordered entries, skipping the header, malformed lines (dropped with a
    /// warning), and entries with a null role. `max_lines` keeps only the
    /// newest N entries.
    pub fn load(&self, file: &Path, max_lines: Option<usize>) -> Result<Vec<SessionEntry>> {
        if !file.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(file)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Skipping corrupt session line in {}: {}", file.display(), e);
                    continue;
                }
            };
            if value.get("type").and_then(|t| t.as_str()) == Some("session") {
                continue; // header
            }
            let Some(role) = value.get("role").and_then(|r| r.as_str()) else {
                continue; // null or missing role
            };
            entries.push(SessionEntry {
                role: role.to_string(),
                content: value
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string(),
                ts: value.get("ts").and_then(|t| t.as_u64()).unwrap_or(0),
            });
        }
        if let Some(max) = max_lines {
            if entries.len() > max {
                entries.drain(..entries.len() - max);
            }
        }
        Ok(entries)
    }

    /// History projected to `{role, content}` pairs.
    pub fn load_as_messages(&self, file: &Path, max_lines: Option<usize>) -> Result<Vec<ChatTurn>> {
        Ok(self
            .load(file, max_lines)?
            .into_iter()
            .map(|e| ChatTurn {
                role: e.role,
                content: e.content,
            })
            .collect())
    }

    /// Number of non-header lines.
    pub fn count(&self, file: &Path) -> Result<usize> {
        if !file.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(fs::File::open(file)?);
        let mut n = 0usize;
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if i == 0 {
                if let Ok(v) = serde_json::from_str::<Value>(&line) {
                    if v.get("type").and_then(|t| t.as_str()) == Some("session") {
                        continue;
                    }
                }
            }
            n += 1;
        }
        Ok(n)
    }

    /// Rewrite the file keeping the header plus the newest `keep` entries.
    pub fn prune(&self, file: &Path, keep: usize) -> Result<()> {
        if !file.exists() {
            return Ok(());
        }
        let header = self.read_header(file)?;
        let entries = self.load(file, Some(keep))?;
        self.rewrite(file, header, &entries)
    }

    /// Truncate to zero bytes. The next append writes a fresh header.
    pub fn clear(&self, file: &Path) -> Result<()> {
        if file.exists() {
            fs::write(file, "")?;
        }
        Ok(())
    }

    /// Remove the session file and its metadata sidecar.
    pub fn delete(&self, file: &Path) -> Result<()> {
        if file.exists() {
            fs::remove_file(file)?;
        }
        let meta = meta_path(file);
        if meta.exists() {
            fs::remove_file(meta)?;
        }
        Ok(())
    }

    /// Clear the session when its last entry is older than `minutes`.
    /// Returns true when a reset happened.
    pub fn check_idle_reset(&self, file: &Path, minutes: u64) -> Result<bool> {
        if minutes == 0 {
            return Ok(false);
        }
        let entries = self.load(file, None)?;
        let Some(last) = entries.last() else {
            return Ok(false);
        };
        let age_ms = crate::util::now_ms().saturating_sub(last.ts);
        if age_ms > minutes * 60_000 {
            self.clear(file)?;
            tracing::info!(
                "Session {} idle for {} min, cleared",
                file.display(),
                age_ms / 60_000
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Replace the older half of the session with a single summary entry,
    /// keeping the newest half verbatim. The summary comes from the
    /// configured model; on failure the session is left untouched.
    pub async fn compact(
        &self,
        file: &Path,
        provider: &crate::provider::Provider,
        model: &str,
    ) -> Result<bool> {
        let entries = self.load(file, None)?;
        if entries.len() < 4 {
            return Ok(false);
        }
        let split = entries.len() / 2;
        let (older, newer) = entries.split_at(split);

        let transcript: String = older
            .iter()
            .map(|e| format!("{}: {}\n", e.role, e.content))
            .collect();
        let messages = vec![
            ChatTurn {
                role: "system".to_string(),
                content: "Summarize this conversation so far in a compact form. Keep \
                          decisions, facts, names, and open tasks; drop pleasantries."
                    .to_string(),
            },
            ChatTurn {
                role: "user".to_string(),
                content: transcript,
            },
        ];
        let summary = provider.chat_text(model, &messages).await?;

        let mut kept = vec![SessionEntry {
            role: "system".to_string(),
            content: format!("[Compacted summary]\n{}", summary.trim()),
            ts: crate::util::now_ms(),
        }];
        kept.extend_from_slice(newer);
        let header = self.read_header(file)?;
        self.rewrite(file, header, &kept)?;
        tracing::info!(
            "Compacted session {}: {} entries -> {}",
            file.display(),
            entries.len(),
            kept.len()
        );
        Ok(true)
    }

    /// Enumerate session files with entry counts and last-activity times.
    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let key = match path.file_stem().and_then(|s| s.to_str()) {
                Some(k) => k.to_string(),
                None => continue,
            };
            let entries = self.load(&path, None).unwrap_or_default();
            out.push(SessionInfo {
                key,
                entries: entries.len(),
                last_ts: entries.last().map(|e| e.ts).unwrap_or(0),
            });
        }
        out.sort_by(|a, b| b.last_ts.cmp(&a.last_ts));
        Ok(out)
    }

    fn read_header(&self, file: &Path) -> Result<Option<Value>> {
        let reader = BufReader::new(fs::File::open(file)?);
        if let Some(Ok(first)) = reader.lines().next() {
            if let Ok(v) = serde_json::from_str::<Value>(&first) {
                if v.get("type").and_then(|t| t.as_str()) == Some("session") {
                    return Ok(Some(v));
                }
            }
        }
        Ok(None)
    }

    fn rewrite(&self, file: &Path, header: Option<Value>, entries: &[SessionEntry]) -> Result<()> {
        let parent = file.parent().context("session file has no parent")?;
        let tmp = parent.join(format!(".session-tmp-{}", crate::util::short_id()));
        {
            let mut f = fs::File::create(&tmp)?;
            if let Some(header) = header {
                writeln!(f, "{}", serde_json::to_string(&header)?)?;
            }
            for entry in entries {
                writeln!(f, "{}", serde_json::to_string(entry)?)?;
            }
        }
        fs::rename(&tmp, file)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sidecar metadata
    // ------------------------------------------------------------------

    /// Set one metadata field, read-modify-write under an advisory lock.
    pub fn meta_update(&self, file: &Path, field: &str, value: Value) -> Result<()> {
        let meta = meta_path(file);
        if let Some(parent) = meta.parent() {
            fs::create_dir_all(parent)?;
        }
        let f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&meta)?;
        f.lock_exclusive()?;
        let result = (|| -> Result<()> {
            let content = fs::read_to_string(&meta).unwrap_or_default();
            let mut doc: Value = if content.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&content).unwrap_or_else(|_| json!({}))
            };
            if let Some(obj) = doc.as_object_mut() {
                obj.insert(field.to_string(), value);
                obj.insert("updatedAt".to_string(), json!(crate::util::now_ms()));
            }
            let mut f = &f;
            f.set_len(0)?;
            use std::io::Seek;
            f.seek(std::io::SeekFrom::Start(0))?;
            f.write_all(serde_json::to_string_pretty(&doc)?.as_bytes())?;
            Ok(())
        })();
        let _ = FileExt::unlock(&f);
        result
    }

    /// Read one metadata field; missing file or field yields `default`.
    pub fn meta_get(&self, file: &Path, field: &str, default: Value) -> Value {
        let meta = meta_path(file);
        let Ok(content) = fs::read_to_string(&meta) else {
            return default;
        };
        serde_json::from_str::<Value>(&content)
            .ok()
            .and_then(|doc| doc.get(field).cloned())
            .unwrap_or(default)
    }
}

fn meta_path(file: &Path) -> PathBuf {
    let mut name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("session")
        .to_string();
    name.push_str(".meta.json");
    file.with_file_name(name)
}

/// True when a provider response body signals context-length exhaustion.
/// Tolerates malformed JSON by returning false.
pub fn detect_overflow(response_body: &str) -> bool {
    serde_json::from_str::<Value>(response_body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(|m| m.contains("request_too_large"))
        })
        .unwrap_or(false)
}

/// Bounded in-process lock map keyed by session path; serialises engine runs
/// against the same session within this process. Oldest keys are evicted
/// once the map is full (their file-level advisory lock still protects the
/// data).
pub struct SessionLocks {
    inner: std::sync::Mutex<LockMap>,
}

struct LockMap {
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    order: std::collections::VecDeque<String>,
}

const MAX_TRACKED_LOCKS: usize = 256;

impl SessionLocks {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(LockMap {
                locks: HashMap::new(),
                order: std::collections::VecDeque::new(),
            }),
        }
    }

    pub fn for_key(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("lock map poisoned");
        if let Some(existing) = map.locks.get(key) {
            return existing.clone();
        }
        while map.order.len() >= MAX_TRACKED_LOCKS {
            if let Some(oldest) = map.order.pop_front() {
                map.locks.remove(&oldest);
            }
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        map.locks.insert(key.to_string(), lock.clone());
        map.order.push_back(key.to_string());
        lock
    }
}

impl Default for SessionLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        (store, dir)
    }

    #[test]
    fn test_scoped_paths() {
        let (store, _dir) = temp_store();
        let global = store.file(SessionScope::Global, "main", "telegram", Some("bob"));
        assert!(global.ends_with("main.jsonl"));
        let per_channel = store.file(SessionScope::PerChannel, "main", "telegram", Some("bob"));
        assert!(per_channel.ends_with("main__telegram.jsonl"));
        let per_sender = store.file(SessionScope::PerSender, "main", "telegram", Some("bob"));
        assert!(per_sender.ends_with("main__telegram__bob.jsonl"));
        // Hostile components are flattened to safe characters.
        let weird = store.file(SessionScope::PerSender, "a/b", "c d", Some("../x"));
        assert!(weird.ends_with("a_b__c_d__.._x.jsonl"));
    }

    #[test]
    fn test_header_written_once_and_skipped() {
        let (store, _dir) = temp_store();
        let file = store.file(SessionScope::Global, "main", "web", None);
        store.append(&file, "user", "hello").unwrap();
        store.append(&file, "assistant", "hi").unwrap();

        let raw = fs::read_to_string(&file).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        let header: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["type"], "session");
        assert_eq!(header["version"], "1");
        assert_eq!(header["engine"], "bashclaw");

        let entries = store.load(&file, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, "user");
        assert_eq!(entries[1].content, "hi");
        assert_eq!(store.count(&file).unwrap(), 2);
    }

    #[test]
    fn test_load_drops_malformed_and_null_role_lines() {
        let (store, _dir) = temp_store();
        let file = store.file(SessionScope::Global, "main", "web", None);
        store.append(&file, "user", "ok").unwrap();
        let mut f = OpenOptions::new().append(true).open(&file).unwrap();
        writeln!(f, "not json at all").unwrap();
        writeln!(f, "{{\"role\":null,\"content\":\"dropped\",\"ts\":1}}").unwrap();
        writeln!(f, "{{\"content\":\"no role\",\"ts\":2}}").unwrap();

        let entries = store.load(&file, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "ok");
    }

    #[test]
    fn test_load_max_lines_keeps_newest() {
        let (store, _dir) = temp_store();
        let file = store.file(SessionScope::Global, "main", "web", None);
        for i in 0..5 {
            store.append(&file, "user", &format!("msg{i}")).unwrap();
        }
        let entries = store.load(&file, Some(2)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "msg3");
        assert_eq!(entries[1].content, "msg4");
    }

    #[test]
    fn test_prune_keeps_header_and_newest() {
        let (store, _dir) = temp_store();
        let file = store.file(SessionScope::Global, "main", "web", None);
        for i in 0..6 {
            store.append(&file, "user", &format!("m{i}")).unwrap();
        }
        store.prune(&file, 2).unwrap();
        assert_eq!(store.count(&file).unwrap(), 2);
        let raw = fs::read_to_string(&file).unwrap();
        let first: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "session");
        let entries = store.load(&file, None).unwrap();
        assert_eq!(entries[0].content, "m4");
        assert_eq!(entries[1].content, "m5");
    }

    #[test]
    fn test_clear_and_delete() {
        let (store, _dir) = temp_store();
        let file = store.file(SessionScope::Global, "main", "web", None);
        store.append(&file, "user", "x").unwrap();
        store.meta_update(&file, "counter", json!(1)).unwrap();

        store.clear(&file).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().len(), 0);
        assert_eq!(store.count(&file).unwrap(), 0);

        store.append(&file, "user", "y").unwrap();
        store.delete(&file).unwrap();
        assert!(!file.exists());
        assert!(!meta_path(&file).exists());
    }

    #[test]
    fn test_meta_roundtrip() {
        let (store, _dir) = temp_store();
        let file = store.file(SessionScope::Global, "main", "web", None);
        store.append(&file, "user", "x").unwrap();

        assert_eq!(
            store.meta_get(&file, "cc_session_id", json!(null)),
            json!(null)
        );
        store
            .meta_update(&file, "cc_session_id", json!("abc-123"))
            .unwrap();
        store.meta_update(&file, "runs", json!(2)).unwrap();
        assert_eq!(
            store.meta_get(&file, "cc_session_id", json!(null)),
            json!("abc-123")
        );
        assert_eq!(store.meta_get(&file, "runs", json!(0)), json!(2));
    }

    #[test]
    fn test_idle_reset() {
        let (store, _dir) = temp_store();
        let file = store.file(SessionScope::Global, "main", "web", None);
        store.append(&file, "user", "old").unwrap();

        // Fresh entry: no reset.
        assert!(!store.check_idle_reset(&file, 30).unwrap());

        // Age the last entry by rewriting its timestamp.
        let entries = store.load(&file, None).unwrap();
        let aged: Vec<SessionEntry> = entries
            .into_iter()
            .map(|mut e| {
                e.ts = crate::util::now_ms() - 31 * 60_000;
                e
            })
            .collect();
        let header = store.read_header(&file).unwrap();
        store.rewrite(&file, header, &aged).unwrap();

        assert!(store.check_idle_reset(&file, 30).unwrap());
        assert_eq!(store.count(&file).unwrap(), 0);
    }

    #[test]
    fn test_detect_overflow() {
        assert!(detect_overflow(
            r#"{"error":{"message":"request_too_large: prompt exceeds context"}}"#
        ));
        assert!(!detect_overflow(r#"{"error":{"message":"rate limited"}}"#));
        assert!(!detect_overflow("not json"));
        assert!(!detect_overflow(r#"{"ok":true}"#));
    }

    #[tokio::test]
    async fn test_compact_replaces_older_half() {
        let (store, _dir) = temp_store();
        let file = store.file(SessionScope::Global, "main", "web", None);
        for i in 0..8 {
            store.append(&file, "user", &format!("turn{i}")).unwrap();
        }
        let provider = crate::provider::Provider::mock_text("SUMMARY OF OLD TURNS");
        let compacted = store.compact(&file, &provider, "test-model").await.unwrap();
        assert!(compacted);

        let entries = store.load(&file, None).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].role, "system");
        assert!(entries[0].content.starts_with("[Compacted summary]\n"));
        assert!(entries[0].content.contains("SUMMARY OF OLD TURNS"));
        // Newest half kept verbatim.
        assert_eq!(entries[1].content, "turn4");
        assert_eq!(entries[4].content, "turn7");
        // Header survives the rewrite.
        let raw = fs::read_to_string(&file).unwrap();
        let first: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "session");
    }

    #[test]
    fn test_list_sessions() {
        let (store, _dir) = temp_store();
        let a = store.file(SessionScope::Global, "main", "web", None);
        let b = store.file(SessionScope::PerChannel, "helper", "web", None);
        store.append(&a, "user", "1").unwrap();
        store.append(&b, "user", "1").unwrap();
        store.append(&b, "assistant", "2").unwrap();

        let infos = store.list().unwrap();
        assert_eq!(infos.len(), 2);
        let helper = infos.iter().find(|i| i.key == "helper__web").unwrap();
        assert_eq!(helper.entries, 2);
    }

    #[test]
    fn test_session_locks_bounded() {
        let locks = SessionLocks::new();
        let a = locks.for_key("a");
        let a2 = locks.for_key("a");
        assert!(Arc::ptr_eq(&a, &a2));
        for i in 0..300 {
            locks.for_key(&format!("k{i}"));
        }
        // "a" evicted after overflow; a new Arc is handed out.
        let a3 = locks.for_key("a");
        assert!(!Arc::ptr_eq(&a, &a3));
    }
}
