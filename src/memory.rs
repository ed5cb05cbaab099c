use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Key→value store with tags, one entry per file under a key-derived safe
/// filename, plus a section index over the per-agent `MEMORY.md` workspace
/// files.
pub struct MemoryStore {
    memory_dir: PathBuf,
    agents_dir: PathBuf,
    locks: KeyLocks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub access_count: u64,
}

/// One scored search hit, from either the KV store or a workspace section.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredHit {
    pub source: &'static str,
    pub key: String,
    pub snippet: String,
    pub score: f64,
}

const WORKSPACE_INDEX_FILE: &str = ".workspace_index.json";

/// Reversible filename encoding: bytes outside `[A-Za-z0-9._-]` become `%XX`.
pub fn safe_filename(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            other => out.push_str(&format!("%{:02x}", other)),
        }
    }
    out
}

/// Inverse of [`safe_filename`]. Malformed escapes pass through verbatim.
pub fn decode_filename(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            match u8::from_str_radix(&name[i + 1..i + 3], 16) {
                Ok(b) => {
                    out.push(b);
                    i += 3;
                }
                Err(_) => {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn for_key(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("key lock map poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl MemoryStore {
    pub fn new(memory_dir: PathBuf, agents_dir: PathBuf) -> Self {
        Self {
            memory_dir,
            agents_dir,
            locks: KeyLocks::new(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.memory_dir.join(format!("{}.json", safe_filename(key)))
    }

    /// Create or update an entry. Writers of the same key funnel through a
    /// per-key lock so last-writer-wins is deterministic.
    pub fn store(&self, key: &str, value: &str, tags: Vec<String>) -> Result<MemoryEntry> {
        if key.trim().is_empty() {
            bail!("memory key must not be empty");
        }
        let lock = self.locks.for_key(key);
        let _guard = lock.lock().expect("key lock poisoned");

        fs::create_dir_all(&self.memory_dir)?;
        let path = self.entry_path(key);
        let now = crate::util::now_ms();
        let created_at = read_entry(&path)
            .ok()
            .flatten()
            .map(|e| e.created_at)
            .unwrap_or(now);
        let entry = MemoryEntry {
            key: key.to_string(),
            value: value.to_string(),
            tags,
            created_at,
            updated_at: now,
            access_count: 0,
        };
        write_entry(&path, &entry)?;
        Ok(entry)
    }

    /// `Ok(None)` on a miss; `Err` when the file exists but is unreadable.
    /// A hit bumps `access_count` and `updated_at` (best effort).
    pub fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
        if key.trim().is_empty() {
            bail!("memory key must not be empty");
        }
        let path = self.entry_path(key);
        let Some(mut entry) = read_entry(&path)? else {
            return Ok(None);
        };
        entry.access_count += 1;
        entry.updated_at = crate::util::now_ms();
        let lock = self.locks.for_key(key);
        let _guard = lock.lock().expect("key lock poisoned");
        if let Err(e) = write_entry(&path, &entry) {
            tracing::debug!("failed to record memory access for '{}': {}", key, e);
        }
        Ok(Some(entry))
    }

    /// Returns true when an entry was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let lock = self.locks.for_key(key);
        let _guard = lock.lock().expect("key lock poisoned");
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Entries newest-first, capped at `limit`. Unreadable files are skipped.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<MemoryEntry>> {
        let mut entries = self.read_all();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Simple contains-match over keys and values.
    pub fn search(&self, substring: &str) -> Result<Vec<MemoryEntry>> {
        if substring.trim().is_empty() {
            bail!("search query must not be empty");
        }
        let needle = substring.to_lowercase();
        Ok(self
            .read_all()
            .into_iter()
            .filter(|e| {
                e.key.to_lowercase().contains(&needle) || e.value.to_lowercase().contains(&needle)
            })
            .collect())
    }

    /// Tokenised scoring: 1 per value-token match, 2 per key-token match,
    /// +0.5 per matching tag. Results sorted by score descending.
    pub fn search_text(&self, query: &str, limit: usize) -> Result<Vec<ScoredHit>> {
        if query.trim().is_empty() {
            bail!("search query must not be empty");
        }
        let tokens: Vec<String> = tokenize(query);
        let mut hits: Vec<ScoredHit> = self
            .read_all()
            .into_iter()
            .filter_map(|e| {
                let key_tokens = tokenize(&e.key);
                let value_tokens = tokenize(&e.value);
                let mut score = 0.0;
                for t in &tokens {
                    score += value_tokens.iter().filter(|v| *v == t).count() as f64;
                    score += 2.0 * key_tokens.iter().filter(|k| *k == t).count() as f64;
                    score += 0.5
                        * e.tags
                            .iter()
                            .filter(|tag| tag.to_lowercase() == *t)
                            .count() as f64;
                }
                if score > 0.0 {
                    Some(ScoredHit {
                        source: "kv",
                        key: e.key,
                        snippet: snippet_of(&e.value),
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Scan the agent's `MEMORY.md` for h2-delimited sections matching the
    /// query; missing file yields no hits.
    pub fn search_workspace(&self, query: &str, agent: &str) -> Result<Vec<ScoredHit>> {
        if query.trim().is_empty() {
            bail!("search query must not be empty");
        }
        let path = self.agents_dir.join(agent).join("MEMORY.md");
        let Ok(content) = fs::read_to_string(&path) else {
            return Ok(Vec::new());
        };
        let tokens = tokenize(query);
        let mut hits = Vec::new();
        for (title, body) in split_sections(&content) {
            let hay = format!("{}\n{}", title, body).to_lowercase();
            let score: f64 = tokens
                .iter()
                .map(|t| hay.matches(t.as_str()).count() as f64)
                .sum();
            if score > 0.0 {
                hits.push(ScoredHit {
                    source: "workspace",
                    key: title,
                    snippet: snippet_of(&body),
                    score,
                });
            }
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }

    /// Merge KV and workspace results, sorted by score descending.
    pub fn search_all(&self, query: &str, agent: &str, limit: usize) -> Result<Vec<ScoredHit>> {
        let mut hits = self.search_text(query, limit)?;
        hits.extend(self.search_workspace(query, agent)?);
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Rebuild the workspace index file from the agent's `MEMORY.md`.
    pub fn sync_workspace(&self, agent: &str) -> Result<usize> {
        let path = self.agents_dir.join(agent).join("MEMORY.md");
        let content = fs::read_to_string(&path).unwrap_or_default();
        let sections: Vec<Value> = split_sections(&content)
            .into_iter()
            .map(|(title, body)| {
                serde_json::json!({
                    "id": crate::util::fnv1a_64(title.as_bytes()),
                    "title": title,
                    "snippet": snippet_of(&body),
                })
            })
            .collect();
        let count = sections.len();

        fs::create_dir_all(&self.memory_dir)?;
        let index_path = self.memory_dir.join(WORKSPACE_INDEX_FILE);
        let mut index: Value = fs::read_to_string(&index_path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(obj) = index.as_object_mut() {
            obj.insert(
                agent.to_string(),
                serde_json::json!({
                    "sections": sections,
                    "updated_at": crate::util::now_ms(),
                }),
            );
        }
        fs::write(&index_path, serde_json::to_string_pretty(&index)?)?;
        Ok(count)
    }

    /// All entries as a JSON array.
    pub fn export(&self) -> Result<Value> {
        let entries = self.list(None)?;
        Ok(serde_json::to_value(entries)?)
    }

    /// Restore entries from an exported JSON array. On key collision the
    /// last entry in file order wins.
    pub fn import(&self, file: &Path) -> Result<usize> {
        let content = fs::read_to_string(file)
            .with_context(|| format!("cannot read import file {}", file.display()))?;
        let entries: Vec<MemoryEntry> =
            serde_json::from_str(&content).context("import file is not a memory export")?;
        let mut imported = 0;
        for entry in entries {
            if entry.key.trim().is_empty() {
                continue;
            }
            let lock = self.locks.for_key(&entry.key);
            let _guard = lock.lock().expect("key lock poisoned");
            fs::create_dir_all(&self.memory_dir)?;
            write_entry(&self.entry_path(&entry.key), &entry)?;
            imported += 1;
        }
        Ok(imported)
    }

    /// Drop unreadable entry files. Returns how many were removed.
    pub fn compact(&self) -> Result<usize> {
        let mut removed = 0;
        if !self.memory_dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.memory_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if read_entry(&path).is_err() {
                tracing::warn!("Dropping unreadable memory file {}", path.display());
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn count(&self) -> usize {
        self.read_all().len()
    }

    fn read_all(&self) -> Vec<MemoryEntry> {
        let Ok(dir) = fs::read_dir(&self.memory_dir) else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false)
            {
                continue;
            }
            // Tolerate racing writers/deleters by skipping unreadable files.
            if let Ok(Some(e)) = read_entry(&path) {
                entries.push(e);
            }
        }
        entries
    }
}

fn read_entry(path: &Path) -> Result<Option<MemoryEntry>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let entry = serde_json::from_str(&content)
        .with_context(|| format!("corrupt memory entry {}", path.display()))?;
    Ok(Some(entry))
}

fn write_entry(path: &Path, entry: &MemoryEntry) -> Result<()> {
    let parent = path.parent().context("memory path has no parent")?;
    let tmp = parent.join(format!(".mem-tmp-{}", crate::util::short_id()));
    fs::write(&tmp, serde_json::to_string_pretty(entry)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn snippet_of(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= 200 {
        return trimmed.to_string();
    }
    let mut end = 200;
    while !trimmed.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

/// Split markdown into `(title, body)` pairs on `## ` headings. Content
/// before the first heading becomes an untitled preamble section.
fn split_sections(content: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut title = String::new();
    let mut body = String::new();
    for line in content.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            if !title.is_empty() || !body.trim().is_empty() {
                sections.push((title.clone(), body.trim().to_string()));
            }
            title = heading.trim().to_string();
            body = String::new();
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    if !title.is_empty() || !body.trim().is_empty() {
        sections.push((title, body.trim().to_string()));
    }
    sections
}
