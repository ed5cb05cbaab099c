pub mod shell;
pub mod web_fetch;

use crate::runtime::Runtime;
use anyhow::Result;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Declaration of one tool: name, description, JSON-Schema input shape.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// Predefined allow lists. `full` applies no filtering.
pub const PROFILE_MINIMAL: &[&str] = &["web_fetch", "web_search", "memory", "session_status"];
pub const PROFILE_CODING: &[&str] = &[
    "web_fetch",
    "web_search",
    "memory",
    "session_status",
    "shell",
    "read_file",
    "write_file",
];

pub fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "memory",
            description: "Store and recall durable facts. Actions: set, get, delete, list, search.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["set", "get", "delete", "list", "search"] },
                    "key": { "type": "string" },
                    "value": { "type": "string" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "query": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["action"]
            }),
        },
        ToolSpec {
            name: "shell",
            description: "Run a shell command with a wall-clock timeout. Destructive commands are refused.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout": { "type": "integer", "description": "seconds, default 30" },
                    "cwd": { "type": "string" }
                },
                "required": ["command"]
            }),
        },
        ToolSpec {
            name: "web_fetch",
            description: "Fetch an http(s) URL and return its text content. Private addresses are blocked.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string" },
                    "maxChars": { "type": "integer" }
                },
                "required": ["url"]
            }),
        },
        ToolSpec {
            name: "web_search",
            description: "Search the web. Requires a configured search backend.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "maxResults": { "type": "integer" }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "cron",
            description: "Manage scheduled jobs. Actions: add, list, remove.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["add", "list", "remove"] },
                    "id": { "type": "string" },
                    "schedule": { "description": "schedule object with kind, or a five-field cron string" },
                    "prompt": { "type": "string" },
                    "sessionTarget": { "type": "string" }
                },
                "required": ["action"]
            }),
        },
        ToolSpec {
            name: "spawn",
            description: "Launch an asynchronous subagent run; returns immediately with an id to poll.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task": { "type": "string" },
                    "label": { "type": "string" }
                },
                "required": ["task"]
            }),
        },
        ToolSpec {
            name: "spawn_status",
            description: "Check the status of a spawned subagent run.",
            input_schema: json!({
                "type": "object",
                "properties": { "task_id": { "type": "string" } },
                "required": ["task_id"]
            }),
        },
        ToolSpec {
            name: "session_status",
            description: "Report the current session file, entry count, and last activity.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent": { "type": "string" },
                    "channel": { "type": "string" },
                    "sender": { "type": "string" }
                }
            }),
        },
        ToolSpec {
            name: "read_file",
            description: "Read a file from the agent workspace directory.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "agent": { "type": "string" }
                },
                "required": ["path"]
            }),
        },
        ToolSpec {
            name: "write_file",
            description: "Write a file inside the agent workspace directory.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                    "agent": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        },
    ]
}

/// Allow/deny check used when no profile is in play: a non-empty allow list
/// requires membership; otherwise deny subtracts.
pub fn is_available(name: &str, allow: &[String], deny: &[String]) -> bool {
    if !allow.is_empty() {
        return allow.iter().any(|a| a == name);
    }
    !deny.iter().any(|d| d == name)
}

fn agent_tool_lists(rt: &Runtime, agent_id: &str) -> (String, Vec<String>, Vec<String>) {
    let profile = rt
        .config
        .agent_get(agent_id, "tools.profile")
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "full".to_string());
    let allow: Vec<String> = rt
        .config
        .agent_get(agent_id, "tools.allow")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let deny: Vec<String> = rt
        .config
        .agent_get(agent_id, "tools.deny")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    (profile, allow, deny)
}

/// Tools available to an agent after profile/allow/deny filtering. The
/// profile and allow list combine into the most permissive set; deny is
/// subtracted last.
pub fn build_spec(rt: &Runtime, agent_id: &str) -> Vec<ToolSpec> {
    let (profile, allow, deny) = agent_tool_lists(rt, agent_id);

    let profile_set: Option<&[&str]> = match profile.as_str() {
        "minimal" => Some(PROFILE_MINIMAL),
        "coding" => Some(PROFILE_CODING),
        _ => None, // full and unknown profiles leave everything on
    };

    builtin_specs()
        .into_iter()
        .filter(|spec| {
            let kept = match profile_set {
                // full: a bare allow list restricts on its own.
                None => is_available(spec.name, &allow, &[]),
                // named profile: profile ∪ allow is the most permissive set.
                Some(set) => set.contains(&spec.name) || allow.iter().any(|a| a == spec.name),
            };
            kept && !deny.iter().any(|d| d == spec.name)
        })
        .collect()
}

/// Tool specs in the provider's function-calling shape.
pub fn openai_specs(rt: &Runtime, agent_id: &str) -> Vec<Value> {
    build_spec(rt, agent_id)
        .into_iter()
        .map(|spec| {
            json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.input_schema,
                }
            })
        })
        .collect()
}

/// Dispatch one tool call. Failures come back as `{"error": …}` values so
/// the model (or CLI caller) can read them; unknown tools report
/// `unknown tool: <name>`.
pub async fn execute(rt: &Arc<Runtime>, name: &str, input: Value) -> Value {
    match name {
        "memory" => memory_tool(rt, &input),
        "shell" => shell_tool(&input).await,
        "web_fetch" => web_fetch_tool(&input).await,
        "web_search" => json!({ "error": "web_search is not configured" }),
        "cron" => cron_tool(rt, &input),
        "spawn" => crate::engine::spawn::tool_spawn(rt, &input).await,
        "spawn_status" => crate::engine::spawn::tool_spawn_status(rt, &input),
        "session_status" => session_status_tool(rt, &input),
        "read_file" => read_file_tool(rt, &input),
        "write_file" => write_file_tool(rt, &input),
        other => json!({ "error": format!("unknown tool: {other}") }),
    }
}

fn err_value(e: impl std::fmt::Display) -> Value {
    json!({ "error": format!("{e}") })
}

fn memory_tool(rt: &Runtime, input: &Value) -> Value {
    let action = input.get("action").and_then(|v| v.as_str()).unwrap_or("");
    let key = input.get("key").and_then(|v| v.as_str()).unwrap_or("");
    match action {
        "set" => {
            let value = input.get("value").and_then(|v| v.as_str()).unwrap_or("");
            let tags: Vec<String> = input
                .get("tags")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            match rt.memory.store(key, value, tags) {
                Ok(entry) => json!({ "ok": true, "key": entry.key }),
                Err(e) => err_value(e),
            }
        }
        "get" => match rt.memory.get(key) {
            Ok(Some(entry)) => serde_json::to_value(&entry).unwrap_or_else(|_| json!({})),
            Ok(None) => json!({ "error": "not found" }),
            Err(e) => err_value(e),
        },
        "delete" => match rt.memory.delete(key) {
            Ok(removed) => json!({ "ok": true, "removed": removed }),
            Err(e) => err_value(e),
        },
        "list" => {
            let limit = input
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|l| l as usize);
            match rt.memory.list(limit) {
                Ok(entries) => serde_json::to_value(&entries).unwrap_or_else(|_| json!([])),
                Err(e) => err_value(e),
            }
        }
        "search" => {
            let query = input.get("query").and_then(|v| v.as_str()).unwrap_or("");
            let limit = input.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
            match rt.memory.search_text(query, limit) {
                Ok(hits) => serde_json::to_value(&hits).unwrap_or_else(|_| json!([])),
                Err(e) => err_value(e),
            }
        }
        other => json!({ "error": format!("unknown memory action: {other}") }),
    }
}

async fn shell_tool(input: &Value) -> Value {
    let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
        return json!({ "error": "shell requires a command" });
    };
    let timeout = input.get("timeout").and_then(|v| v.as_u64());
    let cwd = input.get("cwd").and_then(|v| v.as_str());
    match shell::run_command(command, timeout, cwd).await {
        Ok(result) => serde_json::to_value(&result).unwrap_or_else(|_| json!({})),
        Err(e) => err_value(e),
    }
}

async fn web_fetch_tool(input: &Value) -> Value {
    let Some(url) = input.get("url").and_then(|v| v.as_str()) else {
        return json!({ "error": "web_fetch requires a url" });
    };
    let max_chars = input
        .get("maxChars")
        .and_then(|v| v.as_u64())
        .map(|m| m as usize);
    match web_fetch::fetch_url(url, max_chars).await {
        Ok(result) => serde_json::to_value(&result).unwrap_or_else(|_| json!({})),
        Err(e) => err_value(e),
    }
}

fn cron_tool(rt: &Runtime, input: &Value) -> Value {
    let action = input.get("action").and_then(|v| v.as_str()).unwrap_or("");
    match action {
        "add" => match crate::cron::add_job_from_input(rt, input) {
            Ok(v) => v,
            Err(e) => err_value(e),
        },
        "list" => serde_json::to_value(rt.cron.list()).unwrap_or_else(|_| json!([])),
        "remove" => {
            let Some(id) = input.get("id").and_then(|v| v.as_str()) else {
                return json!({ "error": "cron remove requires an id" });
            };
            match rt.cron.remove(id) {
                Ok(removed) => json!({ "ok": true, "removed": removed }),
                Err(e) => err_value(e),
            }
        }
        other => json!({ "error": format!("unknown cron action: {other}") }),
    }
}

fn session_status_tool(rt: &Runtime, input: &Value) -> Value {
    let agent = input.get("agent").and_then(|v| v.as_str()).unwrap_or("main");
    let channel = input.get("channel").and_then(|v| v.as_str()).unwrap_or("web");
    let sender = input.get("sender").and_then(|v| v.as_str());
    let scope = crate::routing::effective_scope(&rt.config, false);
    let file = rt.sessions.file(scope, agent, channel, sender);
    let entries = rt.sessions.load(&file, None).unwrap_or_default();
    json!({
        "file": file.to_string_lossy(),
        "exists": file.exists(),
        "entries": entries.len(),
        "last_ts": entries.last().map(|e| e.ts),
        "total_sessions": rt.sessions.list().map(|l| l.len()).unwrap_or(0),
    })
}

/// Resolve a workspace-relative path, refusing traversal and absolute paths.
fn workspace_path(rt: &Runtime, input: &Value) -> Result<PathBuf> {
    let agent = input.get("agent").and_then(|v| v.as_str()).unwrap_or("main");
    let raw = input
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("a path is required"))?;
    let rel = Path::new(raw);
    if rel.as_os_str().is_empty() {
        anyhow::bail!("empty path");
    }
    if rel.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    }) {
        anyhow::bail!("path must stay inside the agent workspace");
    }
    Ok(rt.agents_dir.join(agent).join(rel))
}

fn read_file_tool(rt: &Runtime, input: &Value) -> Value {
    let path = match workspace_path(rt, input) {
        Ok(p) => p,
        Err(e) => return err_value(e),
    };
    match std::fs::read_to_string(&path) {
        Ok(content) => json!({ "path": path.to_string_lossy(), "content": content }),
        Err(e) => err_value(e),
    }
}

fn write_file_tool(rt: &Runtime, input: &Value) -> Value {
    let path = match workspace_path(rt, input) {
        Ok(p) => p,
        Err(e) => return err_value(e),
    };
    let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
        return json!({ "error": "write_file requires content" });
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err_value(e);
        }
    }
    match std::fs::write(&path, content) {
        Ok(()) => json!({ "ok": true, "path": path.to_string_lossy() }),
        Err(e) => err_value(e),
    }
}
