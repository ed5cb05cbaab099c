pub mod claude_cli;
pub mod prompt;
pub mod spawn;

pub use prompt::{build_messages, build_system_prompt};

use crate::provider::{ChatResult, WireMessage};
use crate::runtime::Runtime;
use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const DEFAULT_MAX_HISTORY: usize = 100;

/// Backend that performs the LLM turn. `builtin` drives the provider and
/// tool loop in-process; the other two shell out to an external agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Builtin,
    Claude,
    Codex,
}

impl EngineKind {
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Builtin => "builtin",
            EngineKind::Claude => "claude",
            EngineKind::Codex => "codex",
        }
    }
}

/// Resolve the agent's engine. `"auto"` probes for external CLIs on PATH and
/// falls back to builtin; unknown values fall back to builtin too.
pub fn resolve_engine(rt: &Runtime, agent_id: &str) -> EngineKind {
    let configured = rt
        .config
        .agent_get(agent_id, "engine")
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "builtin".to_string());
    match configured.as_str() {
        "builtin" => EngineKind::Builtin,
        "claude" => EngineKind::Claude,
        "codex" => EngineKind::Codex,
        "auto" => {
            if claude_cli::binary_on_path("claude") {
                EngineKind::Claude
            } else if claude_cli::binary_on_path("codex") {
                EngineKind::Codex
            } else {
                EngineKind::Builtin
            }
        }
        other => {
            warn!("agent '{}' has unknown engine '{}', using builtin", agent_id, other);
            EngineKind::Builtin
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub agent_id: String,
    pub message: String,
    pub channel: String,
    pub sender: Option<String>,
    pub is_subagent: bool,
    /// Checked between provider turns and tool iterations; expiry returns a
    /// partial response tagged `[timeout]`.
    pub deadline: Option<Instant>,
}

/// Session file a request maps to, honoring scope, dmScope, and identity
/// links.
pub fn session_file_for(rt: &Runtime, req: &RunRequest) -> PathBuf {
    let is_direct = rt
        .config
        .channel_get(&req.channel, "direct")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let scope = crate::routing::effective_scope(&rt.config, is_direct);
    let sender = req
        .sender
        .as_deref()
        .map(|s| rt.config.resolve_identity(s));
    rt.sessions
        .file(scope, &req.agent_id, &req.channel, sender.as_deref())
}

/// Run one agent turn: fire lifecycle hooks, persist the user and assistant
/// turns, and dispatch to the resolved engine.
pub async fn run(rt: &Arc<Runtime>, mut req: RunRequest) -> Result<String> {
    let _ = rt
        .hooks
        .run(
            "before_agent_start",
            json!({ "agent_id": req.agent_id, "channel": req.channel }),
        )
        .await;

    // pre_message may rewrite the message before the engine sees it.
    match rt
        .hooks
        .run(
            "pre_message",
            json!({
                "agent_id": req.agent_id,
                "message": req.message,
                "channel": req.channel,
                "sender": req.sender,
            }),
        )
        .await
    {
        Ok(mutated) => {
            if let Some(message) = mutated.get("message").and_then(|m| m.as_str()) {
                req.message = message.to_string();
            }
        }
        Err(e) => {
            fire_on_error(rt, &req, &e).await;
            return Err(e);
        }
    }

    let session_file = session_file_for(rt, &req);
    let idle_minutes = rt.config.get_u64("session.idleResetMinutes").unwrap_or(0);
    if idle_minutes > 0 {
        if let Err(e) = rt.sessions.check_idle_reset(&session_file, idle_minutes) {
            warn!("idle-reset check failed for {}: {}", session_file.display(), e);
        }
    }

    // Serialise runs against the same session within this process.
    let lock = rt
        .session_locks
        .for_key(&session_file.to_string_lossy());
    let _guard = lock.lock().await;

    let engine = resolve_engine(rt, &req.agent_id);
    info!(
        "engine.run agent='{}' channel='{}' engine={} subagent={}",
        req.agent_id,
        req.channel,
        engine.name(),
        req.is_subagent
    );

    let outcome = match engine {
        EngineKind::Builtin => run_builtin(rt, &req, &session_file).await,
        EngineKind::Claude | EngineKind::Codex => {
            claude_cli::run_external(rt, &req, engine, &session_file).await
        }
    };

    match outcome {
        Ok(response) => {
            rt.sessions
                .append(&session_file, "assistant", &response)?;
            let _ = rt
                .hooks
                .run(
                    "post_message",
                    json!({
                        "agent_id": req.agent_id,
                        "channel": req.channel,
                        "response": response,
                    }),
                )
                .await;
            let _ = rt
                .hooks
                .run("agent_end", json!({ "agent_id": req.agent_id }))
                .await;
            Ok(response)
        }
        Err(e) => {
            fire_on_error(rt, &req, &e).await;
            Err(e)
        }
    }
}

async fn fire_on_error(rt: &Arc<Runtime>, req: &RunRequest, error: &anyhow::Error) {
    if let Err(hook_err) = rt
        .hooks
        .run(
            "on_error",
            json!({
                "agent_id": req.agent_id,
                "channel": req.channel,
                "error": error.to_string(),
            }),
        )
        .await
    {
        warn!("on_error hook chain failed: {}", hook_err);
    }
}

/// Builtin engine: provider tool loop with overflow compaction and a single
/// retry. The user turn is appended before the first provider call so the
/// session reflects the conversation even when the provider fails.
async fn run_builtin(
    rt: &Arc<Runtime>,
    req: &RunRequest,
    session_file: &std::path::Path,
) -> Result<String> {
    let provider = rt.provider_for(&req.agent_id);
    let model = rt.agent_model(&req.agent_id);
    let max_turns = rt.max_turns(&req.agent_id);
    let max_history = rt
        .config
        .agent_get(&req.agent_id, "maxHistory")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_MAX_HISTORY as u64) as usize;
    let system_prompt = build_system_prompt(rt, &req.agent_id, req.is_subagent);
    let specs = crate::tools::openai_specs(rt, &req.agent_id);

    let history = build_messages(rt, session_file, &req.message, max_history)?;
    rt.sessions.append(session_file, "user", &req.message)?;

    let mut messages: Vec<WireMessage> = Vec::new();
    if !system_prompt.is_empty() {
        messages.push(WireMessage::text("system", system_prompt.clone()));
    }
    messages.extend(history.iter().map(WireMessage::from_turn));

    let mut compacted = false;
    let mut last_text = String::new();

    for _turn in 0..max_turns {
        if deadline_passed(req) {
            return Ok(timeout_response(&last_text));
        }

        let result = provider.chat(&model, &messages, Some(&specs)).await?;
        match result {
            ChatResult::Error { status, body } => {
                if crate::sessions::detect_overflow(&body) && !compacted {
                    compacted = true;
                    info!("context overflow on {}, compacting session", session_file.display());
                    match rt.sessions.compact(session_file, &provider, &model).await {
                        Ok(_) => {}
                        Err(e) => warn!("compaction failed (continuing): {}", e),
                    }
                    // Rebuild the conversation from the compacted session.
                    let history = build_messages(rt, session_file, &req.message, max_history)?;
                    messages.clear();
                    if !system_prompt.is_empty() {
                        messages.push(WireMessage::text("system", system_prompt.clone()));
                    }
                    // The user turn is already in the session after append.
                    messages.extend(
                        history
                            .iter()
                            .take(history.len().saturating_sub(1))
                            .map(WireMessage::from_turn),
                    );
                    continue;
                }
                anyhow::bail!("provider error ({}): {}", status, body);
            }
            ChatResult::Completion(completion) => {
                if completion.tool_calls.is_empty() {
                    return Ok(completion.text);
                }
                last_text = completion.text.clone();
                messages.push(WireMessage {
                    role: "assistant".to_string(),
                    content: (!completion.text.is_empty()).then(|| completion.text.clone()),
                    tool_calls: completion.assistant_tool_calls.clone(),
                    tool_call_id: None,
                });
                for call in completion.tool_calls {
                    if deadline_passed(req) {
                        return Ok(timeout_response(&last_text));
                    }
                    let mut input = call.arguments.clone();
                    match rt
                        .hooks
                        .run("pre_tool", json!({ "tool": call.name, "input": input }))
                        .await
                    {
                        Ok(mutated) => {
                            if let Some(adopted) = mutated.get("input") {
                                input = adopted.clone();
                            }
                        }
                        Err(e) => {
                            warn!("pre_tool chain failed for '{}': {}", call.name, e);
                        }
                    }
                    let result = crate::tools::execute(rt, &call.name, input.clone()).await;
                    let _ = rt
                        .hooks
                        .run(
                            "post_tool",
                            json!({ "tool": call.name, "input": input, "result": result }),
                        )
                        .await;
                    messages.push(WireMessage::tool_result(&call.id, &result));
                }
            }
        }
    }

    info!(
        "agent '{}' hit the tool-loop limit of {} turns",
        req.agent_id, max_turns
    );
    Ok(format!(
        "{}\n[stopped: tool-loop limit of {} turns reached]",
        last_text, max_turns
    )
    .trim()
    .to_string())
}

fn deadline_passed(req: &RunRequest) -> bool {
    req.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}

fn timeout_response(partial: &str) -> String {
    if partial.is_empty() {
        "[timeout]".to_string()
    } else {
        format!("[timeout] {}", partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockStep, Provider};
    use crate::runtime::Runtime;
    use crate::sessions::SessionScope;
    use serde_json::Value;
    use std::fs;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    fn request(message: &str) -> RunRequest {
        RunRequest {
            agent_id: "main".to_string(),
            message: message.to_string(),
            channel: "web".to_string(),
            sender: Some("tester".to_string()),
            is_subagent: false,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_chat_round_trip_persists_session() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(dir.path(), Provider::mock_text("hi"));

        let response = run(&rt, request("hello")).await.unwrap();
        assert_eq!(response, "hi");

        let file = session_file_for(&rt, &request("hello"));
        let raw = fs::read_to_string(&file).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3); // header + user + assistant
        let header: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["type"], "session");
        let entries = rt.sessions.load(&file, None).unwrap();
        assert_eq!(entries[0].role, "user");
        assert_eq!(entries[0].content, "hello");
        assert_eq!(entries[1].role, "assistant");
        assert_eq!(entries[1].content, "hi");
    }

    #[tokio::test]
    async fn test_pre_message_hook_mutates_message() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(dir.path(), Provider::mock_echo());
        let script = write_script(
            dir.path(),
            "rewrite.sh",
            r#"sed 's/"message":"[^"]*"/"message":"MODIFIED"/'"#,
        );
        rt.hooks
            .register("rewrite", "pre_message", &script, None, None, None)
            .unwrap();

        let response = run(&rt, request("original")).await.unwrap();
        assert_eq!(response, "MODIFIED");

        // The provider-facing prompt carried the mutated text, not the
        // original.
        let provider = rt.provider_for("main");
        let calls = provider.mock_calls();
        let user_contents: Vec<String> = calls[0]
            .iter()
            .filter(|m| m.role == "user")
            .filter_map(|m| m.content.clone())
            .collect();
        assert!(user_contents.iter().any(|c| c == "MODIFIED"));
        assert!(user_contents.iter().all(|c| c != "original"));
    }

    #[tokio::test]
    async fn test_tool_loop_executes_calls_and_feeds_results_back() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(
            dir.path(),
            Provider::mock_steps(vec![
                MockStep::ToolCall {
                    name: "memory".to_string(),
                    arguments: serde_json::json!({
                        "action": "set", "key": "color", "value": "blue"
                    }),
                },
                MockStep::Text("stored it".to_string()),
            ]),
        );

        let response = run(&rt, request("remember the color blue")).await.unwrap();
        assert_eq!(response, "stored it");
        assert_eq!(rt.memory.get("color").unwrap().unwrap().value, "blue");

        // Second provider call saw the tool result message.
        let provider = rt.provider_for("main");
        let calls = provider.mock_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].iter().any(|m| m.role == "tool"));
        assert!(calls[1].iter().any(|m| m.tool_calls.is_some()));
    }

    #[tokio::test]
    async fn test_overflow_compacts_and_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(
            dir.path(),
            Provider::mock_steps(vec![
                MockStep::Overflow,
                MockStep::Text("summary of the early exchange".to_string()),
                MockStep::Text("final answer".to_string()),
            ]),
        );

        // Seed enough history to make compaction meaningful.
        let file = rt
            .sessions
            .file(SessionScope::PerSender, "main", "web", Some("tester"));
        for i in 0..8 {
            rt.sessions.append(&file, "user", &format!("q{i}")).unwrap();
            rt.sessions
                .append(&file, "assistant", &format!("a{i}"))
                .unwrap();
        }

        let response = run(&rt, request("one more thing")).await.unwrap();
        assert_eq!(response, "final answer");

        let entries = rt.sessions.load(&file, None).unwrap();
        assert_eq!(entries[0].role, "system");
        assert!(entries[0].content.starts_with("[Compacted summary]"));
        assert!(entries[0].content.contains("summary of the early exchange"));
        // Newest half of the seeded history survived verbatim.
        assert!(entries.iter().any(|e| e.content == "a7"));
        assert!(!entries.iter().any(|e| e.content == "q0"));
    }

    #[tokio::test]
    async fn test_double_overflow_surfaces_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(
            dir.path(),
            Provider::mock_steps(vec![MockStep::Overflow, MockStep::Overflow, MockStep::Overflow]),
        );
        let file = rt
            .sessions
            .file(SessionScope::PerSender, "main", "web", Some("tester"));
        for i in 0..8 {
            rt.sessions.append(&file, "user", &format!("q{i}")).unwrap();
        }

        let err = run(&rt, request("x")).await.unwrap_err().to_string();
        assert!(err.contains("provider error"), "{err}");
    }

    #[tokio::test]
    async fn test_deadline_returns_timeout_tag() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(dir.path(), Provider::mock_text("never reached"));
        let mut req = request("slow");
        req.deadline = Some(Instant::now());
        let response = run(&rt, req).await.unwrap();
        assert!(response.starts_with("[timeout]"));
    }

    #[tokio::test]
    async fn test_loop_limit_fallback() {
        let dir = tempfile::tempdir().unwrap();
        // Every turn asks for another tool call; maxTurns caps the loop.
        let steps: Vec<MockStep> = (0..10)
            .map(|_| MockStep::ToolCall {
                name: "web_search".to_string(),
                arguments: serde_json::json!({ "query": "again" }),
            })
            .collect();
        let rt = Runtime::for_tests(dir.path(), Provider::mock_steps(steps));
        rt.config
            .set(
                "agents",
                serde_json::json!({
                    "defaults": { "maxTurns": 3 },
                    "list": [ { "id": "main" } ]
                }),
            )
            .unwrap();

        let response = run(&rt, request("loop forever")).await.unwrap();
        assert!(response.contains("tool-loop limit of 3"));
    }

    #[test]
    fn test_resolve_engine_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(dir.path(), Provider::mock_text("x"));
        assert_eq!(resolve_engine(&rt, "main"), EngineKind::Builtin);

        rt.config
            .set(
                "agents",
                serde_json::json!({ "list": [
                    { "id": "c", "engine": "claude" },
                    { "id": "x", "engine": "codex" },
                    { "id": "weird", "engine": "gpt-sdk" }
                ]}),
            )
            .unwrap();
        assert_eq!(resolve_engine(&rt, "c"), EngineKind::Claude);
        assert_eq!(resolve_engine(&rt, "x"), EngineKind::Codex);
        assert_eq!(resolve_engine(&rt, "weird"), EngineKind::Builtin);
    }

    #[tokio::test]
    async fn test_identity_links_collapse_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(dir.path(), Provider::mock_text("ok"));
        rt.config
            .set(
                "identityLinks",
                serde_json::json!([{ "canonical": "alice", "aliases": ["tg:42"] }]),
            )
            .unwrap();

        let mut req = request("hello");
        req.sender = Some("tg:42".to_string());
        let linked = session_file_for(&rt, &req);
        req.sender = Some("alice".to_string());
        let canonical = session_file_for(&rt, &req);
        assert_eq!(linked, canonical);
    }
}
