use crate::engine::{EngineKind, RunRequest};
use crate::runtime::Runtime;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

const CLI_TIMEOUT: Duration = Duration::from_secs(300);

/// Tool-name translation for `--disallowedTools`: our deny-list names mapped
/// to the external CLI's tool names.
const DISALLOWED_NAME_MAP: &[(&str, &str)] = &[
    ("shell", "Bash"),
    ("write_file", "Write"),
    ("read_file", "Read"),
    ("web_fetch", "WebFetch"),
    ("web_search", "WebSearch"),
];

#[derive(Debug, Default)]
struct CliResult {
    is_error: bool,
    result: String,
    session_id: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    total_cost_usd: f64,
}

/// Dispatch a run to an external agent CLI (`claude` or `codex`).
///
/// The claude path wires our hook chain back in through a per-run settings
/// file (PreCompact/PostToolUse → `hooks-bridge`), continues a stored CLI
/// session via `--resume`, and records usage samples. Codex shares the
/// invocation shape minus the settings bridge.
pub async fn run_external(
    rt: &Arc<Runtime>,
    req: &RunRequest,
    kind: EngineKind,
    session_file: &Path,
) -> Result<String> {
    let exe = std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "bashclaw".to_string());

    let bootstrap = crate::engine::prompt::bootstrap_concat(rt, &req.agent_id, req.is_subagent);
    let prompt = wrap_prompt(&exe, &req.agent_id, &req.channel, &bootstrap, &req.message);

    let stored_session = rt
        .sessions
        .meta_get(session_file, "cc_session_id", Value::Null)
        .as_str()
        .map(String::from)
        .filter(|s| !s.is_empty());

    if stored_session.is_none() {
        let _ = rt
            .hooks
            .run(
                "session_start",
                json!({ "agent_id": req.agent_id, "channel": req.channel }),
            )
            .await;
    }

    rt.sessions.append(session_file, "user", &req.message)?;

    let binary = match kind {
        EngineKind::Claude => "claude",
        EngineKind::Codex => "codex",
        EngineKind::Builtin => bail!("builtin engine has no external CLI"),
    };

    let mut cmd = Command::new(binary);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Keeps the settings temp file alive until the CLI exits.
    let mut settings_guard: Option<tempfile::NamedTempFile> = None;

    match kind {
        EngineKind::Claude => {
            let mut settings = tempfile::NamedTempFile::new()
                .context("failed to create settings temp file")?;
            settings.write_all(settings_doc(&exe).to_string().as_bytes())?;
            cmd.arg("-p")
                .arg("--output-format")
                .arg("json")
                .arg("--settings")
                .arg(settings.path())
                .arg("--setting-sources")
                .arg("");
            settings_guard = Some(settings);

            let deny: Vec<String> = rt
                .config
                .agent_get(&req.agent_id, "tools.deny")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if let Some(disallowed) = disallowed_tools(&deny) {
                cmd.arg("--disallowedTools").arg(disallowed);
            }
            if let Some(id) = &stored_session {
                cmd.arg("--resume").arg(id);
            }
        }
        EngineKind::Codex => {
            cmd.arg("exec");
        }
        EngineKind::Builtin => unreachable!(),
    }
    cmd.arg(&prompt);

    info!(
        "invoking external engine '{}' for agent '{}'",
        binary, req.agent_id
    );
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn external engine '{}'", binary))?;
    let output = tokio::time::timeout(CLI_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| anyhow::anyhow!("external engine '{}' timed out", binary))??;
    drop(settings_guard);

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        bail!(
            "external engine '{}' exited with {}: {}",
            binary,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let parsed = parse_result(&stdout);
    match kind {
        EngineKind::Claude => {
            let Some(parsed) = parsed else {
                warn!("claude CLI output did not parse as a result document");
                return Ok(String::new());
            };
            if parsed.is_error {
                bail!("claude CLI reported an error: {}", parsed.result);
            }
            if let Some(session_id) = &parsed.session_id {
                rt.sessions
                    .meta_update(session_file, "cc_session_id", json!(session_id))?;
            }
            if let Err(e) = append_usage(rt, &req.agent_id, binary, &parsed) {
                warn!("failed to append usage sample: {}", e);
            }
            Ok(parsed.result)
        }
        EngineKind::Codex => match parsed {
            Some(parsed) if !parsed.is_error => Ok(parsed.result),
            Some(parsed) => bail!("codex CLI reported an error: {}", parsed.result),
            // Codex without --json prints plain text.
            None => Ok(stdout.trim().to_string()),
        },
        EngineKind::Builtin => unreachable!(),
    }
}

/// Per-run settings for the claude CLI: both bridge events route back into
/// this binary's `hooks-bridge` subcommand.
fn settings_doc(exe: &str) -> Value {
    let bridge = |event: &str| {
        json!([{
            "hooks": [{
                "type": "command",
                "command": format!("{} hooks-bridge {}", exe, event),
            }]
        }])
    };
    json!({
        "hooks": {
            "PreCompact": bridge("pre_compact"),
            "PostToolUse": bridge("post_tool_use"),
        }
    })
}

fn disallowed_tools(deny: &[String]) -> Option<String> {
    let mapped: Vec<&str> = deny
        .iter()
        .filter_map(|name| {
            DISALLOWED_NAME_MAP
                .iter()
                .find(|(ours, _)| ours == name)
                .map(|(_, theirs)| *theirs)
        })
        .collect();
    if mapped.is_empty() {
        None
    } else {
        Some(mapped.join(","))
    }
}

fn wrap_prompt(exe: &str, agent_id: &str, channel: &str, bootstrap: &str, message: &str) -> String {
    let mut context = format!(
        "You are agent '{}' answering a message from channel '{}'.",
        agent_id, channel
    );
    if !bootstrap.is_empty() {
        context.push_str("\n\n");
        context.push_str(bootstrap);
    }
    context.push_str(&format!(
        "\n\nRuntime tools (memory, cron, spawn, …) are reachable by running `{} tool <name> '<json>'`.",
        exe
    ));
    format!("<bashclaw-context>\n{}\n</bashclaw-context>\n\n{}", context, message)
}

/// The CLI is expected to print one JSON document of
/// `{type:"result", is_error, result, session_id, usage, total_cost_usd}`.
/// Falls back to scanning the last line; anything else is a parse failure.
fn parse_result(stdout: &str) -> Option<CliResult> {
    let candidate = serde_json::from_str::<Value>(stdout.trim()).ok().or_else(|| {
        stdout
            .lines()
            .rev()
            .find(|l| l.trim_start().starts_with('{'))
            .and_then(|l| serde_json::from_str(l.trim()).ok())
    })?;
    if candidate.get("type").and_then(|t| t.as_str()) != Some("result") {
        return None;
    }
    Some(CliResult {
        is_error: candidate
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        result: candidate
            .get("result")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        session_id: candidate
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        input_tokens: candidate
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: candidate
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        total_cost_usd: candidate
            .get("total_cost_usd")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
    })
}

fn append_usage(rt: &Runtime, agent_id: &str, engine: &str, result: &CliResult) -> Result<()> {
    std::fs::create_dir_all(&rt.usage_dir)?;
    let line = json!({
        "ts": crate::util::now_ms(),
        "agent_id": agent_id,
        "engine": engine,
        "session_id": result.session_id,
        "input_tokens": result.input_tokens,
        "output_tokens": result.output_tokens,
        "total_cost_usd": result.total_cost_usd,
    });
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(rt.usage_dir.join("usage.jsonl"))?;
    writeln!(f, "{}", line)?;
    Ok(())
}

/// True when an executable `name` is somewhere on PATH.
pub fn binary_on_path(name: &str) -> bool {
    find_in_path(name, &std::env::var("PATH").unwrap_or_default()).is_some()
}

fn find_in_path(name: &str, path_var: &str) -> Option<PathBuf> {
    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(name);
        if !candidate.is_file() {
            continue;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if std::fs::metadata(&candidate)
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
        #[cfg(not(unix))]
        return Some(candidate);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_doc_shape() {
        let doc = settings_doc("/usr/local/bin/bashclaw");
        assert_eq!(
            doc.pointer("/hooks/PreCompact/0/hooks/0/command")
                .unwrap()
                .as_str()
                .unwrap(),
            "/usr/local/bin/bashclaw hooks-bridge pre_compact"
        );
        assert_eq!(
            doc.pointer("/hooks/PostToolUse/0/hooks/0/type").unwrap(),
            "command"
        );
    }

    #[test]
    fn test_disallowed_tool_mapping() {
        let deny = vec![
            "shell".to_string(),
            "web_fetch".to_string(),
            "not_a_tool".to_string(),
        ];
        assert_eq!(disallowed_tools(&deny).unwrap(), "Bash,WebFetch");
        assert!(disallowed_tools(&[]).is_none());
        assert!(disallowed_tools(&["unknown".to_string()]).is_none());
    }

    #[test]
    fn test_wrap_prompt_structure() {
        let prompt = wrap_prompt("/bin/bashclaw", "main", "telegram", "BOOTSTRAP", "hi there");
        assert!(prompt.starts_with("<bashclaw-context>\n"));
        assert!(prompt.contains("</bashclaw-context>\n\nhi there"));
        assert!(prompt.contains("BOOTSTRAP"));
        assert!(prompt.contains("/bin/bashclaw tool <name>"));
        assert!(prompt.contains("agent 'main'"));
    }

    #[test]
    fn test_parse_result_document() {
        let stdout = r#"{"type":"result","is_error":false,"result":"done","session_id":"s-1",
            "usage":{"input_tokens":10,"output_tokens":20},"total_cost_usd":0.01}"#
            .replace('\n', " ");
        let parsed = parse_result(&stdout).unwrap();
        assert!(!parsed.is_error);
        assert_eq!(parsed.result, "done");
        assert_eq!(parsed.session_id.as_deref(), Some("s-1"));
        assert_eq!(parsed.input_tokens, 10);
        assert_eq!(parsed.output_tokens, 20);

        // Noise before the document: last JSON line wins.
        let noisy = format!("starting up\nlog line\n{}", stdout);
        assert!(parse_result(&noisy).is_some());

        assert!(parse_result("plain text output").is_none());
        assert!(parse_result(r#"{"type":"other"}"#).is_none());
    }

    #[test]
    fn test_find_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fakebin");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let path_var = format!("/nonexistent:{}", dir.path().display());
        assert!(find_in_path("fakebin", &path_var).is_some());
        assert!(find_in_path("missing", &path_var).is_none());
        assert!(find_in_path("fakebin", "").is_none());
    }
}
