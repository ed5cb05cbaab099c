use crate::runtime::Runtime;
use crate::sessions::ChatTurn;
use anyhow::Result;
use std::path::Path;

/// Workspace bootstrap files, in composition order, with the tag each one is
/// wrapped in. Subagents skip `SOUL.md`.
const BOOTSTRAP_FILES: &[(&str, &str)] = &[
    ("IDENTITY.md", "Identity"),
    ("SOUL.md", "Soul"),
    ("USER.md", "User"),
    ("MEMORY.md", "Memory"),
    ("TOOLS.md", "Tools"),
    ("AGENTS.md", "Agents"),
];

const MEMORY_RECALL_GUIDANCE: &str = "Memory recall: before answering, consider whether stored \
memories or workspace notes are relevant; use the memory tool to search and store durable facts \
(preferences, decisions, open tasks) rather than keeping them only in the conversation.";

/// Compose the system prompt: the agent's configured `systemPrompt`, each
/// non-empty workspace bootstrap file wrapped in its labelled tag, and the
/// memory-recall guidance. The recall block is static text, so a non-subagent
/// always gets it even when nothing else contributed. Subagents get neither
/// `SOUL.md` nor the recall block.
pub fn build_system_prompt(rt: &Runtime, agent_id: &str, is_subagent: bool) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(configured) = rt
        .config
        .agent_get(agent_id, "systemPrompt")
        .and_then(|v| v.as_str().map(String::from))
    {
        if !configured.trim().is_empty() {
            sections.push(configured.trim().to_string());
        }
    }

    let workspace = rt.agents_dir.join(agent_id);
    for (file, label) in BOOTSTRAP_FILES {
        if is_subagent && *file == "SOUL.md" {
            continue;
        }
        if let Some(content) = read_non_empty(&workspace.join(file)) {
            sections.push(format!("[{}]\n{}", label, content.trim()));
        }
    }

    if !is_subagent {
        sections.push(MEMORY_RECALL_GUIDANCE.to_string());
    }

    sections.join("\n\n")
}

/// Concatenation of the bootstrap files without tags, used by the external
/// engine adaptor's context block.
pub fn bootstrap_concat(rt: &Runtime, agent_id: &str, is_subagent: bool) -> String {
    let workspace = rt.agents_dir.join(agent_id);
    let mut parts = Vec::new();
    for (file, _) in BOOTSTRAP_FILES {
        if is_subagent && *file == "SOUL.md" {
            continue;
        }
        if let Some(content) = read_non_empty(&workspace.join(file)) {
            parts.push(content.trim().to_string());
        }
    }
    parts.join("\n\n")
}

fn read_non_empty(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    if content.trim().is_empty() {
        None
    } else {
        Some(content)
    }
}

/// Project session history to provider messages, keep the newest
/// `max_history`, and append the new user turn.
pub fn build_messages(
    rt: &Runtime,
    session_file: &Path,
    new_user_message: &str,
    max_history: usize,
) -> Result<Vec<ChatTurn>> {
    let mut messages = rt
        .sessions
        .load_as_messages(session_file, Some(max_history))?;
    messages.push(ChatTurn {
        role: "user".to_string(),
        content: new_user_message.to_string(),
    });
    Ok(messages)
}
