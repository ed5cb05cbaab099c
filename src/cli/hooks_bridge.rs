use crate::runtime::Runtime;
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// `bashclaw hooks-bridge <event>` — adapter between an external engine's
/// hook callbacks and our chain. Reads the engine's JSON payload from stdin,
/// runs the chain for the mapped event, and prints the bridge reply.
pub async fn run(rt: &Arc<Runtime>, event: &str) -> Result<i32> {
    let event = normalize_event(event);
    if !crate::hooks::EVENTS.contains(&event.as_str()) {
        eprintln!("unknown hook event: {event}");
        return Ok(1);
    }

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let payload: Value = serde_json::from_str(input.trim()).unwrap_or_else(|_| json!({}));

    // Reflection for post_tool_use is quiet when nothing is registered.
    if event == "post_tool_use" && count_enabled(rt, &event) == 0 {
        println!("{{}}");
        return Ok(0);
    }

    let result = rt.hooks.run(&event, payload).await;
    let additional_context = match &result {
        Ok(value) => value
            .get("additionalContext")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        Err(e) => {
            eprintln!("hook chain failed: {e}");
            String::new()
        }
    };

    let reply = json!({
        "additionalContext": additional_context,
        "hookSpecificOutput": { "hookEventName": pascal_case(&event) }
    });
    println!("{}", reply);
    Ok(if result.is_ok() { 0 } else { 1 })
}

fn count_enabled(rt: &Runtime, event: &str) -> usize {
    rt.hooks
        .list_by_event(event)
        .iter()
        .filter(|h| h.enabled)
        .count()
}

/// Accept both our snake_case names and the external engine's PascalCase
/// ones (`PreCompact` → `pre_compact`).
fn normalize_event(event: &str) -> String {
    if event.chars().any(|c| c.is_ascii_uppercase()) {
        let mut out = String::with_capacity(event.len() + 4);
        for (i, c) in event.chars().enumerate() {
            if c.is_ascii_uppercase() {
                if i > 0 {
                    out.push('_');
                }
                out.push(c.to_ascii_lowercase());
            } else {
                out.push(c);
            }
        }
        out
    } else {
        event.to_string()
    }
}

fn pascal_case(event: &str) -> String {
    event
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
