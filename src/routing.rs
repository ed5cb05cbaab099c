use crate::config::ConfigStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Canned-reply rule matched before a message ever reaches the engine.
///
/// Patterns are fixed-string alternations: `|` splits the pattern into
/// literal substrings and the rule matches when any of them occurs in the
/// message. Regex metacharacters are never honoured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoreplyRule {
    pub pattern: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    100
}

fn load_rules(config: &ConfigStore) -> Vec<AutoreplyRule> {
    config
        .get("autoreply.rules")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub fn autoreply_add(
    config: &ConfigStore,
    pattern: &str,
    response: &str,
    channel: Option<&str>,
    priority: Option<i64>,
) -> Result<()> {
    let mut rules = load_rules(config);
    rules.push(AutoreplyRule {
        pattern: pattern.to_string(),
        response: response.to_string(),
        channel: channel.map(String::from),
        priority: priority.unwrap_or_else(default_priority),
    });
    config.set("autoreply.rules", serde_json::to_value(rules)?)
}

pub fn autoreply_remove(config: &ConfigStore, pattern: &str) -> Result<usize> {
    let rules = load_rules(config);
    let before = rules.len();
    let kept: Vec<AutoreplyRule> = rules.into_iter().filter(|r| r.pattern != pattern).collect();
    let removed = before - kept.len();
    config.set("autoreply.rules", serde_json::to_value(kept)?)?;
    Ok(removed)
}

/// First matching rule's response, walking rules by ascending priority.
/// Channel-scoped rules only apply on their channel; empty messages never
/// match.
pub fn check(config: &ConfigStore, message: &str, channel: Option<&str>) -> Option<String> {
    if message.is_empty() {
        return None;
    }
    let mut rules = load_rules(config);
    rules.sort_by_key(|r| r.priority);
    for rule in &rules {
        if let Some(rule_channel) = &rule.channel {
            if Some(rule_channel.as_str()) != channel {
                continue;
            }
        }
        if pattern_matches(&rule.pattern, message) {
            return Some(rule.response.clone());
        }
    }
    None
}

fn pattern_matches(pattern: &str, message: &str) -> bool {
    pattern
        .split('|')
        .filter(|alt| !alt.is_empty())
        .any(|alt| message.contains(alt))
}

/// Agent id handling a channel: `channels.<name>.agent`, then
/// `agents.defaults.agent`, then `"main"`.
pub fn agent_for_channel(config: &ConfigStore, channel: &str) -> String {
    config
        .channel_get(channel, "agent")
        .and_then(|v| v.as_str().map(String::from))
        .or_else(|| {
            config
                .get("agents.defaults.agent")
                .and_then(|v| v.as_str().map(String::from))
        })
        .unwrap_or_else(|| "main".to_string())
}

/// Resolve the agent for an inbound request: explicit agent wins, otherwise
/// the channel mapping decides.
pub fn resolve_agent(config: &ConfigStore, agent: Option<&str>, channel: &str) -> String {
    match agent {
        Some(a) if !a.is_empty() => a.to_string(),
        _ => agent_for_channel(config, channel),
    }
}

/// Session scope in effect for a request. `session.dmScope`, when set,
/// overrides `session.scope` for direct-message traffic.
pub fn effective_scope(config: &ConfigStore, is_direct: bool) -> crate::sessions::SessionScope {
    let base = config
        .get_str("session.scope")
        .and_then(|s| crate::sessions::SessionScope::parse(&s))
        .unwrap_or(crate::sessions::SessionScope::PerSender);
    if is_direct {
        if let Some(dm) = config
            .get_str("session.dmScope")
            .and_then(|s| crate::sessions::SessionScope::parse(&s))
        {
            return dm;
        }
    }
    base
}

pub fn set_default_agent(config: &ConfigStore, agent: &str) -> Result<()> {
    config.set("agents.defaults.agent", json!(agent))
}

pub fn rules_as_json(config: &ConfigStore) -> Value {
    serde_json::to_value(load_rules(config)).unwrap_or_else(|_| json!([]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config() -> (ConfigStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::load(dir.path().join("config.json")).unwrap();
        (config, dir)
    }

    #[test]
    fn test_literal_alternation() {
        let (config, _dir) = temp_config();
        autoreply_add(&config, "ping|pong", "ack", None, None).unwrap();

        assert_eq!(check(&config, "well ping there", None).unwrap(), "ack");
        assert_eq!(check(&config, "pong!", None).unwrap(), "ack");
        assert!(check(&config, "neither", None).is_none());
        assert!(check(&config, "", None).is_none());
    }

    #[test]
    fn test_regex_metacharacters_are_inert() {
        let (config, _dir) = temp_config();
        autoreply_add(&config, ".*", "never-regex", None, None).unwrap();

        // ".*" only matches messages literally containing ".*".
        assert!(check(&config, "anything at all", None).is_none());
        assert_eq!(check(&config, "glob .* here", None).unwrap(), "never-regex");
    }

    #[test]
    fn test_priority_order_picks_lowest_first() {
        let (config, _dir) = temp_config();
        autoreply_add(&config, "hello", "late", None, Some(50)).unwrap();
        autoreply_add(&config, "hello", "early", None, Some(10)).unwrap();

        assert_eq!(check(&config, "hello there", None).unwrap(), "early");
    }

    #[test]
    fn test_channel_scoping() {
        let (config, _dir) = temp_config();
        autoreply_add(&config, "help", "telegram help", Some("telegram"), Some(1)).unwrap();
        autoreply_add(&config, "help", "generic help", None, Some(2)).unwrap();

        assert_eq!(
            check(&config, "help me", Some("telegram")).unwrap(),
            "telegram help"
        );
        assert_eq!(check(&config, "help me", Some("web")).unwrap(), "generic help");
        assert_eq!(check(&config, "help me", None).unwrap(), "generic help");
    }

    #[test]
    fn test_empty_alternates_never_match_everything() {
        let (config, _dir) = temp_config();
        autoreply_add(&config, "a||b", "split", None, None).unwrap();
        assert!(check(&config, "no match here... wait, a!", None).is_some());
        assert!(check(&config, "zzz", None).is_none());
    }

    #[test]
    fn test_remove_rules() {
        let (config, _dir) = temp_config();
        autoreply_add(&config, "x", "1", None, None).unwrap();
        autoreply_add(&config, "x", "2", None, None).unwrap();
        autoreply_add(&config, "y", "3", None, None).unwrap();
        assert_eq!(autoreply_remove(&config, "x").unwrap(), 2);
        assert!(check(&config, "x", None).is_none());
        assert!(check(&config, "y", None).is_some());
    }

    #[test]
    fn test_agent_resolution() {
        let (config, _dir) = temp_config();
        assert_eq!(agent_for_channel(&config, "web"), "main");

        config
            .set("channels.telegram.agent", json!("tg-agent"))
            .unwrap();
        config.set("agents.defaults.agent", json!("fallback")).unwrap();
        assert_eq!(agent_for_channel(&config, "telegram"), "tg-agent");
        assert_eq!(agent_for_channel(&config, "discord"), "fallback");

        assert_eq!(resolve_agent(&config, Some("explicit"), "telegram"), "explicit");
        assert_eq!(resolve_agent(&config, None, "telegram"), "tg-agent");
    }

    #[test]
    fn test_effective_scope_dm_override() {
        let (config, _dir) = temp_config();
        use crate::sessions::SessionScope;
        assert_eq!(effective_scope(&config, false), SessionScope::PerSender);

        config.set("session.scope", json!("per-channel")).unwrap();
        config
            .set("session.dmScope", json!("per-channel-peer"))
            .unwrap();
        assert_eq!(effective_scope(&config, false), SessionScope::PerChannel);
        assert_eq!(effective_scope(&config, true), SessionScope::PerChannelPeer);
    }
}
