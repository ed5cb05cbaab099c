use crate::runtime::Runtime;
use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::Arc;

const USAGE: &str = "Usage: bashclaw tool <name> [<json> | --key value …]\n\
Tools: memory, shell, web_fetch, web_search, cron, spawn, spawn_status, session_status, read_file, write_file";

/// `bashclaw tool <name> …` — dispatch one tool call from the command line.
/// Accepts either a single JSON document or `--key value` pairs.
pub async fn run(rt: &Arc<Runtime>, name: Option<String>, args: Vec<String>) -> Result<i32> {
    let Some(name) = name else {
        println!("{USAGE}");
        return Ok(2);
    };

    let input = match parse_args(&args) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("{e}");
            return Ok(2);
        }
    };

    let known = crate::tools::builtin_specs()
        .iter()
        .any(|spec| spec.name == name);
    if !known {
        eprintln!("unknown tool: {name}");
        return Ok(1);
    }

    let result = crate::tools::execute(rt, &name, input).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    let failed = result.get("error").is_some();
    Ok(if failed { 1 } else { 0 })
}

/// A single JSON argument wins; otherwise `--key value` pairs become an
/// object, with values parsed as JSON when they look like it.
fn parse_args(args: &[String]) -> Result<Value> {
    if args.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    if args.len() == 1 && args[0].trim_start().starts_with('{') {
        return serde_json::from_str(&args[0])
            .map_err(|e| anyhow::anyhow!("invalid JSON input: {e}"));
    }

    let mut object = Map::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let Some(key) = arg.strip_prefix("--") else {
            anyhow::bail!("expected --key, got '{arg}'\n{USAGE}");
        };
        let value = match iter.peek() {
            Some(next) if !next.starts_with("--") => {
                let raw = iter.next().expect("peeked");
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            _ => Value::Bool(true),
        };
        object.insert(key.to_string(), value);
    }
    Ok(Value::Object(object))
}
