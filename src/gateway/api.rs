use crate::runtime::Runtime;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn upstream_error(e: &anyhow::Error) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

pub async fn health() -> Response {
    Json(json!({
        "status": "ok",
        "engine": "bashclaw",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

pub async fn status(State(rt): State<Arc<Runtime>>) -> Response {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    Json(json!({
        "status": "ok",
        "hostname": hostname,
        "uptime_secs": rt.started_at.elapsed().as_secs(),
        "agents": rt.config.agent_ids().len(),
        "sessions": rt.sessions.list().map(|l| l.len()).unwrap_or(0),
        "cron_jobs": rt.cron.list().len(),
        "hooks_enabled": rt.hooks.enabled_count(),
        "memory_entries": rt.memory.count(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    message: Option<String>,
    agent: Option<String>,
    channel: Option<String>,
    sender: Option<String>,
}

/// `POST /api/chat` — run one agent turn. Autoreply rules short-circuit the
/// engine entirely.
pub async fn chat(State(rt): State<Arc<Runtime>>, body: Bytes) -> Response {
    if body.is_empty() {
        return bad_request("request body required");
    }
    let Ok(parsed) = serde_json::from_slice::<ChatBody>(&body) else {
        return bad_request("invalid JSON body");
    };
    let Some(message) = parsed.message.filter(|m| !m.is_empty()) else {
        return bad_request("message is required");
    };

    let channel = parsed.channel.unwrap_or_else(|| "web".to_string());
    if let Some(reply) = crate::routing::check(&rt.config, &message, Some(&channel)) {
        return Json(json!({ "message": reply, "autoreply": true })).into_response();
    }

    let agent_id = crate::routing::resolve_agent(&rt.config, parsed.agent.as_deref(), &channel);
    let timeout_ms = rt
        .config
        .get_u64("gateway.requestTimeoutMs")
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

    let request = crate::engine::RunRequest {
        agent_id,
        message,
        channel,
        sender: parsed.sender,
        is_subagent: false,
        deadline: Some(Instant::now() + Duration::from_millis(timeout_ms)),
    };
    match crate::engine::run(&rt, request).await {
        Ok(response) => Json(json!({ "message": response })).into_response(),
        Err(e) => upstream_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct SendBody {
    channel: Option<String>,
    recipient: Option<String>,
    message: Option<String>,
}

/// `POST /api/message/send` — queue an outbound message for a channel
/// adapter. Adapters are external processes draining `outbox/<channel>.jsonl`.
pub async fn message_send(State(rt): State<Arc<Runtime>>, body: Bytes) -> Response {
    if body.is_empty() {
        return bad_request("request body required");
    }
    let Ok(parsed) = serde_json::from_slice::<SendBody>(&body) else {
        return bad_request("invalid JSON body");
    };
    let Some(channel) = parsed.channel.filter(|c| !c.is_empty()) else {
        return bad_request("channel is required");
    };
    let Some(message) = parsed.message.filter(|m| !m.is_empty()) else {
        return bad_request("message is required");
    };
    if !rt.config.has_channel(&channel) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown channel: {channel}") })),
        )
            .into_response();
    }

    let entry = json!({
        "ts": crate::util::now_ms(),
        "channel": channel,
        "recipient": parsed.recipient,
        "message": message,
    });
    let result = (|| -> anyhow::Result<()> {
        std::fs::create_dir_all(&rt.outbox_dir)?;
        let path = rt
            .outbox_dir
            .join(format!("{}.jsonl", crate::memory::safe_filename(&channel)));
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(f, "{}", entry)?;
        Ok(())
    })();
    match result {
        Ok(()) => Json(json!({ "ok": true, "queued": true })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    path: Option<String>,
}

pub async fn config_get(
    State(rt): State<Arc<Runtime>>,
    Query(query): Query<ConfigQuery>,
) -> Response {
    match query.path {
        Some(path) => match rt.config.get(&path) {
            Some(value) => Json(json!({ "path": path, "value": value })).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("no value at {path}") })),
            )
                .into_response(),
        },
        None => Json((*rt.config.snapshot()).clone()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ConfigSetBody {
    path: Option<String>,
    value: Option<Value>,
}

pub async fn config_set(State(rt): State<Arc<Runtime>>, body: Bytes) -> Response {
    if body.is_empty() {
        return bad_request("request body required");
    }
    let Ok(parsed) = serde_json::from_slice::<ConfigSetBody>(&body) else {
        return bad_request("invalid JSON body");
    };
    let (Some(path), Some(value)) = (parsed.path, parsed.value) else {
        return bad_request("path and value are required");
    };
    if let Err(e) = rt.config.validate_with(&path, value.clone()) {
        return bad_request(&e.to_string());
    }
    if let Err(e) = rt.config.backup() {
        tracing::debug!("config backup skipped: {e}");
    }
    match rt.config.set(&path, value) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => bad_request(&e.to_string()),
    }
}

pub async fn sessions_list(State(rt): State<Arc<Runtime>>) -> Response {
    match rt.sessions.list() {
        Ok(sessions) => Json(json!({ "sessions": sessions })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SessionClearBody {
    agent: Option<String>,
    channel: Option<String>,
    sender: Option<String>,
}

pub async fn sessions_clear(State(rt): State<Arc<Runtime>>, body: Bytes) -> Response {
    let Ok(parsed) = serde_json::from_slice::<SessionClearBody>(&body) else {
        return bad_request("invalid JSON body");
    };
    let Some(agent) = parsed.agent.filter(|a| !a.is_empty()) else {
        return bad_request("agent is required");
    };
    let channel = parsed.channel.unwrap_or_else(|| "web".to_string());
    let scope = crate::routing::effective_scope(&rt.config, false);
    let file = rt
        .sessions
        .file(scope, &agent, &channel, parsed.sender.as_deref());
    match rt.sessions.clear(&file) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn cron_jobs(State(rt): State<Arc<Runtime>>) -> Response {
    let jobs: Vec<Value> = rt
        .cron
        .list()
        .into_iter()
        .map(|job| {
            let due = crate::cron::next_run(&job.schedule, job.last_run_at);
            let mut value = serde_json::to_value(&job).unwrap_or_else(|_| json!({}));
            if let Some(obj) = value.as_object_mut() {
                obj.insert("nextRunAt".to_string(), json!(due));
            }
            value
        })
        .collect();
    Json(json!({ "jobs": jobs })).into_response()
}
