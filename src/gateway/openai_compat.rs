use crate::runtime::Runtime;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Public model-name prefixes that map to the default agent: clients often
/// hardcode a catalogue name they know, and still mean "talk to the bot".
const PUBLIC_MODEL_PREFIXES: &[&str] = &[
    "gpt-", "o1", "o3", "chatgpt", "claude-", "gemini-", "llama", "mistral", "deepseek", "qwen",
];

fn shim_error(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": { "message": message, "type": "invalid_request_error" }
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct CompletionsBody {
    model: Option<String>,
    #[serde(default)]
    stream: bool,
    messages: Option<Vec<ShimMessage>>,
}

#[derive(Debug, Deserialize)]
struct ShimMessage {
    role: Option<String>,
    content: Option<String>,
}

/// Which agent a `model` value addresses: an explicit `agent:` prefix wins,
/// known public model names go to `main`, anything else is taken as an
/// agent id verbatim.
fn agent_for_model(model: Option<&str>) -> String {
    let Some(model) = model.filter(|m| !m.is_empty()) else {
        return "main".to_string();
    };
    if let Some(suffix) = model.strip_prefix("agent:") {
        return suffix.to_string();
    }
    let lowered = model.to_lowercase();
    if PUBLIC_MODEL_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return "main".to_string();
    }
    model.to_string()
}

/// Fold system messages into the last user message:
/// `[System: …]\n<user text>`.
fn fold_messages(messages: &[ShimMessage]) -> Option<String> {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role.as_deref() == Some("user"))?;
    let user_text = last_user.content.clone().unwrap_or_default();

    let system_text: Vec<String> = messages
        .iter()
        .filter(|m| m.role.as_deref() == Some("system"))
        .filter_map(|m| m.content.clone())
        .collect();
    if system_text.is_empty() {
        Some(user_text)
    } else {
        Some(format!("[System: {}]\n{}", system_text.join("\n"), user_text))
    }
}

/// `POST /v1/chat/completions` — OpenAI-compatibility shim over the engine.
/// No streaming.
pub async fn chat_completions(State(rt): State<Arc<Runtime>>, body: Bytes) -> Response {
    if body.is_empty() {
        return shim_error("request body required");
    }
    let Ok(parsed) = serde_json::from_slice::<CompletionsBody>(&body) else {
        return shim_error("invalid JSON body");
    };
    if parsed.stream {
        return shim_error("streaming not supported");
    }
    let messages = match &parsed.messages {
        Some(messages) if !messages.is_empty() => messages,
        _ => return shim_error("messages array is required"),
    };
    let Some(folded) = fold_messages(messages) else {
        return shim_error("no user message");
    };

    let agent_id = agent_for_model(parsed.model.as_deref());
    let request = crate::engine::RunRequest {
        agent_id,
        message: folded,
        channel: "openai".to_string(),
        sender: None,
        is_subagent: false,
        deadline: Some(Instant::now() + Duration::from_millis(120_000)),
    };
    match crate::engine::run(&rt, request).await {
        Ok(text) => Json(json!({
            "id": format!("chatcmpl-{}", crate::util::new_id()),
            "object": "chat.completion",
            "created": crate::util::now_ts_secs(),
            "model": parsed.model.unwrap_or_else(|| "bashclaw".to_string()),
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 }
        }))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": { "message": e.to_string(), "type": "upstream_error" } })),
        )
            .into_response(),
    }
}

/// `GET /v1/models` — static OpenAI-shaped catalogue: the configured agents
/// plus a generic entry.
pub async fn models(State(rt): State<Arc<Runtime>>) -> Response {
    let mut data: Vec<Value> = vec![json!({
        "id": "bashclaw",
        "object": "model",
        "owned_by": "bashclaw"
    })];
    for agent in rt.config.agent_ids() {
        data.push(json!({
            "id": format!("agent:{agent}"),
            "object": "model",
            "owned_by": "bashclaw"
        }));
    }
    Json(json!({ "object": "list", "data": data })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use crate::runtime::Runtime;

    async fn body_json(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn test_agent_for_model_rules() {
        assert_eq!(agent_for_model(Some("agent:helper")), "helper");
        assert_eq!(agent_for_model(Some("gpt-4o")), "main");
        assert_eq!(agent_for_model(Some("claude-sonnet-4")), "main");
        assert_eq!(agent_for_model(Some("gemini-pro")), "main");
        assert_eq!(agent_for_model(Some("my-custom-agent")), "my-custom-agent");
        assert_eq!(agent_for_model(None), "main");
        assert_eq!(agent_for_model(Some("")), "main");
    }

    #[tokio::test]
    async fn test_shim_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(dir.path(), Provider::mock_echo());

        let (status, body) =
            body_json(chat_completions(State(rt.clone()), Bytes::new()).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "request body required");

        let (_, body) = body_json(
            chat_completions(
                State(rt.clone()),
                Bytes::from(r#"{"model":"gpt-4o","stream":true,"messages":[{"role":"user","content":"x"}]}"#),
            )
            .await,
        )
        .await;
        assert_eq!(body["error"]["message"], "streaming not supported");

        let (_, body) = body_json(
            chat_completions(State(rt.clone()), Bytes::from(r#"{"model":"gpt-4o"}"#)).await,
        )
        .await;
        assert_eq!(body["error"]["message"], "messages array is required");

        let (_, body) = body_json(
            chat_completions(
                State(rt.clone()),
                Bytes::from(r#"{"model":"gpt-4o","messages":[]}"#),
            )
            .await,
        )
        .await;
        assert_eq!(body["error"]["message"], "messages array is required");

        let (_, body) = body_json(
            chat_completions(
                State(rt),
                Bytes::from(r#"{"model":"gpt-4o","messages":[{"role":"system","content":"only system"}]}"#),
            )
            .await,
        )
        .await;
        assert_eq!(body["error"]["message"], "no user message");
    }

    #[tokio::test]
    async fn test_shim_round_trip_with_system_fold() {
        let dir = tempfile::tempdir().unwrap();
        // The echo provider hands back exactly what the engine sent, which
        // is the folded prompt.
        let rt = Runtime::for_tests(dir.path(), Provider::mock_echo());

        let body = r#"{
            "model": "gpt-4o",
            "stream": false,
            "messages": [
                { "role": "system", "content": "you are a pirate" },
                { "role": "user", "content": "Hello" }
            ]
        }"#;
        let (status, value) =
            body_json(chat_completions(State(rt), Bytes::from(body)).await).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["object"], "chat.completion");
        assert!(value["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(value["model"], "gpt-4o");
        let content = value["choices"][0]["message"]["content"].as_str().unwrap();
        assert!(content.starts_with("[System: you are a pirate]\nHello"));
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["usage"]["total_tokens"], 0);
    }

    #[tokio::test]
    async fn test_models_catalogue_shape() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::for_tests(dir.path(), Provider::mock_text("x"));
        let (status, body) = body_json(models(State(rt)).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["object"], "list");
        let data = body["data"].as_array().unwrap();
        assert!(data.len() >= 2);
        for model in data {
            assert_eq!(model["object"], "model");
            assert!(model["id"].as_str().is_some());
            assert_eq!(model["owned_by"], "bashclaw");
        }
    }
}
