use crate::sessions::ChatTurn;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend that performs one LLM turn over an OpenAI-compatible
/// chat-completions endpoint.
///
/// Transport failures, 5xx and 429 are retried with jittered exponential
/// backoff; other non-2xx responses surface as `ChatResult::Error` so the
/// caller can inspect the body (context-overflow detection needs it).
pub struct Provider {
    kind: ProviderKind,
}

enum ProviderKind {
    Http {
        http: Client,
        base_url: String,
        api_key: Option<String>,
    },
    #[cfg(test)]
    Mock(mock::MockProvider),
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WireMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn from_turn(turn: &ChatTurn) -> Self {
        Self::text(&turn.role, turn.content.clone())
    }

    /// A `role:"tool"` message answering one tool call.
    pub fn tool_result(call_id: &str, result: &Value) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(result.to_string()),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallReq {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCallReq>,
    /// Assistant message as the wire saw it, echoed back into the
    /// conversation before tool results.
    pub assistant_tool_calls: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum ChatResult {
    Completion(Completion),
    /// Non-retryable provider error; `body` is the raw response document.
    Error { status: u16, body: String },
}

/// Marker error for retryable failures.
#[derive(Debug)]
struct Transient(String);

impl std::fmt::Display for Transient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Transient {}

impl Provider {
    pub fn http(base_url: String, api_key: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            kind: ProviderKind::Http {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
            },
        }
    }

    /// One chat turn. `tools` carries OpenAI-shaped tool specs when the
    /// caller wants tool calling.
    pub async fn chat(
        &self,
        model: &str,
        messages: &[WireMessage],
        tools: Option<&[Value]>,
    ) -> Result<ChatResult> {
        match &self.kind {
            ProviderKind::Http {
                http,
                base_url,
                api_key,
            } => {
                let url = format!("{}/chat/completions", base_url);
                let mut req = serde_json::json!({
                    "model": model,
                    "messages": messages,
                    "stream": false,
                });
                if let Some(tools) = tools {
                    if !tools.is_empty() {
                        req["tools"] = Value::Array(tools.to_vec());
                        req["tool_choice"] = Value::String("auto".to_string());
                    }
                }
                if let Some(last) = messages.last() {
                    tracing::debug!(
                        "Provider request: model={}, messages={}, last role={}",
                        model,
                        messages.len(),
                        last.role
                    );
                }

                crate::util::retry_with_backoff(
                    "provider chat",
                    |e| e.downcast_ref::<Transient>().is_some(),
                    || {
                        let http = http.clone();
                        let url = url.clone();
                        let req = req.clone();
                        let api_key = api_key.clone();
                        async move {
                            let mut rb = http.post(&url).json(&req);
                            if let Some(key) = &api_key {
                                if !key.is_empty() {
                                    rb = rb.header("Authorization", format!("Bearer {}", key));
                                }
                            }
                            let resp = rb
                                .send()
                                .await
                                .map_err(|e| anyhow::Error::new(Transient(e.to_string())))?;
                            let status = resp.status();
                            if status.as_u16() == 429 {
                                if let Some(secs) = resp
                                    .headers()
                                    .get("Retry-After")
                                    .and_then(|v| v.to_str().ok())
                                    .and_then(|v| v.parse::<u64>().ok())
                                {
                                    tokio::time::sleep(std::time::Duration::from_secs(
                                        secs.min(30),
                                    ))
                                    .await;
                                }
                                let body = resp.text().await.unwrap_or_default();
                                return Err(anyhow::Error::new(Transient(format!(
                                    "rate limited: {}",
                                    body
                                ))));
                            }
                            if status.is_server_error() {
                                let body = resp.text().await.unwrap_or_default();
                                return Err(anyhow::Error::new(Transient(format!(
                                    "provider {}: {}",
                                    status, body
                                ))));
                            }
                            if !status.is_success() {
                                let body = resp.text().await.unwrap_or_default();
                                return Ok(ChatResult::Error {
                                    status: status.as_u16(),
                                    body,
                                });
                            }
                            let body =
                                resp.text().await.context("failed to read provider body")?;
                            let payload: OaiChatResponse =
                                serde_json::from_str(&body).with_context(|| {
                                    format!("unexpected provider response: {:.200}", body)
                                })?;
                            Ok(ChatResult::Completion(parse_completion(payload)))
                        }
                    },
                )
                .await
            }
            #[cfg(test)]
            ProviderKind::Mock(mock) => mock.chat(messages),
        }
    }

    /// Plain text completion without tools; provider errors bail with the
    /// response body as the message.
    pub async fn chat_text(&self, model: &str, messages: &[ChatTurn]) -> Result<String> {
        let wire: Vec<WireMessage> = messages.iter().map(WireMessage::from_turn).collect();
        match self.chat(model, &wire, None).await? {
            ChatResult::Completion(c) => Ok(c.text),
            ChatResult::Error { status, body } => {
                anyhow::bail!("provider error ({}): {}", status, body)
            }
        }
    }
}

fn parse_completion(payload: OaiChatResponse) -> Completion {
    let Some(choice) = payload.choices.into_iter().next() else {
        return Completion::default();
    };
    let raw_calls = choice.message.tool_calls.clone();
    let tool_calls = choice
        .message
        .tool_calls
        .as_ref()
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id").and_then(|v| v.as_str())?.to_string();
                    let function = call.get("function")?;
                    let name = function.get("name").and_then(|v| v.as_str())?.to_string();
                    let arguments = function
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_else(|| serde_json::json!({}));
                    Some(ToolCallReq {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Completion {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        assistant_tool_calls: raw_calls,
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OaiChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Value>,
}

#[cfg(test)]
pub use mock::MockStep;

#[cfg(test)]
mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted provider for tests. Steps are consumed in order; once the
    /// script runs dry the fallback behavior answers every further call.
    #[derive(Debug, Clone)]
    pub enum MockStep {
        Text(String),
        ToolCall { name: String, arguments: Value },
        /// Provider-side context overflow (HTTP 413 with the canonical body).
        Overflow,
    }

    pub struct MockProvider {
        steps: Mutex<VecDeque<MockStep>>,
        fallback: Fallback,
        calls: Mutex<Vec<Vec<WireMessage>>>,
    }

    enum Fallback {
        Text(String),
        EchoLastUser,
    }

    impl MockProvider {
        pub fn chat(&self, messages: &[WireMessage]) -> Result<ChatResult> {
            self.calls
                .lock()
                .unwrap()
                .push(messages.to_vec());
            let step = self.steps.lock().unwrap().pop_front();
            let result = match step {
                Some(MockStep::Text(t)) => ChatResult::Completion(Completion {
                    text: t,
                    ..Default::default()
                }),
                Some(MockStep::ToolCall { name, arguments }) => {
                    let id = format!("call_{}", crate::util::short_id());
                    let raw = serde_json::json!([{
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments.to_string() }
                    }]);
                    ChatResult::Completion(Completion {
                        text: String::new(),
                        tool_calls: vec![ToolCallReq {
                            id,
                            name,
                            arguments,
                        }],
                        assistant_tool_calls: Some(raw),
                    })
                }
                Some(MockStep::Overflow) => ChatResult::Error {
                    status: 413,
                    body: r#"{"error":{"message":"request_too_large: prompt exceeds context window"}}"#
                        .to_string(),
                },
                None => match &self.fallback {
                    Fallback::Text(t) => ChatResult::Completion(Completion {
                        text: t.clone(),
                        ..Default::default()
                    }),
                    Fallback::EchoLastUser => {
                        let echoed = messages
                            .iter()
                            .rev()
                            .find(|m| m.role == "user")
                            .and_then(|m| m.content.clone())
                            .unwrap_or_default();
                        ChatResult::Completion(Completion {
                            text: echoed,
                            ..Default::default()
                        })
                    }
                },
            };
            Ok(result)
        }

        pub fn recorded_calls(&self) -> Vec<Vec<WireMessage>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Provider {
        /// Always answers `text`.
        pub fn mock_text(text: &str) -> Self {
            Self {
                kind: ProviderKind::Mock(MockProvider {
                    steps: Mutex::new(VecDeque::new()),
                    fallback: Fallback::Text(text.to_string()),
                    calls: Mutex::new(Vec::new()),
                }),
            }
        }

        /// Always echoes the newest user message.
        pub fn mock_echo() -> Self {
            Self {
                kind: ProviderKind::Mock(MockProvider {
                    steps: Mutex::new(VecDeque::new()),
                    fallback: Fallback::EchoLastUser,
                    calls: Mutex::new(Vec::new()),
                }),
            }
        }

        /// Consumes `steps` in order, then echoes user messages.
        pub fn mock_steps(steps: Vec<MockStep>) -> Self {
            Self {
                kind: ProviderKind::Mock(MockProvider {
                    steps: Mutex::new(steps.into()),
                    fallback: Fallback::EchoLastUser,
                    calls: Mutex::new(Vec::new()),
                }),
            }
        }

        /// Messages of every recorded mock call, oldest first.
        pub fn mock_calls(&self) -> Vec<Vec<WireMessage>> {
            match &self.kind {
                ProviderKind::Mock(mock) => mock.recorded_calls(),
                _ => panic!("mock_calls on a non-mock provider"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_text_and_recording() {
        let p = Provider::mock_text("hi");
        let out = p
            .chat_text("m", &[ChatTurn {
                role: "user".to_string(),
                content: "hello".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(out, "hi");
        let calls = p.mock_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_mock_steps_then_echo() {
        let p = Provider::mock_steps(vec![MockStep::Text("first".into())]);
        let msgs = [WireMessage::text("user", "question")];
        match p.chat("m", &msgs, None).await.unwrap() {
            ChatResult::Completion(c) => assert_eq!(c.text, "first"),
            other => panic!("unexpected {other:?}"),
        }
        match p.chat("m", &msgs, None).await.unwrap() {
            ChatResult::Completion(c) => assert_eq!(c.text, "question"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mock_overflow_result() {
        let p = Provider::mock_steps(vec![MockStep::Overflow]);
        match p.chat("m", &[WireMessage::text("user", "x")], None).await.unwrap() {
            ChatResult::Error { status, body } => {
                assert_eq!(status, 413);
                assert!(crate::sessions::detect_overflow(&body));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let payload: OaiChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "shell", "arguments": "{\"command\":\"ls\"}" }
                    }]
                }
            }]
        }))
        .unwrap();
        let completion = parse_completion(payload);
        assert_eq!(completion.text, "");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "shell");
        assert_eq!(
            completion.tool_calls[0].arguments["command"],
            serde_json::json!("ls")
        );
    }
}
