mod api;
mod openai_compat;

use crate::runtime::Runtime;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_embed::RustEmbed;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(RustEmbed)]
#[folder = "ui/dist/"]
struct Assets;

const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;

pub fn build_router(rt: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/status", get(api::status))
        .route("/api/chat", post(api::chat))
        .route("/api/message/send", post(api::message_send))
        .route("/api/config", get(api::config_get).post(api::config_set))
        .route("/api/config/set", post(api::config_set))
        .route("/api/sessions", get(api::sessions_list))
        .route("/api/sessions/clear", post(api::sessions_clear))
        .route("/api/cron/jobs", get(api::cron_jobs))
        .route("/v1/chat/completions", post(openai_compat::chat_completions))
        .route("/v1/models", get(openai_compat::models))
        .route("/ui", get(ui_handler))
        .route("/ui/", get(ui_handler))
        .route("/ui/{*path}", get(ui_handler))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(rt.clone(), guard))
        .with_state(rt)
}

pub async fn start_server(rt: Arc<Runtime>, port_override: Option<u16>) -> anyhow::Result<()> {
    let port =
        port_override.unwrap_or_else(|| rt.config.get_u64("gateway.port").unwrap_or(8800) as u16);
    let app = build_router(rt);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("gateway listening on http://localhost:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Paths that never require a token. `OPTIONS` preflights are exempt too.
fn is_exempt(path: &str, method: &Method) -> bool {
    if *method == Method::OPTIONS {
        return true;
    }
    path == "/health" || path == "/api/status" || path == "/ui" || path.starts_with("/ui/")
}

/// Bearer-or-raw token comparison. No configured token means open access.
fn auth_ok(expected: Option<&str>, authorization: Option<&str>) -> bool {
    let Some(expected) = expected.filter(|t| !t.is_empty()) else {
        return true;
    };
    let Some(header) = authorization else {
        return false;
    };
    header == expected || header.strip_prefix("Bearer ") == Some(expected)
}

/// The `Access-Control-Allow-Origin` value for a request, if any: `*` when
/// no origins are configured, the echoed origin on a match, nothing on a
/// mismatch.
fn cors_allow_origin(configured: Option<&Vec<String>>, origin: Option<&str>) -> Option<String> {
    match configured {
        None => Some("*".to_string()),
        Some(allowed) => {
            let origin = origin?;
            allowed
                .iter()
                .any(|o| o == origin)
                .then(|| origin.to_string())
        }
    }
}

async fn guard(State(rt): State<Arc<Runtime>>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let configured_origins: Option<Vec<String>> = rt
        .config
        .get("gateway.cors.origins")
        .and_then(|v| serde_json::from_value(v).ok());
    let allow_origin = cors_allow_origin(configured_origins.as_ref(), origin.as_deref());

    // Preflights get their answer before auth.
    if method == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors(&mut response, &allow_origin);
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Authorization, Content-Type"),
        );
        return response;
    }

    // Body-size ceiling, checked against the declared length.
    let max_body = rt
        .config
        .get_u64("gateway.maxBodySize")
        .unwrap_or(DEFAULT_MAX_BODY_SIZE);
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.map(|len| len > max_body).unwrap_or(false) {
        let mut response = (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "request body too large" })),
        )
            .into_response();
        apply_cors(&mut response, &allow_origin);
        return response;
    }

    if !is_exempt(&path, &method) {
        let token = rt.config.get_str("gateway.auth.token");
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !auth_ok(token.as_deref(), authorization) {
            let mut response = (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            )
                .into_response();
            apply_cors(&mut response, &allow_origin);
            return response;
        }
    }

    let mut response = next.run(req).await;
    apply_cors(&mut response, &allow_origin);
    response
}

fn apply_cors(response: &mut Response, allow_origin: &Option<String>) {
    if let Some(origin) = allow_origin {
        if let Ok(value) = HeaderValue::from_str(origin) {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response()
}

/// Serve the embedded UI. Any `..` in the path is refused outright.
async fn ui_handler(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches("/ui").trim_start_matches('/');
    if path.contains("..") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "path traversal" })),
        )
            .into_response();
    }
    let path = if path.is_empty() { "index.html" } else { path };

    match Assets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            Response::builder()
                .header(header::CONTENT_TYPE, mime.as_ref())
                .body(axum::body::Body::from(content.data))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        None => match Assets::get("index.html") {
            // Fallback to index.html for SPA routing
            Some(index) => Response::builder()
                .header(header::CONTENT_TYPE, "text/html")
                .body(axum::body::Body::from(index.data))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            None => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exempt_paths() {
        assert!(is_exempt("/health", &Method::GET));
        assert!(is_exempt("/api/status", &Method::GET));
        assert!(is_exempt("/ui/index.html", &Method::GET));
        assert!(is_exempt("/api/chat", &Method::OPTIONS));
        assert!(!is_exempt("/api/chat", &Method::POST));
        assert!(!is_exempt("/v1/models", &Method::GET));
    }

    #[test]
    fn test_auth_token_matching() {
        assert!(auth_ok(None, None));
        assert!(auth_ok(Some(""), None));
        assert!(auth_ok(Some("tok"), Some("tok")));
        assert!(auth_ok(Some("tok"), Some("Bearer tok")));
        assert!(!auth_ok(Some("tok"), Some("Bearer wrong")));
        assert!(!auth_ok(Some("tok"), Some("bearer tok")));
        assert!(!auth_ok(Some("tok"), None));
    }

    #[test]
    fn test_cors_decision() {
        // No configured origins: wildcard for everyone.
        assert_eq!(cors_allow_origin(None, None).unwrap(), "*");
        assert_eq!(cors_allow_origin(None, Some("https://a.example")).unwrap(), "*");

        let allowed = vec!["https://a.example".to_string()];
        // Match: echo the origin back.
        assert_eq!(
            cors_allow_origin(Some(&allowed), Some("https://a.example")).unwrap(),
            "https://a.example"
        );
        // Mismatch or missing origin: omit the header entirely.
        assert!(cors_allow_origin(Some(&allowed), Some("https://evil.example")).is_none());
        assert!(cors_allow_origin(Some(&allowed), None).is_none());
    }

    #[tokio::test]
    async fn test_ui_refuses_traversal() {
        let response = ui_handler("/ui/../secret".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("path traversal"));
    }

    #[tokio::test]
    async fn test_ui_serves_index() {
        let response = ui_handler("/ui".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.contains("html"));
    }
}
