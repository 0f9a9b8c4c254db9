//! Inbound webhook receiver.
//!
//! A catch-all HTTP listener: any method on any path is accepted,
//! decoded into a [`WebhookRequest`], and handed to the registered
//! [`HookHandler`]. The response is always `200 OK` so upstream
//! services never retry; delivery failures are the bridge's problem,
//! not the sender's.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::Router;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

/// Receiver settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Listen port, bound on all interfaces.
    pub port: u16,
}

/// A decoded inbound request.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// HTTP method.
    pub method: String,
    /// Request path with query string.
    pub path: String,
    /// `Host` header, if present.
    pub host: Option<String>,
    /// `Content-Type` header, if present.
    pub content_type: Option<String>,
    /// `User-Agent` header, if present.
    pub user_agent: Option<String>,
    /// When the request arrived.
    pub received_at: DateTime<Utc>,
    /// Body decoded according to its content type.
    pub body: String,
}

/// Consumer of decoded webhook requests.
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Process one inbound request.
    async fn handle(&self, request: WebhookRequest) -> anyhow::Result<()>;
}

/// The catch-all listener. Owns the handler; [`serve`](Self::serve)
/// runs until the shutdown signal fires.
pub struct WebhookServer {
    config: WebhookConfig,
    handler: Arc<dyn HookHandler>,
}

impl WebhookServer {
    /// Create a server that forwards every request to `handler`.
    pub fn new(config: WebhookConfig, handler: Arc<dyn HookHandler>) -> Self {
        Self { config, handler }
    }

    /// Bind and serve until `shutdown` changes.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "webhook listener started");

        let app = router(Arc::clone(&self.handler));
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        info!("webhook listener stopped");
        Ok(())
    }
}

fn router(handler: Arc<dyn HookHandler>) -> Router {
    Router::new().fallback(receive).with_state(handler)
}

async fn receive(
    State(handler): State<Arc<dyn HookHandler>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    let request = build_request(&method, &uri, &headers, &body);
    if let Err(error) = handler.handle(request).await {
        warn!(%error, "webhook handler failed");
    }
    "OK"
}

fn build_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> WebhookRequest {
    let content_type = header_string(headers, "content-type");
    WebhookRequest {
        method: method.as_str().to_string(),
        path: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        host: header_string(headers, "host"),
        user_agent: header_string(headers, "user-agent"),
        received_at: Utc::now(),
        body: decode_body(content_type.as_deref(), body),
        content_type,
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decode a body for human reading.
///
/// JSON is pretty-printed, form bodies become `key: value` lines,
/// anything else passes through as (lossy) UTF-8.
fn decode_body(content_type: Option<&str>, body: &[u8]) -> String {
    let kind = content_type.unwrap_or("").to_ascii_lowercase();
    if kind.contains("application/json") {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                return pretty;
            }
        }
    } else if kind.contains("application/x-www-form-urlencoded") {
        return url::form_urlencoded::parse(body)
            .map(|(key, value)| format!("{key}: {value}"))
            .collect::<Vec<_>>()
            .join("\n");
    }
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;

    #[test]
    fn decode_json_pretty_prints() {
        let body = br#"{"event":"push","count":2}"#;
        let decoded = decode_body(Some("application/json"), body);
        assert!(decoded.contains("\"event\": \"push\""));
        assert!(decoded.contains('\n'), "pretty output spans lines");
    }

    #[test]
    fn decode_invalid_json_falls_back_to_raw() {
        let decoded = decode_body(Some("application/json"), b"not json");
        assert_eq!(decoded, "not json");
    }

    #[test]
    fn decode_form_body_as_key_value_lines() {
        let decoded = decode_body(
            Some("application/x-www-form-urlencoded"),
            b"name=alice&note=hi+there",
        );
        assert_eq!(decoded, "name: alice\nnote: hi there");
    }

    #[test]
    fn decode_unknown_content_type_is_raw_text() {
        let decoded = decode_body(Some("text/plain"), b"plain payload");
        assert_eq!(decoded, "plain payload");
    }

    #[test]
    fn decode_missing_content_type_is_raw_text() {
        let decoded = decode_body(None, b"bytes");
        assert_eq!(decoded, "bytes");
    }

    #[test]
    fn build_request_captures_headers_and_path() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("hooks.example.com"));
        headers.insert("user-agent", HeaderValue::from_static("GitHub-Hookshot"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let uri: Uri = "/github/push?ref=main".parse().expect("uri");
        let request = build_request(&Method::POST, &uri, &headers, br#"{"ok":true}"#);

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/github/push?ref=main");
        assert_eq!(request.host.as_deref(), Some("hooks.example.com"));
        assert_eq!(request.user_agent.as_deref(), Some("GitHub-Hookshot"));
        assert_eq!(request.content_type.as_deref(), Some("application/json"));
        assert!(request.body.contains("\"ok\": true"));
    }
}
