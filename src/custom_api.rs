// Third-party upstream dispatch for custom API accounts.
//
// format=openai translates the request into the chat-completions dialect
// and converts the response stream back; format=claude passes the
// Anthropic request through untouched apart from the Azure scrub. One
// 429 retry is attempted, honoring Retry-After up to five seconds.

use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

use crate::converters::anthropic_to_openai;
use crate::converters::azure::scrub_request;
use crate::converters::openai_to_anthropic::{convert_error, StreamConverter};
use crate::error::ApiError;
use crate::models::anthropic::AnthropicMessagesRequest;
use crate::store::CustomAccount;

const RETRY_AFTER_CAP: Duration = Duration::from_secs(5);

pub struct CustomApiDispatcher {
    client: reqwest::Client,
}

impl CustomApiDispatcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Dispatch a request to the account's upstream and return the
    /// response as Anthropic SSE strings.
    pub async fn dispatch(
        &self,
        account: &CustomAccount,
        api_key: &str,
        request: &AnthropicMessagesRequest,
        raw_request: &Value,
        estimated_input_tokens: i32,
    ) -> Result<BoxStream<'static, String>, ApiError> {
        tracing::info!(
            account_id = account.id,
            format = %account.format,
            provider = account.provider.as_deref().unwrap_or(""),
            api_base = %account.api_base,
            "Dispatching to custom API"
        );

        if account.format == "claude" {
            self.dispatch_claude(account, api_key, raw_request).await
        } else {
            self.dispatch_openai(account, api_key, request, estimated_input_tokens)
                .await
        }
    }

    async fn dispatch_openai(
        &self,
        account: &CustomAccount,
        api_key: &str,
        request: &AnthropicMessagesRequest,
        estimated_input_tokens: i32,
    ) -> Result<BoxStream<'static, String>, ApiError> {
        let upstream_model = upstream_model(account, &request.model);
        let (mut openai_request, thinking_enabled) =
            anthropic_to_openai::convert_request(request, &upstream_model);
        openai_request.stream = true;

        let url = chat_completions_url(&account.api_base);
        let body = serde_json::to_value(&openai_request)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("serialize request: {}", e)))?;

        // Azure OpenAI deployments authenticate with an api-key header
        let azure = account.provider.as_deref() == Some("azure");
        let response = self
            .send_with_retry(|| {
                let builder = self
                    .client
                    .post(&url)
                    .header("Content-Type", "application/json");
                let builder = if azure {
                    builder.header("api-key", api_key)
                } else {
                    builder.header("Authorization", format!("Bearer {}", api_key))
                };
                builder.json(&body)
            })
            .await?;

        struct PumpState {
            bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
            converter: StreamConverter,
            pending: VecDeque<String>,
            finished: bool,
        }

        let state = PumpState {
            bytes: response.bytes_stream().boxed(),
            converter: StreamConverter::new(&request.model, estimated_input_tokens, thinking_enabled),
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.converter.feed(&chunk));
                    }
                    Some(Err(e)) => {
                        // The message cannot complete; surface the error
                        // event and stop instead of fabricating an ending
                        tracing::warn!("Custom API stream error: {}", e);
                        state.pending.push_back(
                            ApiError::UpstreamError {
                                status: 502,
                                message: format!("Upstream stream error: {}", e),
                            }
                            .to_sse_events(),
                        );
                        state.finished = true;
                    }
                    None => {
                        state.pending.extend(state.converter.finish());
                        state.finished = true;
                    }
                }
            }
        })
        .boxed())
    }

    async fn dispatch_claude(
        &self,
        account: &CustomAccount,
        api_key: &str,
        raw_request: &Value,
    ) -> Result<BoxStream<'static, String>, ApiError> {
        let body = if account.provider.as_deref() == Some("azure") {
            scrub_request(raw_request)
        } else {
            raw_request.clone()
        };

        let url = format!("{}/v1/messages", account.api_base.trim_end_matches('/'));
        let response = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
            })
            .await?;

        // Passthrough with frame re-chunking on event boundaries
        struct PumpState {
            bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
            buffer: String,
            pending: VecDeque<String>,
            finished: bool,
        }

        let state = PumpState {
            bytes: response.bytes_stream().boxed(),
            buffer: String::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(boundary) = state.buffer.find("\n\n") {
                            let event: String = state.buffer.drain(..boundary + 2).collect();
                            if !event.trim().is_empty() {
                                state.pending.push_back(event);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Custom API (claude) stream error: {}", e);
                        state.pending.push_back(
                            ApiError::UpstreamError {
                                status: 502,
                                message: format!("Upstream stream error: {}", e),
                            }
                            .to_sse_events(),
                        );
                        state.finished = true;
                    }
                    None => {
                        if !state.buffer.trim().is_empty() {
                            let tail = std::mem::take(&mut state.buffer);
                            state.pending.push_back(tail + "\n\n");
                        }
                        state.finished = true;
                    }
                }
            }
        })
        .boxed())
    }

    /// Send the request; a single 429 is retried after Retry-After
    /// (capped), any other failure maps to an upstream error.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retried = false;
        loop {
            let response = build().send().await.map_err(|e| {
                let kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection failed"
                } else {
                    "request error"
                };
                ApiError::UpstreamError {
                    status: 502,
                    message: format!("Custom API {}: {}", kind, e),
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status.as_u16() == 429 && !retried {
                let delay = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                    .map(Duration::from_secs_f64)
                    .unwrap_or(Duration::from_secs(1))
                    .min(RETRY_AFTER_CAP);

                tracing::warn!("Custom API returned 429, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                retried = true;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), "Custom API error: {}", body);

            let error_json: Value = serde_json::from_str(&body).unwrap_or_else(|_| {
                serde_json::json!({"error": {"message": body, "type": "api_error"}})
            });
            let anthropic_error = convert_error(&error_json, status.as_u16());

            return Err(ApiError::UpstreamError {
                status: status.as_u16(),
                message: anthropic_error["error"]["message"]
                    .as_str()
                    .unwrap_or("Upstream error")
                    .to_string(),
            });
        }
    }
}

/// Pick the model name to send upstream: the requested name when the
/// account's binding list contains it, else the account's first binding,
/// else the requested name untouched.
fn upstream_model(account: &CustomAccount, requested: &str) -> String {
    let Some(raw) = account.model.as_deref() else {
        return requested.to_string();
    };
    let bindings: Vec<&str> = raw.split(',').map(str::trim).filter(|m| !m.is_empty()).collect();
    if bindings.is_empty() || bindings.contains(&requested) {
        requested.to_string()
    } else {
        bindings[0].to_string()
    }
}

/// Normalize an api_base into the chat-completions endpoint; a trailing
/// /v1 is appended when missing.
fn chat_completions_url(api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, extract::State, routing::post, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn account(format: &str, api_base: String, provider: Option<&str>) -> CustomAccount {
        CustomAccount {
            id: 1,
            user_id: 1,
            name: None,
            api_base,
            format: format.into(),
            provider: provider.map(String::from),
            model: None,
            status: "active".into(),
            success_count: 0,
            fail_count: 0,
            created_at: 0,
        }
    }

    fn request() -> AnthropicMessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_chat_completions_url() {
        assert_eq!(
            chat_completions_url("https://x.example.com"),
            "https://x.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("https://x.example.com/v1/"),
            "https://x.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_upstream_model_selection() {
        let mut acc = account("openai", "https://x".into(), None);
        assert_eq!(upstream_model(&acc, "claude-sonnet-4"), "claude-sonnet-4");

        acc.model = Some("claude-opus-4-6, gpt-4o".into());
        assert_eq!(upstream_model(&acc, "claude-opus-4-6"), "claude-opus-4-6");
        assert_eq!(upstream_model(&acc, "other"), "claude-opus-4-6");
    }

    async fn spawn_app(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn openai_sse(texts: &[&str]) -> String {
        let mut out = String::new();
        for text in texts {
            out.push_str(&format!(
                "data: {}\n\n",
                json!({
                    "id": "c", "object": "chat.completion.chunk",
                    "choices": [{"index": 0, "delta": {"content": text}}]
                })
            ));
        }
        out.push_str("data: [DONE]\n\n");
        out
    }

    #[tokio::test]
    async fn test_openai_dialect_translation() {
        let body = openai_sse(&["hi", " there"]);
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let body = body.clone();
                async move { axum::response::Response::new(Body::from(body)) }
            }),
        );
        let base = spawn_app(app).await;

        let dispatcher = CustomApiDispatcher::new(reqwest::Client::new());
        let stream = dispatcher
            .dispatch(&account("openai", base, None), "sk-up", &request(), &json!({}), 5)
            .await
            .unwrap();

        let events: Vec<String> = stream.collect().await;
        let joined = events.join("");
        assert!(joined.contains("event: message_start"));
        assert!(joined.contains("\"text\":\"hi\""));
        assert!(joined.contains("\"text\":\" there\""));
        assert!(joined.contains("event: message_stop"));
    }

    #[tokio::test]
    async fn test_429_retried_once_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_app = hits.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let hits = hits_for_app.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        axum::response::Response::builder()
                            .status(429)
                            .header("retry-after", "0")
                            .body(Body::from("{\"error\":{\"message\":\"slow\"}}"))
                            .unwrap()
                    } else {
                        axum::response::Response::new(Body::from(openai_sse(&["ok"])))
                    }
                }
            }),
        );
        let base = spawn_app(app).await;

        let dispatcher = CustomApiDispatcher::new(reqwest::Client::new());
        let stream = dispatcher
            .dispatch(&account("openai", base, None), "sk", &request(), &json!({}), 1)
            .await
            .unwrap();
        let joined = stream.collect::<Vec<_>>().await.join("");
        assert!(joined.contains("\"text\":\"ok\""));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_429_twice_fails() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                axum::response::Response::builder()
                    .status(429)
                    .header("retry-after", "0")
                    .body(Body::from(
                        "{\"error\":{\"type\":\"rate_limit_error\",\"message\":\"limited\"}}",
                    ))
                    .unwrap()
            }),
        );
        let base = spawn_app(app).await;

        let dispatcher = CustomApiDispatcher::new(reqwest::Client::new());
        let err = match dispatcher
            .dispatch(&account("openai", base, None), "sk", &request(), &json!({}), 1)
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        match err {
            ApiError::UpstreamError { status, message } => {
                assert_eq!(status, 429);
                assert!(message.contains("limited"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_claude_passthrough_forwards_events() {
        let app = Router::new().route(
            "/v1/messages",
            post(|| async {
                axum::response::Response::new(Body::from(
                    "event: message_start\ndata: {\"type\":\"message_start\"}\n\n\
                     event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
                ))
            }),
        );
        let base = spawn_app(app).await;

        let dispatcher = CustomApiDispatcher::new(reqwest::Client::new());
        let stream = dispatcher
            .dispatch(
                &account("claude", base, None),
                "sk",
                &request(),
                &json!({"model": "claude-sonnet-4", "messages": []}),
                1,
            )
            .await
            .unwrap();
        let events: Vec<String> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("event: message_start"));
        assert!(events[1].starts_with("event: message_stop"));
    }

    #[tokio::test]
    async fn test_azure_scrub_applied_on_claude_passthrough() {
        let seen = Arc::new(Mutex::new(None::<Value>));
        let seen_for_app = seen.clone();
        let app = Router::new().route(
            "/v1/messages",
            post(move |State(seen): State<Arc<Mutex<Option<Value>>>>, body: String| async move {
                *seen.lock().unwrap() = serde_json::from_str(&body).ok();
                axum::response::Response::new(Body::from("event: message_stop\ndata: {}\n\n"))
            })
            .with_state(seen_for_app),
        );
        let base = spawn_app(app).await;

        let raw = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "q"}],
            "betas": ["x"],
            "context_management": {}
        });

        let dispatcher = CustomApiDispatcher::new(reqwest::Client::new());
        let stream = dispatcher
            .dispatch(&account("claude", base, Some("azure")), "sk", &request(), &raw, 1)
            .await
            .unwrap();
        let _ = stream.collect::<Vec<_>>().await;

        let body = seen.lock().unwrap().clone().unwrap();
        assert!(body.get("betas").is_none());
        assert!(body.get("context_management").is_none());
        assert_eq!(body["model"], "claude-sonnet-4");
    }
}
