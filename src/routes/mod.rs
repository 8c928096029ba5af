// HTTP surface and per-request orchestration: authenticate the API key,
// allocate a credential, dispatch upstream, convert the stream, and
// record exactly one success/fail per outcome.

use axum::{
    body::Body,
    extract::{Path, State},
    http::HeaderMap,
    middleware::{self as axum_middleware, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::allocator::{Allocation, TokenAllocator};
use crate::auth::{oauth_state::OAuthStateRegistry, AuthManagerCache};
use crate::config::{is_supported_region, Config};
use crate::converters::anthropic_to_kiro::build_kiro_request;
use crate::custom_api::CustomApiDispatcher;
use crate::error::ApiError;
use crate::models::anthropic::{
    AnthropicMessagesRequest, AnthropicUsage, ContentBlock, CountTokensRequest,
};
use crate::store::{
    CredentialKind, CustomAccountPatch, NewCustomAccount, NewKiroToken, Store,
};
use crate::streaming::{
    buffered::buffered_sse_stream, collect_stream, kiro_event_stream, send_kiro_request,
    AnthropicSseBuilder, StreamEvent, CONTEXT_WINDOW_TOKENS,
};
use crate::tokenizer::estimate_input_tokens;

const VERSION: &str = env!("CARGO_PKG_VERSION");

static API_BASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://").expect("api_base regex"));

const ACCOUNT_FORMATS: &[&str] = &["openai", "claude"];
const ACCOUNT_STATUSES: &[&str] = &["active", "disabled"];

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub auth_cache: Arc<AuthManagerCache>,
    pub allocator: Arc<TokenAllocator>,
    pub dispatcher: Arc<CustomApiDispatcher>,
    pub oauth_states: Arc<OAuthStateRegistry>,
    pub http_client: reqwest::Client,
    pub config: Arc<Config>,
}

/// The user resolved from the request's API key
#[derive(Clone, Copy, Debug)]
pub struct AuthedUser {
    pub id: i64,
}

// ==================================================================================================
// Router assembly
// ==================================================================================================

pub fn build_app(state: AppState) -> Router {
    let health = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler));

    let messages = Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .route("/cc/v1/messages", post(buffered_messages_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    let user_api = Router::new()
        .route(
            "/user/api/custom-apis",
            get(list_custom_apis).post(create_custom_api),
        )
        .route(
            "/user/api/custom-apis/:id",
            put(update_custom_api).delete(delete_custom_api),
        )
        .route(
            "/user/api/custom-apis/:id/status",
            axum::routing::patch(patch_custom_api_status),
        )
        .route("/user/api/tokens", get(list_tokens).post(create_token))
        .route("/user/api/tokens/:id", delete(delete_token))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    let admin_api = Router::new()
        .route("/admin/api/custom-apis", get(admin_list_custom_apis))
        .route(
            "/admin/api/custom-apis/:id",
            put(admin_update_custom_api).delete(admin_delete_custom_api),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            admin_middleware,
        ))
        .with_state(state);

    Router::new()
        .merge(health)
        .merge(messages)
        .merge(user_api)
        .merge(admin_api)
}

// ==================================================================================================
// Middleware
// ==================================================================================================

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Resolve the client API key to a user; 401 on miss
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let key = extract_api_key(request.headers())
        .ok_or_else(|| ApiError::AuthError("Missing API key".to_string()))?;

    let user = state
        .store
        .get_user_by_api_key(&key)?
        .ok_or_else(|| {
            tracing::warn!(
                "{} {} with unknown API key",
                request.method(),
                request.uri().path()
            );
            ApiError::AuthError("Invalid API key".to_string())
        })?;

    request.extensions_mut().insert(AuthedUser { id: user.id });
    Ok(next.run(request).await)
}

/// Admin routes are gated by the dedicated admin key
pub async fn admin_middleware(
    State(state): State<AppState>,
    request: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.config.admin_api_key else {
        return Err(ApiError::AuthError("Admin API disabled".to_string()));
    };
    let key = extract_api_key(request.headers())
        .ok_or_else(|| ApiError::AuthError("Missing API key".to_string()))?;
    if &key != expected {
        return Err(ApiError::AuthError("Invalid admin key".to_string()));
    }
    Ok(next.run(request).await)
}

// ==================================================================================================
// Health
// ==================================================================================================

async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "KiroGate is running",
        "version": VERSION
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

// ==================================================================================================
// Outcome accounting
// ==================================================================================================

/// Records exactly one counter per request outcome; dropping without
/// success (client disconnect, stream error) records a fail.
struct CounterGuard {
    store: Arc<Store>,
    kind: CredentialKind,
    id: i64,
    settled: bool,
}

impl CounterGuard {
    fn new(store: Arc<Store>, kind: CredentialKind, id: i64) -> Self {
        Self {
            store,
            kind,
            id,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        if let Err(e) = self.store.increment_success(self.kind, self.id) {
            tracing::error!("Failed to record success for {:?} {}: {}", self.kind, self.id, e);
        }
    }

    fn fail(mut self) {
        self.settled = true;
        if let Err(e) = self.store.increment_fail(self.kind, self.id) {
            tracing::error!("Failed to record fail for {:?} {}: {}", self.kind, self.id, e);
        }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        if !self.settled {
            if let Err(e) = self.store.increment_fail(self.kind, self.id) {
                tracing::error!("Failed to record fail for {:?} {}: {}", self.kind, self.id, e);
            }
        }
    }
}

/// Wrap an SSE stream so the guard settles when it completes: success on
/// clean end, fail when an error event was emitted or the client
/// disconnected mid-stream (the guard drops unsettled).
fn with_counters(
    stream: impl Stream<Item = String> + Send + 'static,
    guard: CounterGuard,
) -> impl Stream<Item = String> + Send + 'static {
    struct WrapState<S> {
        inner: S,
        guard: Option<CounterGuard>,
        saw_error: bool,
    }

    futures::stream::unfold(
        WrapState {
            inner: Box::pin(stream),
            guard: Some(guard),
            saw_error: false,
        },
        |mut state| async move {
            match state.inner.next().await {
                Some(item) => {
                    if item.starts_with("event: error") {
                        state.saw_error = true;
                    }
                    Some((item, state))
                }
                None => {
                    if let Some(guard) = state.guard.take() {
                        if state.saw_error {
                            guard.fail();
                        } else {
                            guard.success();
                        }
                    }
                    None
                }
            }
        },
    )
}

// ==================================================================================================
// Messages orchestration
// ==================================================================================================

async fn messages_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(raw): Json<Value>,
) -> Response {
    handle_messages(state, user, raw, false).await
}

async fn buffered_messages_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(raw): Json<Value>,
) -> Response {
    handle_messages(state, user, raw, true).await
}

async fn handle_messages(state: AppState, user: AuthedUser, raw: Value, buffered: bool) -> Response {
    let request: AnthropicMessagesRequest = match serde_json::from_value(raw.clone()) {
        Ok(request) => request,
        Err(e) => {
            return ApiError::ValidationError(format!("Invalid request body: {}", e))
                .into_response()
        }
    };

    let streaming = request.stream;
    match dispatch_with_retry(&state, user.id, &request, &raw, buffered).await {
        Ok(response) => response,
        Err(error) => error_response(error, streaming),
    }
}

/// Serialize an error per the client's transport: SSE body for streaming
/// requests, JSON body otherwise. The HTTP status always matches.
fn error_response(error: ApiError, streaming: bool) -> Response {
    if !streaming {
        return error.into_response();
    }
    let body = error.to_sse_events();
    let status = error.into_response().status();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        "Content-Type",
        axum::http::HeaderValue::from_static("text/event-stream"),
    );
    response.headers_mut().insert(
        "Cache-Control",
        axum::http::HeaderValue::from_static("no-cache"),
    );
    response
}

/// Allocate, dispatch, and retry once with a different credential when
/// the first one fails with a retryable error.
async fn dispatch_with_retry(
    state: &AppState,
    user_id: i64,
    request: &AnthropicMessagesRequest,
    raw: &Value,
    buffered: bool,
) -> Result<Response, ApiError> {
    let estimated_input = estimate_input_tokens(
        &request.messages,
        request.system.as_ref(),
        request.tools.as_ref().map(|t| t.as_slice()),
    );

    let mut last_error: Option<ApiError> = None;
    for attempt in 0..2 {
        let allocation = state.allocator.get_best_token(user_id, &request.model)?;

        match allocation {
            Allocation::Kiro { token, manager } => {
                let guard =
                    CounterGuard::new(state.store.clone(), CredentialKind::Kiro, token.id);
                match run_kiro(state, &manager, request, estimated_input, buffered, guard).await {
                    Ok(response) => return Ok(response),
                    Err(error) => {
                        let retryable = match &error {
                            ApiError::UpstreamAuth { kind, .. } => {
                                if kind.is_fatal() {
                                    tracing::warn!(
                                        token_id = token.id,
                                        "Marking token invalid after {:?} refresh failure",
                                        kind
                                    );
                                    let _ = state.store.set_token_status(token.id, "invalid");
                                    state.auth_cache.remove(&token.token_hash);
                                }
                                true
                            }
                            ApiError::FirstTokenTimeout(_) => true,
                            _ => false,
                        };
                        if retryable && attempt == 0 {
                            tracing::info!("Retrying with a different credential");
                            last_error = Some(error);
                            continue;
                        }
                        return Err(error);
                    }
                }
            }
            Allocation::Custom { account } => {
                let api_key = state
                    .store
                    .get_custom_api_key(account.id)?
                    .ok_or_else(|| {
                        ApiError::NoCredentialAvailable("Account key disappeared".to_string())
                    })?;

                let guard =
                    CounterGuard::new(state.store.clone(), CredentialKind::Custom, account.id);
                match state
                    .dispatcher
                    .dispatch(&account, &api_key, request, raw, estimated_input)
                    .await
                {
                    Ok(sse) => {
                        if request.stream {
                            return Ok(sse_response(with_counters(sse, guard)));
                        }
                        let events: Vec<String> = sse.collect().await;
                        let ok = !events.iter().any(|e| e.starts_with("event: error"));
                        if ok {
                            guard.success();
                        } else {
                            guard.fail();
                        }
                        return Ok(Json(aggregate_sse(&events, &request.model)).into_response());
                    }
                    Err(error) => {
                        guard.fail();
                        return Err(error);
                    }
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ApiError::NoCredentialAvailable("No credential available after retry".to_string())
    }))
}

async fn run_kiro(
    state: &AppState,
    manager: &crate::auth::AuthManager,
    request: &AnthropicMessagesRequest,
    estimated_input: i32,
    buffered: bool,
    guard: CounterGuard,
) -> Result<Response, ApiError> {
    let profile_arn = manager
        .profile_arn()
        .await
        .or_else(|| state.config.fallback.profile_arn.clone());
    let payload = build_kiro_request(request, profile_arn);

    let response = send_kiro_request(&state.http_client, manager, &payload).await?;
    let events = kiro_event_stream(
        response,
        state.config.first_token_timeout,
        state.config.stream_read_timeout,
    )
    .await?;

    if !request.stream {
        let collected = collect_stream(Box::pin(events)).await;
        return match collected {
            Ok(collected) => {
                let mut content: Vec<ContentBlock> = Vec::new();
                if !collected.thinking.is_empty() {
                    content.push(ContentBlock::Thinking {
                        thinking: collected.thinking.clone(),
                        signature: String::new(),
                    });
                }
                if !collected.text.is_empty() {
                    content.push(ContentBlock::Text {
                        text: collected.text.clone(),
                    });
                }
                for tool in &collected.tool_uses {
                    content.push(ContentBlock::ToolUse {
                        id: tool.tool_use_id.clone(),
                        name: tool.name.clone(),
                        input: tool.input.clone(),
                    });
                }

                let (input_tokens, output_tokens) = resolve_usage(
                    collected.usage,
                    collected.context_usage,
                    estimated_input,
                    collected.text.len() + collected.thinking.len(),
                );

                let mut message = crate::models::anthropic::AnthropicMessagesResponse::new(
                    crate::converters::generate_message_id(),
                    request.model.clone(),
                    content,
                    AnthropicUsage::new(input_tokens, output_tokens),
                );
                message.stop_reason = Some(
                    if collected.tool_uses.is_empty() {
                        "end_turn"
                    } else {
                        "tool_use"
                    }
                    .to_string(),
                );

                guard.success();
                Ok(Json(message).into_response())
            }
            Err(error) => {
                guard.fail();
                Err(error)
            }
        };
    }

    if buffered {
        let stream =
            buffered_sse_stream(events.boxed(), request.model.clone(), estimated_input);
        return Ok(sse_response(with_counters(stream, guard)));
    }

    // Live forwarding
    let mut builder = AnthropicSseBuilder::new(&request.model);
    let head = builder.message_start(estimated_input);

    struct LiveState<S> {
        events: S,
        builder: AnthropicSseBuilder,
        head: Option<String>,
        finished: bool,
    }

    let live = futures::stream::unfold(
        LiveState {
            events: Box::pin(events),
            builder,
            head: Some(head),
            finished: false,
        },
        |mut state| async move {
            if let Some(head) = state.head.take() {
                return Some((head, state));
            }
            loop {
                if state.finished {
                    return None;
                }
                match state.events.next().await {
                    Some(Ok(event)) => {
                        let out = state.builder.on_event(&event);
                        if out.is_empty() {
                            continue;
                        }
                        return Some((out.join(""), state));
                    }
                    Some(Err(error)) => {
                        state.finished = true;
                        return Some((error.to_sse_events(), state));
                    }
                    None => {
                        state.finished = true;
                        let output_tokens = match state.builder.usage {
                            Some((_, output)) if output > 0 => output,
                            _ => (state.builder.output_text_len / 4).max(1) as i32,
                        };
                        return Some((state.builder.finish(output_tokens).join(""), state));
                    }
                }
            }
        },
    );

    Ok(sse_response(with_counters(live, guard)))
}

fn resolve_usage(
    usage: Option<(i32, i32)>,
    context_usage: Option<f64>,
    estimated_input: i32,
    output_len: usize,
) -> (i32, i32) {
    let input = match (usage, context_usage) {
        (Some((input, _)), _) if input > 0 => input,
        (_, Some(pct)) if pct > 0.0 => (pct * CONTEXT_WINDOW_TOKENS / 100.0).round() as i32,
        _ => estimated_input,
    };
    let output = match usage {
        Some((_, output)) if output > 0 => output,
        _ => (output_len / 4).max(1) as i32,
    };
    (input, output)
}

fn sse_response(stream: impl Stream<Item = String> + Send + 'static) -> Response {
    let body = Body::from_stream(
        stream.map(|event| Ok::<_, std::convert::Infallible>(Bytes::from(event))),
    );
    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .expect("static response parts")
}

/// Fold translated SSE events back into a single Anthropic message for
/// non-streaming clients of custom upstreams.
fn aggregate_sse(events: &[String], model: &str) -> Value {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tools: Vec<Value> = Vec::new();
    let mut current_tool: Option<(String, String, String)> = None;
    let mut usage = json!({"input_tokens": 0, "output_tokens": 0});
    let mut stop_reason = "end_turn".to_string();

    for event in events {
        let Some(data) = event.split("data: ").nth(1) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(data.trim()) else {
            continue;
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("content_block_start") => {
                let block = &value["content_block"];
                if block["type"] == "tool_use" {
                    current_tool = Some((
                        block["id"].as_str().unwrap_or_default().to_string(),
                        block["name"].as_str().unwrap_or_default().to_string(),
                        String::new(),
                    ));
                }
            }
            Some("content_block_delta") => match value["delta"]["type"].as_str() {
                Some("text_delta") => {
                    text.push_str(value["delta"]["text"].as_str().unwrap_or(""))
                }
                Some("thinking_delta") => {
                    thinking.push_str(value["delta"]["thinking"].as_str().unwrap_or(""))
                }
                Some("input_json_delta") => {
                    if let Some((_, _, args)) = &mut current_tool {
                        args.push_str(value["delta"]["partial_json"].as_str().unwrap_or(""));
                    }
                }
                _ => {}
            },
            Some("content_block_stop") => {
                if let Some((id, name, args)) = current_tool.take() {
                    let input: Value =
                        serde_json::from_str(&args).unwrap_or_else(|_| json!({}));
                    tools.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
                }
            }
            Some("message_delta") => {
                if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                    stop_reason = reason.to_string();
                }
                if value.get("usage").is_some() {
                    usage = value["usage"].clone();
                }
            }
            _ => {}
        }
    }

    let mut content: Vec<Value> = Vec::new();
    if !thinking.is_empty() {
        content.push(json!({"type": "thinking", "thinking": thinking, "signature": ""}));
    }
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    content.extend(tools);

    json!({
        "id": crate::converters::generate_message_id(),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": usage
    })
}

// ==================================================================================================
// count_tokens
// ==================================================================================================

async fn count_tokens_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(request): Json<CountTokensRequest>,
) -> Result<Json<Value>, ApiError> {
    let estimate = estimate_input_tokens(
        &request.messages,
        request.system.as_ref(),
        request.tools.as_ref().map(|t| t.as_slice()),
    );

    // A Kiro credential allows an exact probe; anything else falls back
    // to the local estimate.
    let input_tokens = match state.allocator.get_best_token(user.id, &request.model) {
        Ok(Allocation::Kiro { manager, .. }) => {
            match probe_input_tokens(&state, &manager, &request).await {
                Some(exact) => exact,
                None => estimate,
            }
        }
        _ => estimate,
    };

    Ok(Json(json!({"input_tokens": input_tokens})))
}

/// Short upstream probe: send the conversation with a minimal budget and
/// read only as far as the first usage signal.
async fn probe_input_tokens(
    state: &AppState,
    manager: &crate::auth::AuthManager,
    request: &CountTokensRequest,
) -> Option<i32> {
    let probe_request = AnthropicMessagesRequest {
        model: request.model.clone(),
        messages: request.messages.clone(),
        max_tokens: 1,
        system: request.system.clone(),
        stream: true,
        thinking: None,
        tools: request.tools.clone(),
        tool_choice: None,
        temperature: None,
        top_p: None,
        top_k: None,
        stop_sequences: None,
        metadata: None,
    };
    let payload = build_kiro_request(&probe_request, manager.profile_arn().await);

    let probe = async {
        let response = send_kiro_request(&state.http_client, manager, &payload)
            .await
            .ok()?;
        let mut events = Box::pin(
            kiro_event_stream(response, state.config.first_token_timeout, 30)
                .await
                .ok()?,
        );
        while let Some(event) = events.next().await {
            match event {
                Ok(StreamEvent::Usage { input_tokens, .. }) if input_tokens > 0 => {
                    return Some(input_tokens)
                }
                Ok(StreamEvent::ContextUsage(pct)) if pct > 0.0 => {
                    return Some((pct * CONTEXT_WINDOW_TOKENS / 100.0).round() as i32)
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    };

    match tokio::time::timeout(std::time::Duration::from_secs(20), probe).await {
        Ok(result) => result,
        Err(_) => None,
    }
}

// ==================================================================================================
// Custom API account CRUD
// ==================================================================================================

#[derive(Debug, Deserialize)]
struct CreateCustomApiBody {
    name: Option<String>,
    api_base: String,
    api_key: String,
    format: String,
    provider: Option<String>,
    model: Option<String>,
}

fn validate_api_base(api_base: &str) -> Result<(), ApiError> {
    if !API_BASE_RE.is_match(api_base) {
        return Err(ApiError::ValidationError(
            "api_base must start with http:// or https://".to_string(),
        ));
    }
    Ok(())
}

fn validate_format(format: &str) -> Result<(), ApiError> {
    if !ACCOUNT_FORMATS.contains(&format) {
        return Err(ApiError::ValidationError(
            "format must be one of: openai, claude".to_string(),
        ));
    }
    Ok(())
}

fn account_json(account: &crate::store::CustomAccount) -> Value {
    json!({
        "id": account.id,
        "name": account.name,
        "api_base": account.api_base,
        "format": account.format,
        "provider": account.provider,
        "model": account.model,
        "status": account.status,
        "success_count": account.success_count,
        "fail_count": account.fail_count,
        "created_at": account.created_at,
    })
}

async fn list_custom_apis(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<Value>, ApiError> {
    let accounts = state.store.get_custom_accounts_by_user(user.id)?;
    Ok(Json(json!({
        "accounts": accounts.iter().map(account_json).collect::<Vec<_>>()
    })))
}

async fn create_custom_api(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<CreateCustomApiBody>,
) -> Result<Json<Value>, ApiError> {
    validate_api_base(&body.api_base)?;
    validate_format(&body.format)?;
    if body.api_key.is_empty() {
        return Err(ApiError::ValidationError("api_key is required".to_string()));
    }

    let id = state.store.create_custom_account(
        user.id,
        &NewCustomAccount {
            name: body.name,
            api_base: body.api_base,
            api_key: body.api_key,
            format: body.format,
            provider: body.provider,
            model: body.model,
        },
    )?;

    Ok(Json(json!({"id": id})))
}

fn validate_patch(patch: &CustomAccountPatch) -> Result<(), ApiError> {
    if let Some(api_base) = &patch.api_base {
        validate_api_base(api_base)?;
    }
    if let Some(format) = &patch.format {
        validate_format(format)?;
    }
    if let Some(status) = &patch.status {
        if !ACCOUNT_STATUSES.contains(&status.as_str()) {
            return Err(ApiError::ValidationError(
                "status must be one of: active, disabled".to_string(),
            ));
        }
    }
    Ok(())
}

async fn update_custom_api(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
    Json(patch): Json<CustomAccountPatch>,
) -> Result<Json<Value>, ApiError> {
    validate_patch(&patch)?;
    if !state.store.update_custom_account(id, Some(user.id), &patch)? {
        return Err(ApiError::OwnershipError);
    }
    Ok(Json(json!({"updated": true})))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

async fn patch_custom_api_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, ApiError> {
    if !ACCOUNT_STATUSES.contains(&body.status.as_str()) {
        return Err(ApiError::ValidationError(
            "status must be one of: active, disabled".to_string(),
        ));
    }
    if !state
        .store
        .set_custom_account_status(id, Some(user.id), &body.status)?
    {
        return Err(ApiError::OwnershipError);
    }
    Ok(Json(json!({"updated": true})))
}

async fn delete_custom_api(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete_custom_account(id, Some(user.id))? {
        return Err(ApiError::OwnershipError);
    }
    Ok(Json(json!({"deleted": true})))
}

async fn admin_list_custom_apis(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let accounts = state.store.admin_list_custom_accounts()?;
    Ok(Json(json!({
        "accounts": accounts.iter().map(account_json).collect::<Vec<_>>()
    })))
}

async fn admin_update_custom_api(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<CustomAccountPatch>,
) -> Result<Json<Value>, ApiError> {
    validate_patch(&patch)?;
    if !state.store.update_custom_account(id, None, &patch)? {
        return Err(ApiError::OwnershipError);
    }
    Ok(Json(json!({"updated": true})))
}

async fn admin_delete_custom_api(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete_custom_account(id, None)? {
        return Err(ApiError::OwnershipError);
    }
    Ok(Json(json!({"deleted": true})))
}

// ==================================================================================================
// Kiro token management
// ==================================================================================================

#[derive(Debug, Deserialize)]
struct CreateTokenBody {
    refresh_token: String,
    #[serde(default)]
    auth_type: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    region: Option<String>,
    visibility: Option<String>,
    #[serde(default)]
    anonymous: bool,
}

async fn create_token(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<CreateTokenBody>,
) -> Result<Json<Value>, ApiError> {
    if body.refresh_token.trim().is_empty() {
        return Err(ApiError::ValidationError("refresh_token is required".to_string()));
    }

    let region = body.region.unwrap_or_else(|| state.config.region.clone());
    if !is_supported_region(&region) {
        return Err(ApiError::ValidationError(format!(
            "Unsupported region '{}'",
            region
        )));
    }

    let auth_type = match body.auth_type.as_deref() {
        None | Some("social") => "social",
        Some("idc") => {
            if body.client_id.as_deref().unwrap_or("").is_empty()
                || body.client_secret.as_deref().unwrap_or("").is_empty()
            {
                return Err(ApiError::ValidationError(
                    "idc tokens require client_id and client_secret".to_string(),
                ));
            }
            "idc"
        }
        Some(other) => {
            return Err(ApiError::ValidationError(format!(
                "Unknown auth_type '{}'",
                other
            )))
        }
    };

    let visibility = if body.anonymous {
        "public".to_string()
    } else {
        body.visibility.unwrap_or_else(|| "private".to_string())
    };

    let id = state
        .store
        .insert_kiro_token(
            user.id,
            &NewKiroToken {
                refresh_token: body.refresh_token.trim().to_string(),
                auth_type: auth_type.to_string(),
                client_id: body.client_id.filter(|c| !c.is_empty()),
                client_secret: body.client_secret.filter(|c| !c.is_empty()),
                region,
                visibility,
                opus_enabled: false,
            },
        )
        .map_err(|e| ApiError::ValidationError(format!("Could not store token: {}", e)))?;

    Ok(Json(json!({"id": id})))
}

async fn list_tokens(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<Value>, ApiError> {
    let tokens = state.store.get_kiro_tokens_by_user(user.id)?;
    Ok(Json(json!({
        "tokens": tokens
            .iter()
            .map(|t| json!({
                "id": t.id,
                "auth_type": t.auth_type,
                "region": t.region,
                "visibility": t.visibility,
                "status": t.status,
                "opus_enabled": t.opus_enabled,
                "success_count": t.success_count,
                "fail_count": t.fail_count,
                "last_used": t.last_used,
                "last_check": t.last_check,
                "created_at": t.created_at,
            }))
            .collect::<Vec<_>>()
    })))
}

async fn delete_token(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    match state.store.delete_kiro_token(id, user.id)? {
        Some(token_hash) => {
            state.auth_cache.remove(&token_hash);
            Ok(Json(json!({"deleted": true})))
        }
        None => Err(ApiError::OwnershipError),
    }
}
