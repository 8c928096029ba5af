// Kiro upstream streaming: issues the inference request, parses the
// event-stream framing, and normalizes frames into StreamEvents.
//
// The upstream responds in AWS event-stream framing with JSON payloads
// embedded between binary headers; the parser extracts them by pattern
// scan plus brace matching rather than decoding the binary envelope.

pub mod buffered;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use tokio::time::{timeout, Duration};

use crate::auth::AuthManager;
use crate::converters::{generate_message_id, sse_event};
use crate::error::ApiError;
use crate::models::kiro::KiroRequest;
use crate::thinking_parser::{SegmentKind, ThinkingTagParser};

/// Model context window used to derive input_tokens from a context-usage
/// percentage.
pub const CONTEXT_WINDOW_TOKENS: f64 = 200_000.0;

/// Consecutive inter-frame read timeouts tolerated before giving up
const MAX_CONSECUTIVE_READ_TIMEOUTS: u32 = 3;

// ==================================================================================================
// Normalized events
// ==================================================================================================

/// Internal normalized event union for one upstream stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Content(String),
    Thinking(String),
    ToolUse(CompletedToolUse),
    Usage {
        input_tokens: i32,
        output_tokens: i32,
    },
    ContextUsage(f64),
}

#[derive(Debug, Clone)]
pub struct CompletedToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

// ==================================================================================================
// Frame parsing
// ==================================================================================================

/// JSON payload patterns scanned for inside the upstream framing
const EVENT_PATTERNS: &[&str] = &[
    "{\"content\":",
    "{\"name\":",
    "{\"input\":",
    "{\"stop\":",
    "{\"followupPrompt\":",
    "{\"usage\":",
    "{\"contextUsagePercentage\":",
];

/// Extracts embedded JSON objects from the upstream byte stream
pub struct FrameParser {
    buffer: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        loop {
            let Some(start) = EVENT_PATTERNS
                .iter()
                .filter_map(|p| self.buffer.find(p))
                .min()
            else {
                break;
            };

            let Some(end) = find_matching_brace(&self.buffer, start) else {
                // JSON not complete yet, wait for more data
                break;
            };

            let payload = &self.buffer[start..=end];
            match serde_json::from_str::<Value>(payload) {
                Ok(value) => events.push(value),
                Err(e) => {
                    tracing::warn!(
                        "Skipping malformed frame: {} ({})",
                        payload.chars().take(100).collect::<String>(),
                        e
                    );
                }
            }

            self.buffer = self.buffer[end + 1..].to_string();
        }

        events
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the matching closing brace, honoring strings and escapes.
/// Binary framing after the payload can decode to stray quote bytes, so
/// the scan returns as soon as the balance hits zero.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ==================================================================================================
// Tool call accumulation
// ==================================================================================================

/// Combines streamed tool-call fragments into complete calls.
///
/// The upstream repeats `name` and `toolUseId` on every input fragment;
/// a fragment with the same id continues the current call rather than
/// starting a new one. `{"stop": true}` closes the call.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    current: Option<PartialToolUse>,
    completed: VecDeque<CompletedToolUse>,
    finalized: bool,
}

#[derive(Debug)]
struct PartialToolUse {
    tool_use_id: String,
    name: String,
    input_json: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_event(&mut self, event: &Value) {
        let event_id = event.get("toolUseId").and_then(|v| v.as_str());
        let same_call = matches!(
            (&self.current, event_id),
            (Some(current), Some(id)) if !current.tool_use_id.is_empty() && current.tool_use_id == id
        );

        if let Some(name) = event.get("name").and_then(|v| v.as_str()) {
            if !same_call {
                self.finish_current();
                self.current = Some(PartialToolUse {
                    tool_use_id: event_id.unwrap_or_default().to_string(),
                    name: name.to_string(),
                    input_json: String::new(),
                });
            }
        }

        self.append_input(event);

        if event.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
            self.finish_current();
        }
    }

    /// Drain the calls completed so far, in completion order
    pub fn take_completed(&mut self) -> Vec<CompletedToolUse> {
        self.completed.drain(..).collect()
    }

    fn append_input(&mut self, event: &Value) {
        let Some(current) = &mut self.current else {
            return;
        };
        match event.get("input") {
            Some(Value::String(s)) => current.input_json.push_str(s),
            Some(other) if !other.is_null() => {
                current.input_json.push_str(&other.to_string());
            }
            _ => {}
        }
    }

    fn finish_current(&mut self) {
        let Some(partial) = self.current.take() else {
            return;
        };
        let input = if partial.input_json.is_empty() {
            json!({})
        } else {
            serde_json::from_str(&partial.input_json).unwrap_or_else(|e| {
                tracing::warn!(
                    "Tool '{}' arguments failed to parse: {} (raw: {})",
                    partial.name,
                    e,
                    partial.input_json.chars().take(200).collect::<String>()
                );
                json!({})
            })
        };

        self.completed.push_back(CompletedToolUse {
            tool_use_id: partial.tool_use_id,
            name: partial.name,
            input,
        });
    }

    /// Close any call still open at end of stream; second call is a no-op
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.finish_current();
    }
}

// ==================================================================================================
// Frame → raw event normalization
// ==================================================================================================

/// Normalize one parsed frame. Content is raw here; thinking extraction
/// happens in the stream pump where parser state lives, and completed
/// tool calls are drained from the accumulator by the caller.
fn normalize_frame(frame: &Value, accumulator: &mut ToolCallAccumulator) -> Option<RawEvent> {
    if frame.get("followupPrompt").is_some() {
        return None;
    }

    if let Some(content) = frame.get("content").and_then(|v| v.as_str()) {
        return Some(RawEvent::Content(content.to_string()));
    }

    if frame.get("name").is_some() || frame.get("input").is_some() || frame.get("stop").is_some() {
        accumulator.process_event(frame);
        return None;
    }

    if let Some(usage) = frame.get("usage") {
        if let Some(object) = usage.as_object() {
            return Some(RawEvent::Usage {
                input_tokens: object
                    .get("inputTokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as i32,
                output_tokens: object
                    .get("outputTokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as i32,
            });
        }
    }

    if let Some(pct) = frame.get("contextUsagePercentage").and_then(|v| v.as_f64()) {
        return Some(RawEvent::ContextUsage(pct));
    }

    None
}

enum RawEvent {
    Content(String),
    Usage { input_tokens: i32, output_tokens: i32 },
    ContextUsage(f64),
}

// ==================================================================================================
// Upstream request
// ==================================================================================================

/// Obtain an access token and POST the payload to the credential's
/// region endpoint.
pub async fn send_kiro_request(
    client: &reqwest::Client,
    manager: &AuthManager,
    payload: &KiroRequest,
) -> Result<reqwest::Response, ApiError> {
    let access_token = manager.get_access_token().await.map_err(|e| {
        ApiError::UpstreamAuth {
            kind: e.kind,
            status: e.status,
            message: e.message,
        }
    })?;

    let response = client
        .post(manager.api_url())
        .header("Authorization", format!("Bearer {}", access_token))
        .header("Content-Type", "application/json")
        .json(payload)
        .send()
        .await
        .map_err(|e| ApiError::UpstreamError {
            status: 502,
            message: format!("Upstream request failed: {}", e),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "Kiro upstream rejected request: {}", body);
        return Err(ApiError::UpstreamError {
            status: status.as_u16(),
            message: body,
        });
    }

    Ok(response)
}

// ==================================================================================================
// Event stream pump
// ==================================================================================================

struct PumpState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: FrameParser,
    accumulator: ToolCallAccumulator,
    thinking: ThinkingTagParser,
    pending: VecDeque<Result<StreamEvent, ApiError>>,
    read_timeout: Duration,
    consecutive_timeouts: u32,
    finished: bool,
}

impl PumpState {
    fn absorb(&mut self, chunk: &[u8]) {
        for frame in self.parser.feed(chunk) {
            match normalize_frame(&frame, &mut self.accumulator) {
                Some(RawEvent::Content(text)) => {
                    for segment in self.thinking.push_and_parse(&text) {
                        self.pending.push_back(Ok(match segment.kind {
                            SegmentKind::Thinking => StreamEvent::Thinking(segment.text),
                            SegmentKind::Text => StreamEvent::Content(segment.text),
                        }));
                    }
                }
                Some(RawEvent::Usage {
                    input_tokens,
                    output_tokens,
                }) => {
                    self.pending.push_back(Ok(StreamEvent::Usage {
                        input_tokens,
                        output_tokens,
                    }));
                }
                Some(RawEvent::ContextUsage(pct)) => {
                    self.pending.push_back(Ok(StreamEvent::ContextUsage(pct)));
                }
                None => {}
            }
            for tool in self.accumulator.take_completed() {
                self.pending.push_back(Ok(StreamEvent::ToolUse(tool)));
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        for segment in self.thinking.flush() {
            self.pending.push_back(Ok(match segment.kind {
                SegmentKind::Thinking => StreamEvent::Thinking(segment.text),
                SegmentKind::Text => StreamEvent::Content(segment.text),
            }));
        }
        self.accumulator.finalize();
        for tool in self.accumulator.take_completed() {
            tracing::debug!("Finalizing tool '{}' left open at stream end", tool.name);
            self.pending.push_back(Ok(StreamEvent::ToolUse(tool)));
        }
    }
}

/// Parse an upstream response into normalized StreamEvents.
///
/// The first byte must arrive within `first_token_timeout_secs` or the
/// call fails with the retryable FirstTokenTimeout. After that, up to
/// three consecutive reads may time out before the stream errors with
/// StreamReadTimeout.
pub async fn kiro_event_stream(
    response: reqwest::Response,
    first_token_timeout_secs: u64,
    read_timeout_secs: u64,
) -> Result<impl Stream<Item = Result<StreamEvent, ApiError>>, ApiError> {
    let mut bytes = response.bytes_stream().boxed();

    let first_chunk = timeout(Duration::from_secs(first_token_timeout_secs), bytes.next())
        .await
        .map_err(|_| {
            tracing::warn!(
                "Upstream produced no bytes within {}s",
                first_token_timeout_secs
            );
            ApiError::FirstTokenTimeout(first_token_timeout_secs)
        })?;

    let mut state = PumpState {
        bytes,
        parser: FrameParser::new(),
        accumulator: ToolCallAccumulator::new(),
        thinking: ThinkingTagParser::new(),
        pending: VecDeque::new(),
        read_timeout: Duration::from_secs(read_timeout_secs),
        consecutive_timeouts: 0,
        finished: false,
    };

    match first_chunk {
        Some(Ok(chunk)) => state.absorb(&chunk),
        Some(Err(e)) => {
            return Err(ApiError::UpstreamError {
                status: 502,
                message: format!("Stream error on first chunk: {}", e),
            })
        }
        None => state.finish(),
    }

    Ok(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }

            match timeout(state.read_timeout, state.bytes.next()).await {
                Err(_) => {
                    state.consecutive_timeouts += 1;
                    if state.consecutive_timeouts > MAX_CONSECUTIVE_READ_TIMEOUTS {
                        state.finished = true;
                        return Some((
                            Err(ApiError::StreamReadTimeout(format!(
                                "{} consecutive read timeouts",
                                state.consecutive_timeouts
                            ))),
                            state,
                        ));
                    }
                    tracing::warn!(
                        "Stream read timeout {}/{}",
                        state.consecutive_timeouts,
                        MAX_CONSECUTIVE_READ_TIMEOUTS
                    );
                }
                Ok(Some(Ok(chunk))) => {
                    state.consecutive_timeouts = 0;
                    state.absorb(&chunk);
                }
                Ok(Some(Err(e))) => {
                    state.finish();
                    state.pending.push_back(Err(ApiError::UpstreamError {
                        status: 502,
                        message: format!("Stream error: {}", e),
                    }));
                }
                Ok(None) => state.finish(),
            }
        }
    }))
}

// ==================================================================================================
// Anthropic SSE assembly
// ==================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
}

/// Builds the Anthropic SSE lifecycle from normalized events. Used both
/// for live forwarding and for buffered replay.
pub struct AnthropicSseBuilder {
    message_id: String,
    model: String,
    block_index: i32,
    open_block: Option<OpenBlock>,
    pub saw_tool_use: bool,
    pub usage: Option<(i32, i32)>,
    pub context_usage: Option<f64>,
    pub output_text_len: usize,
}

impl AnthropicSseBuilder {
    pub fn new(model: &str) -> Self {
        Self {
            message_id: generate_message_id(),
            model: model.to_string(),
            block_index: -1,
            open_block: None,
            saw_tool_use: false,
            usage: None,
            context_usage: None,
            output_text_len: 0,
        }
    }

    pub fn message_start(&self, input_tokens: i32) -> String {
        sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {
                        "input_tokens": input_tokens,
                        "output_tokens": 0,
                        "cache_creation_input_tokens": 0,
                        "cache_read_input_tokens": 0
                    }
                }
            }),
        ) + &sse_event("ping", &json!({"type": "ping"}))
    }

    pub fn on_event(&mut self, event: &StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::Content(text) => {
                self.output_text_len += text.len();
                let mut events = self.ensure_block(OpenBlock::Text);
                events.push(sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                ));
                events
            }
            StreamEvent::Thinking(text) => {
                self.output_text_len += text.len();
                let mut events = self.ensure_block(OpenBlock::Thinking);
                events.push(sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "thinking_delta", "thinking": text}
                    }),
                ));
                events
            }
            StreamEvent::ToolUse(tool) => {
                self.saw_tool_use = true;
                let mut events = self.close_block();
                self.block_index += 1;
                events.push(sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": tool.tool_use_id,
                            "name": tool.name,
                            "input": {}
                        }
                    }),
                ));
                events.push(sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": tool.input.to_string()
                        }
                    }),
                ));
                events.push(sse_event(
                    "content_block_stop",
                    &json!({"type": "content_block_stop", "index": self.block_index}),
                ));
                events
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.usage = Some((*input_tokens, *output_tokens));
                Vec::new()
            }
            StreamEvent::ContextUsage(pct) => {
                self.context_usage = Some(*pct);
                Vec::new()
            }
        }
    }

    /// Close the message: any open block, message_delta, message_stop
    pub fn finish(&mut self, output_tokens: i32) -> Vec<String> {
        let mut events = self.close_block();
        let stop_reason = if self.saw_tool_use { "tool_use" } else { "end_turn" };
        events.push(sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": output_tokens}
            }),
        ));
        events.push(sse_event("message_stop", &json!({"type": "message_stop"})));
        events
    }

    fn ensure_block(&mut self, kind: OpenBlock) -> Vec<String> {
        if self.open_block == Some(kind) {
            return Vec::new();
        }
        let mut events = self.close_block();
        self.block_index += 1;
        self.open_block = Some(kind);
        let content_block = match kind {
            OpenBlock::Text => json!({"type": "text", "text": ""}),
            OpenBlock::Thinking => json!({"type": "thinking", "thinking": ""}),
        };
        events.push(sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        events
    }

    fn close_block(&mut self) -> Vec<String> {
        if self.open_block.take().is_none() {
            return Vec::new();
        }
        vec![sse_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.block_index}),
        )]
    }
}

/// Everything collected from a finished stream (non-streaming responses)
#[derive(Debug, Default)]
pub struct CollectedResponse {
    pub text: String,
    pub thinking: String,
    pub tool_uses: Vec<CompletedToolUse>,
    pub usage: Option<(i32, i32)>,
    pub context_usage: Option<f64>,
}

/// Drain a stream into a single aggregated response
pub async fn collect_stream<S>(mut events: S) -> Result<CollectedResponse, ApiError>
where
    S: Stream<Item = Result<StreamEvent, ApiError>> + Unpin,
{
    let mut collected = CollectedResponse::default();
    while let Some(event) = events.next().await {
        match event? {
            StreamEvent::Content(text) => collected.text.push_str(&text),
            StreamEvent::Thinking(text) => collected.thinking.push_str(&text),
            StreamEvent::ToolUse(tool) => collected.tool_uses.push(tool),
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => collected.usage = Some((input_tokens, output_tokens)),
            StreamEvent::ContextUsage(pct) => collected.context_usage = Some(pct),
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parser_basic() {
        let mut parser = FrameParser::new();
        let events = parser.feed(b"{\"content\": \"Hello, world!\"}");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["content"], "Hello, world!");
    }

    #[test]
    fn test_frame_parser_skips_framing_noise() {
        let mut parser = FrameParser::new();
        let events = parser.feed(
            b":event-type: content\x00\x01\x02{\"content\": \"Hi\"}\xff\xfe binary trailer",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["content"], "Hi");
    }

    #[test]
    fn test_frame_parser_partial_json() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"{\"content\": \"Hel").is_empty());
        let events = parser.feed(b"lo\"}");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["content"], "Hello");
    }

    #[test]
    fn test_frame_parser_multiple_events() {
        let mut parser = FrameParser::new();
        let events = parser.feed(b"{\"content\": \"A\"}{\"content\": \"B\"}");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_frame_parser_nested_and_escaped() {
        let mut parser = FrameParser::new();
        let events = parser.feed(b"{\"content\": \"{\\\"nested\\\": true}\"}");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["content"], "{\"nested\": true}");
    }

    #[test]
    fn test_accumulator_multi_fragment_call() {
        let mut acc = ToolCallAccumulator::new();

        acc.process_event(&json!({"name": "bash", "toolUseId": "t1", "input": "{\"cm"}));
        acc.process_event(&json!({"name": "bash", "toolUseId": "t1", "input": "d\": \"ls\"}"}));
        assert!(acc.take_completed().is_empty());

        acc.process_event(&json!({"stop": true}));
        let completed = acc.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].name, "bash");
        assert_eq!(completed[0].input["cmd"], "ls");
    }

    #[test]
    fn test_accumulator_new_id_closes_previous() {
        let mut acc = ToolCallAccumulator::new();
        acc.process_event(&json!({"name": "a", "toolUseId": "t1", "input": "{}"}));
        acc.process_event(&json!({"name": "b", "toolUseId": "t2"}));
        let completed = acc.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].name, "a");

        acc.finalize();
        assert_eq!(acc.take_completed()[0].name, "b");
    }

    #[test]
    fn test_accumulator_one_frame_call_with_dangling_previous() {
        let mut acc = ToolCallAccumulator::new();
        acc.process_event(&json!({"name": "a", "toolUseId": "t1", "input": "{}"}));
        // A complete one-frame call arrives while "a" is still open;
        // both completions must survive, in order
        acc.process_event(&json!({"name": "b", "toolUseId": "t2", "input": "{}", "stop": true}));
        let completed = acc.take_completed();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].name, "a");
        assert_eq!(completed[1].name, "b");
    }

    #[test]
    fn test_accumulator_truncated_arguments() {
        let mut acc = ToolCallAccumulator::new();
        acc.process_event(&json!({"name": "write", "toolUseId": "t9", "input": "{\"path\": \"/x"}));
        acc.finalize();
        let completed = acc.take_completed();
        assert_eq!(completed[0].name, "write");
        assert_eq!(completed[0].input, json!({}));

        // Finalize is a no-op the second time
        acc.finalize();
        assert!(acc.take_completed().is_empty());
    }

    #[test]
    fn test_normalize_followup_ignored() {
        let mut acc = ToolCallAccumulator::new();
        assert!(normalize_frame(&json!({"followupPrompt": "more?"}), &mut acc).is_none());
    }

    #[test]
    fn test_normalize_usage_and_context() {
        let mut acc = ToolCallAccumulator::new();
        match normalize_frame(
            &json!({"usage": {"inputTokens": 10, "outputTokens": 5}}),
            &mut acc,
        ) {
            Some(RawEvent::Usage {
                input_tokens,
                output_tokens,
            }) => {
                assert_eq!(input_tokens, 10);
                assert_eq!(output_tokens, 5);
            }
            _ => panic!("expected usage"),
        }
        match normalize_frame(&json!({"contextUsagePercentage": 42.5}), &mut acc) {
            Some(RawEvent::ContextUsage(pct)) => assert!((pct - 42.5).abs() < f64::EPSILON),
            _ => panic!("expected context usage"),
        }
    }

    #[test]
    fn test_builder_lifecycle() {
        let mut builder = AnthropicSseBuilder::new("claude-sonnet-4");
        let mut events = vec![builder.message_start(12)];
        events.extend(builder.on_event(&StreamEvent::Content("Hello".into())));
        events.extend(builder.on_event(&StreamEvent::Content(" world".into())));
        events.extend(builder.finish(2));

        let joined = events.join("");
        let names: Vec<&str> = joined
            .lines()
            .filter(|l| l.starts_with("event: "))
            .map(|l| l.trim_start_matches("event: "))
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(joined.contains("\"stop_reason\":\"end_turn\""));
        assert!(joined.contains("\"input_tokens\":12"));
    }

    #[test]
    fn test_builder_thinking_then_text_blocks() {
        let mut builder = AnthropicSseBuilder::new("m");
        let mut events = builder.on_event(&StreamEvent::Thinking("plan".into()));
        events.extend(builder.on_event(&StreamEvent::Content("answer".into())));
        events.extend(builder.finish(1));

        let joined = events.join("");
        assert!(joined.contains("\"thinking\":\"plan\""));
        assert!(joined.contains("\"text\":\"answer\""));
        // Two block starts, two block stops
        assert_eq!(joined.matches("content_block_start").count(), 4); // event name + type field, twice
    }

    #[test]
    fn test_builder_tool_use_sets_stop_reason() {
        let mut builder = AnthropicSseBuilder::new("m");
        let mut events = builder.on_event(&StreamEvent::ToolUse(CompletedToolUse {
            tool_use_id: "t1".into(),
            name: "bash".into(),
            input: json!({"cmd": "ls"}),
        }));
        events.extend(builder.finish(1));

        let joined = events.join("");
        assert!(joined.contains("\"tool_use\""));
        assert!(joined.contains("input_json_delta"));
        assert!(joined.contains("\"stop_reason\":\"tool_use\""));
    }

    #[tokio::test]
    async fn test_event_stream_end_to_end() {
        use axum::{body::Body, routing::post, Router};

        let app = Router::new().route(
            "/generateAssistantResponse",
            post(|| async {
                let frames: Vec<Result<Bytes, std::io::Error>> = vec![
                    Ok(Bytes::from_static(b"{\"content\": \"<thinking>hmm</thinking>\"}")),
                    Ok(Bytes::from_static(b"{\"content\": \"Hello\"}")),
                    Ok(Bytes::from_static(b"{\"contextUsagePercentage\": 40.0}")),
                ];
                axum::response::Response::new(Body::from_stream(futures::stream::iter(frames)))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let response = reqwest::Client::new()
            .post(format!("http://{}/generateAssistantResponse", addr))
            .send()
            .await
            .unwrap();

        let stream = kiro_event_stream(response, 5, 5).await.unwrap();
        let collected = collect_stream(Box::pin(stream)).await.unwrap();

        assert_eq!(collected.thinking, "hmm");
        assert_eq!(collected.text, "Hello");
        assert_eq!(collected.context_usage, Some(40.0));
    }

    #[tokio::test]
    async fn test_first_token_timeout() {
        use axum::{body::Body, routing::post, Router};

        let app = Router::new().route(
            "/generateAssistantResponse",
            post(|| async {
                let stalled = futures::stream::once(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<Bytes, std::io::Error>(Bytes::from_static(b"late"))
                });
                axum::response::Response::new(Body::from_stream(stalled))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let response = reqwest::Client::new()
            .post(format!("http://{}/generateAssistantResponse", addr))
            .send()
            .await
            .unwrap();

        let result = kiro_event_stream(response, 1, 5).await;
        assert!(matches!(result, Err(ApiError::FirstTokenTimeout(1))));
    }
}
