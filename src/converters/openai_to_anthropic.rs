// OpenAI SSE → Anthropic SSE translation.
//
// Reconstitutes the full Anthropic message lifecycle from chat-completion
// chunks: message_start, one content_block_start per content transition,
// deltas, content_block_stop, message_delta with the mapped stop reason,
// message_stop. Tool-call argument fragments concatenate into
// input_json_delta sequences inside a tool_use block keyed by the OpenAI
// tool-call id; reasoning_content deltas surface as thinking deltas.

use serde_json::{json, Value};

use super::{generate_message_id, generate_tool_use_id, sse_event};
use crate::models::openai::ChatCompletionChunk;
use crate::thinking_parser::{SegmentKind, ThinkingTagParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Tool,
}

pub struct StreamConverter {
    model: String,
    message_id: String,
    input_tokens: i32,
    output_tokens: i32,
    block_index: i32,
    open_block: Option<BlockKind>,
    finish_reason: Option<String>,
    message_started: bool,
    finished: bool,
    /// Present when the client asked for thinking: upstream text is
    /// scanned for <thinking> tags and re-emitted as thinking blocks
    tag_parser: Option<ThinkingTagParser>,
    line_buffer: String,
}

impl StreamConverter {
    pub fn new(model: &str, input_tokens: i32, thinking_enabled: bool) -> Self {
        Self {
            model: model.to_string(),
            message_id: generate_message_id(),
            input_tokens,
            output_tokens: 0,
            block_index: -1,
            open_block: None,
            finish_reason: None,
            message_started: false,
            finished: false,
            tag_parser: thinking_enabled.then(ThinkingTagParser::new),
            line_buffer: String::new(),
        }
    }

    /// Feed raw upstream bytes; returns completed Anthropic SSE events.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut events = Vec::new();
        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));

        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            let line = line.trim();

            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();

            if payload == "[DONE]" {
                events.extend(self.finish());
                continue;
            }

            match serde_json::from_str::<ChatCompletionChunk>(payload) {
                Ok(chunk) => events.extend(self.process_chunk(&chunk)),
                Err(e) => {
                    tracing::warn!("Skipping unparseable OpenAI event: {} ({})", payload, e);
                }
            }
        }

        events
    }

    /// Close the message; safe to call more than once.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.message_started {
            events.extend(self.start_message());
        }

        if let Some(mut parser) = self.tag_parser.take() {
            for segment in parser.flush() {
                let kind = match segment.kind {
                    SegmentKind::Thinking => BlockKind::Thinking,
                    SegmentKind::Text => BlockKind::Text,
                };
                events.extend(self.ensure_block(kind));
                events.push(self.delta_event(kind, &segment.text));
            }
        }

        events.extend(self.close_block());

        let stop_reason = self.finish_reason.clone().unwrap_or_else(|| "end_turn".into());
        events.push(sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {
                    "input_tokens": self.input_tokens,
                    "output_tokens": self.output_tokens,
                }
            }),
        ));
        events.push(sse_event("message_stop", &json!({"type": "message_stop"})));
        events
    }

    fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<String> {
        let mut events = Vec::new();

        if !self.message_started {
            events.extend(self.start_message());
        }

        if let Some(usage) = &chunk.usage {
            if usage.prompt_tokens > 0 {
                self.input_tokens = usage.prompt_tokens;
            }
            if usage.completion_tokens > 0 {
                self.output_tokens = usage.completion_tokens;
            }
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(reason) = &choice.finish_reason {
            self.finish_reason = Some(map_finish_reason(reason));
        }

        if let Some(reasoning) = &choice.delta.reasoning_content {
            if !reasoning.is_empty() {
                events.extend(self.ensure_block(BlockKind::Thinking));
                events.push(self.delta_event(BlockKind::Thinking, reasoning));
            }
        }

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                self.output_tokens += 1;
                if let Some(mut parser) = self.tag_parser.take() {
                    for segment in parser.push_and_parse(content) {
                        let kind = match segment.kind {
                            SegmentKind::Thinking => BlockKind::Thinking,
                            SegmentKind::Text => BlockKind::Text,
                        };
                        events.extend(self.ensure_block(kind));
                        events.push(self.delta_event(kind, &segment.text));
                    }
                    self.tag_parser = Some(parser);
                } else {
                    events.extend(self.ensure_block(BlockKind::Text));
                    events.push(self.delta_event(BlockKind::Text, content));
                }
            }
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                let starts_new = tc.id.is_some()
                    || tc.function.as_ref().is_some_and(|f| f.name.is_some());
                if starts_new {
                    events.extend(self.close_block());
                    self.block_index += 1;
                    self.open_block = Some(BlockKind::Tool);
                    let id = tc.id.clone().unwrap_or_else(generate_tool_use_id);
                    let name = tc
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    events.push(sse_event(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                        }),
                    ));
                }

                if let Some(arguments) = tc.function.as_ref().and_then(|f| f.arguments.clone()) {
                    if !arguments.is_empty() && self.open_block == Some(BlockKind::Tool) {
                        events.push(sse_event(
                            "content_block_delta",
                            &json!({
                                "type": "content_block_delta",
                                "index": self.block_index,
                                "delta": {"type": "input_json_delta", "partial_json": arguments}
                            }),
                        ));
                    }
                }
            }
        }

        events
    }

    fn start_message(&mut self) -> Vec<String> {
        self.message_started = true;
        vec![
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
                            "input_tokens": self.input_tokens,
                            "output_tokens": 0,
                            "cache_creation_input_tokens": 0,
                            "cache_read_input_tokens": 0
                        }
                    }
                }),
            ),
            sse_event("ping", &json!({"type": "ping"})),
        ]
    }

    /// Open a block of the requested kind, closing any open block of a
    /// different kind first.
    fn ensure_block(&mut self, kind: BlockKind) -> Vec<String> {
        if self.open_block == Some(kind) {
            return Vec::new();
        }

        let mut events = self.close_block();
        self.block_index += 1;
        self.open_block = Some(kind);

        let content_block = match kind {
            BlockKind::Text => json!({"type": "text", "text": ""}),
            BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
            BlockKind::Tool => unreachable!("tool blocks open explicitly"),
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

    fn delta_event(&self, kind: BlockKind, text: &str) -> String {
        let delta = match kind {
            BlockKind::Text => json!({"type": "text_delta", "text": text}),
            BlockKind::Thinking => json!({"type": "thinking_delta", "thinking": text}),
            BlockKind::Tool => json!({"type": "input_json_delta", "partial_json": text}),
        };
        sse_event(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }
}

fn map_finish_reason(openai_reason: &str) -> String {
    match openai_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "end_turn",
        _ => "end_turn",
    }
    .to_string()
}

/// Map an OpenAI error object to the Anthropic error shape
pub fn convert_error(openai_error: &Value, status: u16) -> Value {
    let error = openai_error.get("error").cloned().unwrap_or(Value::Null);
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("Unknown error")
        .to_string();
    let openai_type = error.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let anthropic_type = match openai_type {
        "invalid_request_error" => "invalid_request_error",
        "authentication_error" => "authentication_error",
        "permission_error" => "permission_error",
        "not_found_error" => "not_found_error",
        "rate_limit_error" => "rate_limit_error",
        "server_error" => "api_error",
        "service_unavailable" => "overloaded_error",
        _ => match status {
            400 => "invalid_request_error",
            401 => "authentication_error",
            403 => "permission_error",
            404 => "not_found_error",
            429 => "rate_limit_error",
            503 => "overloaded_error",
            _ => "api_error",
        },
    };

    json!({
        "type": "error",
        "error": {"type": anthropic_type, "message": message}
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_line(value: Value) -> String {
        format!("data: {}\n", value)
    }

    fn content_chunk(text: &str) -> String {
        data_line(json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": text}}]
        }))
    }

    fn collect_text(events: &[String], delta_type: &str, field: &str) -> String {
        events
            .iter()
            .filter_map(|e| {
                let data = e.split("data: ").nth(1)?;
                let value: Value = serde_json::from_str(data.trim()).ok()?;
                if value["delta"]["type"] == delta_type {
                    Some(value["delta"][field].as_str()?.to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    #[test]
    fn test_message_lifecycle() {
        let mut converter = StreamConverter::new("claude-sonnet-4", 10, false);
        let mut events = converter.feed(content_chunk("Hello").as_bytes());
        events.extend(converter.feed(b"data: [DONE]\n"));

        let names: Vec<&str> = events
            .iter()
            .map(|e| e.split('\n').next().unwrap().trim_start_matches("event: "))
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }

    #[test]
    fn test_event_preservation_and_text_reconstruction() {
        let inputs = ["Hel", "lo ", "wor", "ld!"];
        let mut converter = StreamConverter::new("claude-sonnet-4", 0, false);

        let mut events = Vec::new();
        for text in inputs {
            events.extend(converter.feed(content_chunk(text).as_bytes()));
        }
        events.extend(converter.feed(b"data: [DONE]\n"));

        // At least one output event per input event
        assert!(events.len() >= inputs.len());
        assert_eq!(collect_text(&events, "text_delta", "text"), "Hello world!");
    }

    #[test]
    fn test_tool_call_reassembly() {
        let mut converter = StreamConverter::new("claude-sonnet-4", 0, false);
        let mut events = Vec::new();

        events.extend(converter.feed(
            data_line(json!({
                "id": "c", "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": {"tool_calls": [{
                    "index": 0, "id": "call_7", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":"}
                }]}}]
            }))
            .as_bytes(),
        ));
        events.extend(converter.feed(
            data_line(json!({
                "id": "c", "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": {"tool_calls": [{
                    "index": 0, "function": {"arguments": "\"SF\"}"}
                }]}, "finish_reason": "tool_calls"}]
            }))
            .as_bytes(),
        ));
        events.extend(converter.feed(b"data: [DONE]\n"));

        let start = events
            .iter()
            .find(|e| e.contains("content_block_start"))
            .unwrap();
        assert!(start.contains("\"tool_use\""));
        assert!(start.contains("call_7"));
        assert!(start.contains("get_weather"));

        let args = collect_text(&events, "input_json_delta", "partial_json");
        assert_eq!(args, "{\"city\":\"SF\"}");

        let delta_event = events.iter().find(|e| e.starts_with("event: message_delta")).unwrap();
        assert!(delta_event.contains("tool_use"));
    }

    #[test]
    fn test_reasoning_content_passthrough() {
        let mut converter = StreamConverter::new("claude-sonnet-4", 0, false);
        let mut events = converter.feed(
            data_line(json!({
                "id": "c", "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": {"reasoning_content": "hmm"}}]
            }))
            .as_bytes(),
        );
        events.extend(converter.feed(content_chunk("answer").as_bytes()));
        events.extend(converter.feed(b"data: [DONE]\n"));

        assert_eq!(collect_text(&events, "thinking_delta", "thinking"), "hmm");
        assert_eq!(collect_text(&events, "text_delta", "text"), "answer");

        // Thinking block closes before the text block opens
        let starts: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.contains("content_block_start"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(starts.len(), 2);
    }

    #[test]
    fn test_thinking_tags_extracted_from_content() {
        let mut converter = StreamConverter::new("claude-sonnet-4", 0, true);
        let mut events =
            converter.feed(content_chunk("<thinking>plan</thinking>result").as_bytes());
        events.extend(converter.feed(b"data: [DONE]\n"));

        assert_eq!(collect_text(&events, "thinking_delta", "thinking"), "plan");
        assert_eq!(collect_text(&events, "text_delta", "text"), "result");
    }

    #[test]
    fn test_usage_updates_final_delta() {
        let mut converter = StreamConverter::new("claude-sonnet-4", 5, false);
        let mut events = converter.feed(content_chunk("hi").as_bytes());
        events.extend(converter.feed(
            data_line(json!({
                "id": "c", "object": "chat.completion.chunk",
                "choices": [],
                "usage": {"prompt_tokens": 123, "completion_tokens": 45, "total_tokens": 168}
            }))
            .as_bytes(),
        ));
        events.extend(converter.feed(b"data: [DONE]\n"));

        let delta_event = events.iter().find(|e| e.starts_with("event: message_delta")).unwrap();
        assert!(delta_event.contains("\"input_tokens\":123"));
        assert!(delta_event.contains("\"output_tokens\":45"));
    }

    #[test]
    fn test_unparseable_line_skipped() {
        let mut converter = StreamConverter::new("claude-sonnet-4", 0, false);
        let events = converter.feed(b"data: {not json}\n");
        assert!(events.is_empty());

        let events = converter.feed(content_chunk("still fine").as_bytes());
        assert!(!events.is_empty());
    }

    #[test]
    fn test_split_sse_lines_across_chunks() {
        let mut converter = StreamConverter::new("claude-sonnet-4", 0, false);
        let line = content_chunk("chunked");
        let (a, b) = line.split_at(line.len() / 2);

        let mut events = converter.feed(a.as_bytes());
        events.extend(converter.feed(b.as_bytes()));
        events.extend(converter.finish());

        assert_eq!(collect_text(&events, "text_delta", "text"), "chunked");
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut converter = StreamConverter::new("claude-sonnet-4", 0, false);
        converter.feed(content_chunk("x").as_bytes());
        let first = converter.finish();
        assert!(first.iter().any(|e| e.starts_with("event: message_stop")));
        assert!(converter.finish().is_empty());
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("weird"), "end_turn");
    }

    #[test]
    fn test_error_conversion() {
        let error = json!({"error": {"type": "rate_limit_error", "message": "slow down"}});
        let converted = convert_error(&error, 429);
        assert_eq!(converted["error"]["type"], "rate_limit_error");
        assert_eq!(converted["error"]["message"], "slow down");

        let bare = json!({});
        let converted = convert_error(&bare, 503);
        assert_eq!(converted["error"]["type"], "overloaded_error");
    }
}
