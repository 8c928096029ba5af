// Anthropic → OpenAI request translation for custom upstreams speaking
// the chat-completions dialect.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use super::{extract_system_text, thinking_hint};
use crate::models::anthropic::{AnthropicMessagesRequest, AnthropicTool};
use crate::models::openai::{
    ChatCompletionRequest, ChatMessage, FunctionCall, Tool, ToolCall, ToolFunction,
};

const THINKING_START_TAG: &str = "<thinking>";
const THINKING_END_TAG: &str = "</thinking>";

/// System-prompt lines that must never reach third-party upstreams
static RESERVED_KEYWORD_LINES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^.*(x-anthropic-billing-header|anthropic-billing|billing-header).*$")
        .expect("reserved keyword regex")
});

static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n\s*\n").expect("blank-run regex"));

/// Translate an Anthropic request into the OpenAI dialect.
///
/// Returns the request plus whether thinking mode is on (the caller
/// then routes the response text through the thinking parser).
pub fn convert_request(
    request: &AnthropicMessagesRequest,
    model: &str,
) -> (ChatCompletionRequest, bool) {
    let thinking_enabled = request.thinking_enabled();

    let mut messages: Vec<ChatMessage> = Vec::new();

    let mut system_text = request
        .system
        .as_ref()
        .map(extract_system_text)
        .unwrap_or_default();
    system_text = filter_reserved_keywords(&system_text);

    if thinking_enabled {
        let hint = thinking_hint(request.thinking_budget());
        system_text = if system_text.is_empty() {
            hint
        } else {
            format!("{}\n{}", hint, system_text)
        };
    }

    if !system_text.is_empty() {
        messages.push(ChatMessage::text("system", system_text));
    }

    for message in &request.messages {
        match message.role.as_str() {
            "user" => messages.extend(convert_user_message(&message.content)),
            "assistant" => {
                if let Some(converted) =
                    convert_assistant_message(&message.content, thinking_enabled)
                {
                    messages.push(converted);
                }
            }
            _ => {}
        }
    }

    // Some backends reject requests with only a system message; keep at
    // least one user turn.
    if !messages.iter().any(|m| m.role != "system") {
        messages.push(ChatMessage::text("user", "."));
    }

    let openai_request = ChatCompletionRequest {
        model: model.to_string(),
        messages,
        stream: request.stream,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        tools: request.tools.as_ref().map(|tools| convert_tools(tools)),
        tool_choice: None,
    };

    (openai_request, thinking_enabled)
}

fn filter_reserved_keywords(system_prompt: &str) -> String {
    if system_prompt.is_empty() {
        return String::new();
    }
    let filtered = RESERVED_KEYWORD_LINES.replace_all(system_prompt, "");
    BLANK_RUNS.replace_all(&filtered, "\n\n").trim().to_string()
}

/// A user turn may fan out into several OpenAI messages: tool results
/// first (they answer the previous assistant turn), then text, with
/// images as separate image-URL messages.
fn convert_user_message(content: &Value) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    match content {
        Value::String(text) => messages.push(ChatMessage::text("user", text.clone())),
        Value::Array(blocks) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_results: Vec<ChatMessage> = Vec::new();

            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("tool_result") => {
                        if let Some(message) = convert_tool_result(block) {
                            tool_results.push(message);
                        }
                    }
                    Some("image") => {
                        if let Some(part) = convert_image_block(block) {
                            messages.push(ChatMessage {
                                role: "user".into(),
                                content: Some(Value::Array(vec![part])),
                                tool_calls: None,
                                tool_call_id: None,
                            });
                        }
                    }
                    _ => {}
                }
            }

            messages.extend(tool_results);

            let combined = text_parts.join("\n");
            if !combined.trim().is_empty() {
                messages.push(ChatMessage::text("user", combined));
            }
        }
        _ => {}
    }

    messages
}

fn convert_tool_result(block: &Value) -> Option<ChatMessage> {
    let tool_use_id = block.get("tool_use_id")?.as_str()?.to_string();

    let content_text = match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };

    Some(ChatMessage {
        role: "tool".into(),
        // A blank tool answer still needs a non-empty content field
        content: Some(Value::String(if content_text.is_empty() {
            " ".into()
        } else {
            content_text
        })),
        tool_calls: None,
        tool_call_id: Some(tool_use_id),
    })
}

fn convert_image_block(block: &Value) -> Option<Value> {
    let source = block.get("source")?;
    match source.get("type").and_then(|t| t.as_str()) {
        Some("base64") => {
            let media_type = source
                .get("media_type")
                .and_then(|m| m.as_str())
                .unwrap_or("image/png");
            let data = source.get("data").and_then(|d| d.as_str()).unwrap_or("");
            Some(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
            }))
        }
        Some("url") => {
            let url = source.get("url").and_then(|u| u.as_str())?;
            Some(json!({"type": "image_url", "image_url": {"url": url}}))
        }
        _ => None,
    }
}

fn convert_assistant_message(content: &Value, thinking_enabled: bool) -> Option<ChatMessage> {
    match content {
        Value::String(text) => Some(ChatMessage::text("assistant", text.clone())),
        Value::Array(blocks) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();

            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("thinking") => {
                        // Prior reasoning goes back upstream wrapped in the
                        // same tags the model emitted it with
                        if thinking_enabled {
                            if let Some(thinking) =
                                block.get("thinking").and_then(|t| t.as_str())
                            {
                                if !thinking.is_empty() {
                                    text_parts.push(format!(
                                        "{}{}{}",
                                        THINKING_START_TAG, thinking, THINKING_END_TAG
                                    ));
                                }
                            }
                        }
                    }
                    Some("tool_use") => {
                        if let Some(tool_call) = convert_tool_use(block) {
                            tool_calls.push(tool_call);
                        }
                    }
                    _ => {}
                }
            }

            let combined = text_parts.join("\n");
            let mut message = ChatMessage {
                role: "assistant".into(),
                // Empty string rather than null; some backends reject null
                content: Some(Value::String(combined.trim().to_string())),
                tool_calls: None,
                tool_call_id: None,
            };
            if !tool_calls.is_empty() {
                message.tool_calls = Some(tool_calls);
            }
            Some(message)
        }
        _ => None,
    }
}

fn convert_tool_use(block: &Value) -> Option<ToolCall> {
    let id = block.get("id")?.as_str()?.to_string();
    let name = block.get("name")?.as_str()?.to_string();
    let input = block.get("input").cloned().unwrap_or(json!({}));

    Some(ToolCall {
        id,
        tool_type: "function".into(),
        function: FunctionCall {
            name,
            arguments: input.to_string(),
        },
    })
}

fn convert_tools(tools: &[AnthropicTool]) -> Vec<Tool> {
    tools
        .iter()
        .map(|tool| Tool {
            tool_type: "function".into(),
            function: ToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        })
        .collect()
}
