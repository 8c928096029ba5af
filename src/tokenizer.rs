// Token estimation for count_tokens responses and the buffered-mode
// fallback when no context-usage event arrives.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::models::anthropic::{AnthropicMessage, AnthropicTool};

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!("Failed to load cl100k tokenizer, using char estimate: {}", e);
        None
    }
});

/// Count tokens in a text fragment; falls back to the chars/4 heuristic
pub fn count_text_tokens(text: &str) -> i32 {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as i32,
        None => (text.len() / 4).max(1) as i32,
    }
}

/// Estimate input tokens for a request: message text, system prompt and
/// tool definitions. Image payloads are ignored.
pub fn estimate_input_tokens(
    messages: &[AnthropicMessage],
    system: Option<&serde_json::Value>,
    tools: Option<&[AnthropicTool]>,
) -> i32 {
    let mut text = String::new();

    if let Some(system) = system {
        collect_text(system, &mut text);
    }

    for message in messages {
        collect_text(&message.content, &mut text);
    }

    let mut total = count_text_tokens(&text);

    if let Some(tools) = tools {
        for tool in tools {
            total += count_text_tokens(&tool.name);
            if let Some(description) = &tool.description {
                total += count_text_tokens(description);
            }
            if let Some(schema) = &tool.input_schema {
                total += count_text_tokens(&schema.to_string());
            }
        }
    }

    total.max(1)
}

/// Pull every piece of human-readable text out of a content value
fn collect_text(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => {
            out.push_str(s);
            out.push('\n');
        }
        serde_json::Value::Array(items) => {
            for item in items {
                if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                    out.push_str(text);
                    out.push('\n');
                } else if let Some(thinking) = item.get("thinking").and_then(|t| t.as_str()) {
                    out.push_str(thinking);
                    out.push('\n');
                } else if let Some(content) = item.get("content") {
                    collect_text(content, out);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(role: &str, content: serde_json::Value) -> AnthropicMessage {
        AnthropicMessage {
            role: role.to_string(),
            content,
        }
    }

    #[test]
    fn test_count_text_tokens_monotone() {
        let short = count_text_tokens("hello");
        let long = count_text_tokens(&"hello world ".repeat(100));
        assert!(short >= 1);
        assert!(long > short);
    }

    #[test]
    fn test_estimate_includes_system_and_tools() {
        let messages = vec![message("user", json!("What's the weather?"))];
        let base = estimate_input_tokens(&messages, None, None);

        let system = json!("You are a weather bot with a long preamble about forecasting.");
        let with_system = estimate_input_tokens(&messages, Some(&system), None);
        assert!(with_system > base);

        let tools = vec![AnthropicTool {
            name: "get_weather".into(),
            description: Some("Look up the forecast for a city".into()),
            input_schema: Some(json!({"type": "object", "properties": {"city": {"type": "string"}}})),
        }];
        let with_tools = estimate_input_tokens(&messages, Some(&system), Some(&tools));
        assert!(with_tools > with_system);
    }

    #[test]
    fn test_estimate_handles_block_arrays() {
        let messages = vec![message(
            "user",
            json!([
                {"type": "text", "text": "part one"},
                {"type": "tool_result", "tool_use_id": "t1", "content": [
                    {"type": "text", "text": "result text"}
                ]}
            ]),
        )];
        let tokens = estimate_input_tokens(&messages, None, None);
        assert!(tokens >= count_text_tokens("part one result text") - 2);
    }

    #[test]
    fn test_estimate_never_zero() {
        assert_eq!(estimate_input_tokens(&[], None, None), 1);
    }
}
