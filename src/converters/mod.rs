// Wire-format converters between the Anthropic client surface and the
// Kiro / OpenAI upstream dialects.

pub mod anthropic_to_kiro;
pub mod anthropic_to_openai;
pub mod azure;
pub mod openai_to_anthropic;

use uuid::Uuid;

/// Control tags prepended to the system prompt to switch the upstream
/// model into thinking mode; the client's `thinking` config itself is
/// never forwarded.
pub fn thinking_hint(max_thinking_length: i64) -> String {
    format!(
        "<thinking_mode>enabled</thinking_mode><max_thinking_length>{}</max_thinking_length>",
        max_thinking_length
    )
}

/// Generates a unique message ID in Anthropic format
pub fn generate_message_id() -> String {
    format!("msg_{}", &Uuid::new_v4().simple().to_string()[..24])
}

/// Generates a tool-use ID in Anthropic format
pub fn generate_tool_use_id() -> String {
    format!("toolu_{}", &Uuid::new_v4().simple().to_string()[..24])
}

/// Render one Anthropic SSE event
pub fn sse_event(event_type: &str, data: &serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event_type, data)
}

/// Flatten an Anthropic `system` value (string or block array) to text
pub fn extract_system_text(system: &serde_json::Value) -> String {
    match system {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| {
                (block.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| block.get("text").and_then(|t| t.as_str()).unwrap_or(""))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_thinking_hint_format() {
        assert_eq!(
            thinking_hint(200_000),
            "<thinking_mode>enabled</thinking_mode><max_thinking_length>200000</max_thinking_length>"
        );
    }

    #[test]
    fn test_message_id_format() {
        let id = generate_message_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 28);
    }

    #[test]
    fn test_extract_system_text() {
        assert_eq!(extract_system_text(&json!("plain")), "plain");
        assert_eq!(
            extract_system_text(&json!([
                {"type": "text", "text": "one"},
                {"type": "image", "source": {}},
                {"type": "text", "text": "two"}
            ])),
            "one\ntwo"
        );
        assert_eq!(extract_system_text(&json!(42)), "");
    }

    #[test]
    fn test_sse_event_grammar() {
        let event = sse_event("ping", &json!({"type": "ping"}));
        assert_eq!(event, "event: ping\ndata: {\"type\":\"ping\"}\n\n");
    }
}
