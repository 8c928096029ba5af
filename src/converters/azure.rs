// Request scrubbing for Azure-hosted Anthropic endpoints
// (provider = "azure" on a custom account).
//
// Azure rejects several vendor fields outright, so the scrub works as an
// allow-list over top-level keys plus structural cleanup of thinking
// blocks and tool definitions. Running the scrub twice changes nothing.

use serde_json::{json, Map, Value};

/// Top-level request keys Azure accepts
const ALLOWED_KEYS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "system",
    "stream",
    "metadata",
    "stop_sequences",
    "temperature",
    "top_p",
    "top_k",
    "tools",
    "tool_choice",
    "thinking",
];

/// Built-in tool types passed through with name only
const BUILTIN_TOOL_TYPES: &[&str] = &[
    "bash_20250124",
    "bash_20241022",
    "text_editor_20250124",
    "text_editor_20250429",
    "text_editor_20250728",
    "text_editor_20241022",
    "web_search_20250305",
    "computer_20241022",
];

/// Scrub an Anthropic request for an Azure upstream. Idempotent.
pub fn scrub_request(request: &Value) -> Value {
    let Some(object) = request.as_object() else {
        return request.clone();
    };

    // Drop denied and vendor-unknown top-level keys
    let mut cleaned: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| ALLOWED_KEYS.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut thinking_enabled = cleaned
        .get("thinking")
        .and_then(|t| t.get("type"))
        .and_then(|t| t.as_str())
        == Some("enabled");

    // Thinking only survives when the last assistant message opens with a
    // signed thinking block; otherwise Azure rejects the request.
    if thinking_enabled {
        let has_valid_prefix = cleaned
            .get("messages")
            .and_then(|m| m.as_array())
            .and_then(|messages| {
                messages
                    .iter()
                    .rev()
                    .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("assistant"))
            })
            .and_then(|last| last.get("content"))
            .and_then(|content| content.as_array())
            .and_then(|blocks| blocks.first())
            .map(|first| {
                first.get("type").and_then(|t| t.as_str()) == Some("thinking")
                    && first
                        .get("signature")
                        .and_then(|s| s.as_str())
                        .is_some_and(|s| !s.is_empty())
            })
            .unwrap_or(false);

        if !has_valid_prefix {
            thinking_enabled = false;
            cleaned.remove("thinking");
        }
    }

    if let Some(Value::Array(messages)) = cleaned.get("messages").cloned() {
        let total = messages.len();
        let cleaned_messages: Vec<Value> = messages
            .into_iter()
            .enumerate()
            .filter_map(|(idx, msg)| clean_message(msg, thinking_enabled, idx + 1 == total))
            .collect();
        cleaned.insert("messages".into(), Value::Array(cleaned_messages));
    }

    if let Some(Value::Array(tools)) = cleaned.get("tools").cloned() {
        let cleaned_tools: Vec<Value> = tools.into_iter().filter_map(clean_tool).collect();
        cleaned.insert("tools".into(), Value::Array(cleaned_tools));
    }

    Value::Object(cleaned)
}

fn clean_message(message: Value, thinking_enabled: bool, is_last: bool) -> Option<Value> {
    let Some(object) = message.as_object() else {
        return Some(message);
    };
    let role = object.get("role").and_then(|r| r.as_str()).unwrap_or("");

    let content = match object.get("content") {
        Some(Value::Array(blocks)) => {
            let cleaned: Vec<Value> = blocks
                .iter()
                .filter_map(|block| clean_content_block(block, thinking_enabled))
                .collect();
            Some(Value::Array(cleaned))
        }
        other => other.cloned(),
    };

    let is_empty = match &content {
        None => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(blocks)) => blocks.is_empty(),
        _ => false,
    };
    // An empty trailing assistant message is a legal prefill; anything
    // else empty is dropped.
    if is_empty && !(role == "assistant" && is_last) {
        return None;
    }

    let mut cleaned = object.clone();
    if let Some(content) = content {
        cleaned.insert("content".into(), content);
    }
    Some(Value::Object(cleaned))
}

fn clean_content_block(block: &Value, thinking_enabled: bool) -> Option<Value> {
    let block_type = block.get("type").and_then(|t| t.as_str());
    match block_type {
        Some("thinking") => {
            if !thinking_enabled {
                return None;
            }
            if block
                .get("signature")
                .and_then(|s| s.as_str())
                .is_some_and(|s| !s.is_empty())
            {
                Some(block.clone())
            } else {
                // Unsigned reasoning degrades to plain text
                let thinking = block.get("thinking").and_then(|t| t.as_str()).unwrap_or("");
                Some(json!({
                    "type": "text",
                    "text": format!("<previous_thinking>{}</previous_thinking>", thinking)
                }))
            }
        }
        Some("redacted_thinking") => {
            (thinking_enabled && block.get("data").is_some()).then(|| block.clone())
        }
        _ => Some(block.clone()),
    }
}

fn clean_tool(tool: Value) -> Option<Value> {
    let object = tool.as_object()?;
    let tool_type = object.get("type").and_then(|t| t.as_str());

    if let Some(tool_type) = tool_type {
        if BUILTIN_TOOL_TYPES.contains(&tool_type) {
            let mut t = Map::new();
            t.insert("type".into(), json!(tool_type));
            if let Some(name) = object.get("name") {
                t.insert("name".into(), name.clone());
            }
            return Some(Value::Object(t));
        }
    }

    // Custom wrapper: fields live in the nested `custom` object, falling
    // back to the top level per field
    if tool_type == Some("custom") {
        let custom = object.get("custom").and_then(|c| c.as_object());
        let mut t = Map::new();
        for field in ["name", "description", "input_schema"] {
            if let Some(v) = custom.and_then(|c| c.get(field)) {
                t.insert(field.into(), v.clone());
            } else if let Some(v) = object.get(field) {
                t.insert(field.into(), v.clone());
            }
        }
        return t.contains_key("name").then_some(Value::Object(t));
    }

    // OpenAI-style wrapper: unwrap {type: "function", function: {...}}
    if tool_type == Some("function") || object.contains_key("function") {
        let function = object.get("function").and_then(|f| f.as_object());
        let mut t = Map::new();
        if let Some(function) = function {
            for (src, dst) in [("name", "name"), ("description", "description"), ("parameters", "input_schema")] {
                if let Some(v) = function.get(src) {
                    t.insert(dst.into(), v.clone());
                }
            }
        }
        if !t.contains_key("name") {
            if let Some(name) = object.get("name") {
                t.insert("name".into(), name.clone());
            }
        }
        return t.contains_key("name").then_some(Value::Object(t));
    }

    // Untyped plain Anthropic tool; anything with an unrecognized type
    // tag is dropped
    if tool_type.is_none() {
        if let Some(name) = object.get("name") {
            let mut t = Map::new();
            t.insert("name".into(), name.clone());
            if let Some(description) = object.get("description") {
                t.insert("description".into(), description.clone());
            }
            if let Some(schema) = object.get("input_schema").or_else(|| object.get("parameters")) {
                t.insert("input_schema".into(), schema.clone());
            }
            return Some(Value::Object(t));
        }
    }

    None
}
