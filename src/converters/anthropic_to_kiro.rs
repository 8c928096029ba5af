// Anthropic → Kiro request translation.
//
// Kiro takes the whole conversation in one payload: prior (user,
// assistant) pairs in previousTurns and the live prompt in
// userInputMessage. Tool results have no dedicated slot and are folded
// into the user text.

use serde_json::{json, Value};
use uuid::Uuid;

use super::{extract_system_text, thinking_hint};
use crate::models::anthropic::AnthropicMessagesRequest;
use crate::models::kiro::{
    AssistantResponseMessage, InputSchema, KiroImage, KiroImageSource, KiroRequest, KiroToolUse,
    ToolSpec, ToolSpecification, Turn, UserInputMessage,
};

/// Display-name to Kiro model-id mapping. Names already in internal form
/// pass through unchanged; anything unknown runs on the default model.
const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-3-7-sonnet", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-3-5-haiku-20241022", "CLAUDE_3_5_HAIKU_20241022_V1_0"),
    ("claude-haiku-4-5", "CLAUDE_HAIKU_4_5_20251001_V1_0"),
    ("claude-opus-4-5", "CLAUDE_OPUS_4_5_20251101_V1_0"),
    ("claude-opus-4-6", "CLAUDE_OPUS_4_6_20260205_V1_0"),
];

const DEFAULT_MODEL_ID: &str = "CLAUDE_SONNET_4_20250514_V1_0";

pub fn map_model_id(model: &str) -> String {
    if let Some((_, id)) = MODEL_MAP.iter().find(|(name, _)| *name == model) {
        return id.to_string();
    }
    // Internal ids are upper-snake already
    if model.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
        return model.to_string();
    }
    tracing::debug!("Unknown model '{}', using default", model);
    DEFAULT_MODEL_ID.to_string()
}

/// Build the Kiro payload for an Anthropic request
pub fn build_kiro_request(
    request: &AnthropicMessagesRequest,
    profile_arn: Option<String>,
) -> KiroRequest {
    let mut system = request
        .system
        .as_ref()
        .map(extract_system_text)
        .unwrap_or_default();

    if request.thinking_enabled() {
        let hint = thinking_hint(request.thinking_budget());
        system = if system.is_empty() {
            hint
        } else {
            format!("{}\n{}", hint, system)
        };
    }

    // Fold the conversation into (user, assistant) turns
    let mut turns: Vec<Turn> = Vec::new();
    let mut pending_user: Option<(String, Vec<KiroImage>)> = None;

    for message in &request.messages {
        match message.role.as_str() {
            "user" => {
                let (text, images) = flatten_user_content(&message.content);
                match &mut pending_user {
                    Some((pending_text, pending_images)) => {
                        if !text.is_empty() {
                            if !pending_text.is_empty() {
                                pending_text.push('\n');
                            }
                            pending_text.push_str(&text);
                        }
                        pending_images.extend(images);
                    }
                    None => pending_user = Some((text, images)),
                }
            }
            "assistant" => {
                let (text, tool_uses) = flatten_assistant_content(&message.content);
                let (user_text, user_images) =
                    pending_user.take().unwrap_or_else(|| (String::new(), Vec::new()));
                turns.push(Turn {
                    user_input_message: UserInputMessage {
                        content: if user_text.is_empty() { ".".into() } else { user_text },
                        images: (!user_images.is_empty()).then_some(user_images),
                    },
                    assistant_response_message: AssistantResponseMessage {
                        content: text,
                        tool_uses: (!tool_uses.is_empty()).then_some(tool_uses),
                    },
                });
            }
            _ => {}
        }
    }

    let (current_text, current_images) =
        pending_user.unwrap_or_else(|| ("Continue.".to_string(), Vec::new()));

    let mut kiro_request = KiroRequest {
        conversation_id: Uuid::new_v4().to_string(),
        model_id: map_model_id(&request.model),
        profile_arn: None,
        user_input_message: UserInputMessage {
            content: if current_text.is_empty() { ".".into() } else { current_text },
            images: None,
        },
        user_input_message_context: Default::default(),
        tool_configuration: None,
    }
    .with_system(system)
    .with_turns(turns)
    .with_images(current_images)
    .with_profile_arn(profile_arn);

    if let Some(tools) = &request.tools {
        kiro_request = kiro_request.with_tools(
            tools
                .iter()
                .map(|tool| ToolSpec {
                    tool_specification: ToolSpecification {
                        name: tool.name.clone(),
                        description: tool.description.clone().unwrap_or_default(),
                        input_schema: InputSchema {
                            json: tool
                                .input_schema
                                .clone()
                                .unwrap_or_else(|| json!({"type": "object"})),
                        },
                    },
                })
                .collect(),
        );
    }

    kiro_request
}

fn flatten_user_content(content: &Value) -> (String, Vec<KiroImage>) {
    match content {
        Value::String(text) => (text.clone(), Vec::new()),
        Value::Array(blocks) => {
            let mut parts: Vec<String> = Vec::new();
            let mut images: Vec<KiroImage> = Vec::new();

            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            parts.push(text.to_string());
                        }
                    }
                    Some("tool_result") => {
                        let id = block
                            .get("tool_use_id")
                            .and_then(|i| i.as_str())
                            .unwrap_or("unknown");
                        let text = tool_result_text(block);
                        parts.push(format!("[Tool result for {}]\n{}", id, text));
                    }
                    Some("image") => {
                        if let Some(image) = convert_image(block) {
                            images.push(image);
                        }
                    }
                    _ => {}
                }
            }

            (parts.join("\n"), images)
        }
        _ => (String::new(), Vec::new()),
    }
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn convert_image(block: &Value) -> Option<KiroImage> {
    let source = block.get("source")?;
    if source.get("type").and_then(|t| t.as_str()) != Some("base64") {
        return None;
    }
    let media_type = source.get("media_type").and_then(|m| m.as_str())?;
    let data = source.get("data").and_then(|d| d.as_str())?;

    Some(KiroImage {
        format: media_type.strip_prefix("image/").unwrap_or("png").to_string(),
        source: KiroImageSource {
            bytes: data.to_string(),
        },
    })
}

fn flatten_assistant_content(content: &Value) -> (String, Vec<KiroToolUse>) {
    match content {
        Value::String(text) => (text.clone(), Vec::new()),
        Value::Array(blocks) => {
            let mut parts: Vec<String> = Vec::new();
            let mut tool_uses: Vec<KiroToolUse> = Vec::new();

            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        if let (Some(id), Some(name)) = (
                            block.get("id").and_then(|i| i.as_str()),
                            block.get("name").and_then(|n| n.as_str()),
                        ) {
                            tool_uses.push(KiroToolUse {
                                tool_use_id: id.to_string(),
                                name: name.to_string(),
                                input: block.get("input").cloned().unwrap_or(json!({})),
                            });
                        }
                    }
                    // Thinking history is not replayed upstream
                    _ => {}
                }
            }

            (parts.join("\n"), tool_uses)
        }
        _ => (String::new(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::anthropic::{AnthropicMessage, AnthropicTool};

    fn request(messages: Vec<(&str, Value)>) -> AnthropicMessagesRequest {
        AnthropicMessagesRequest {
            model: "claude-sonnet-4".into(),
            messages: messages
                .into_iter()
                .map(|(role, content)| AnthropicMessage {
                    role: role.into(),
                    content,
                })
                .collect(),
            max_tokens: 1024,
            system: None,
            stream: true,
            thinking: None,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        }
    }

    #[test]
    fn test_model_mapping() {
        assert_eq!(map_model_id("claude-sonnet-4"), "CLAUDE_SONNET_4_20250514_V1_0");
        assert_eq!(
            map_model_id("CLAUDE_OPUS_4_5_20251101_V1_0"),
            "CLAUDE_OPUS_4_5_20251101_V1_0"
        );
        assert_eq!(map_model_id("gpt-4o"), DEFAULT_MODEL_ID);
    }

    #[test]
    fn test_single_turn() {
        let req = request(vec![("user", json!("hello"))]);
        let kiro = build_kiro_request(&req, None);

        assert_eq!(kiro.user_input_message.content, "hello");
        assert!(kiro.user_input_message_context.previous_turns.is_empty());
    }

    #[test]
    fn test_history_folds_into_turns() {
        let req = request(vec![
            ("user", json!("first question")),
            ("assistant", json!("first answer")),
            ("user", json!("second question")),
        ]);
        let kiro = build_kiro_request(&req, None);

        let turns = &kiro.user_input_message_context.previous_turns;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].user_input_message.content, "first question");
        assert_eq!(turns[0].assistant_response_message.content, "first answer");
        assert_eq!(kiro.user_input_message.content, "second question");
    }

    #[test]
    fn test_trailing_assistant_yields_continue() {
        let req = request(vec![
            ("user", json!("q")),
            ("assistant", json!("partial")),
        ]);
        let kiro = build_kiro_request(&req, None);
        assert_eq!(kiro.user_input_message.content, "Continue.");
    }

    #[test]
    fn test_tool_results_folded_into_text() {
        let req = request(vec![(
            "user",
            json!([
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "exit 0"},
                {"type": "text", "text": "looks done"}
            ]),
        )]);
        let kiro = build_kiro_request(&req, None);
        assert!(kiro.user_input_message.content.contains("[Tool result for toolu_1]"));
        assert!(kiro.user_input_message.content.contains("exit 0"));
        assert!(kiro.user_input_message.content.contains("looks done"));
    }

    #[test]
    fn test_assistant_tool_uses_preserved_in_history() {
        let req = request(vec![
            ("user", json!("run ls")),
            (
                "assistant",
                json!([
                    {"type": "text", "text": "sure"},
                    {"type": "tool_use", "id": "toolu_2", "name": "bash", "input": {"cmd": "ls"}}
                ]),
            ),
            ("user", json!([{"type": "tool_result", "tool_use_id": "toolu_2", "content": "a.txt"}])),
        ]);
        let kiro = build_kiro_request(&req, None);

        let turn = &kiro.user_input_message_context.previous_turns[0];
        let tool_uses = turn.assistant_response_message.tool_uses.as_ref().unwrap();
        assert_eq!(tool_uses[0].tool_use_id, "toolu_2");
        assert_eq!(tool_uses[0].name, "bash");
    }

    #[test]
    fn test_thinking_hint_in_system() {
        let mut req = request(vec![("user", json!("hi"))]);
        req.system = Some(json!("be good"));
        req.thinking = Some(crate::models::anthropic::ThinkingConfig {
            config_type: "enabled".into(),
            budget_tokens: Some(5000),
        });

        let kiro = build_kiro_request(&req, None);
        let system = &kiro.user_input_message_context.system.as_ref().unwrap()[0].text;
        assert!(system.starts_with("<thinking_mode>enabled</thinking_mode>"));
        assert!(system.contains("<max_thinking_length>5000</max_thinking_length>"));
        assert!(system.ends_with("be good"));
    }

    #[test]
    fn test_tools_and_images() {
        let mut req = request(vec![(
            "user",
            json!([
                {"type": "text", "text": "what is this"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "QUJD"}}
            ]),
        )]);
        req.tools = Some(vec![AnthropicTool {
            name: "zoom".into(),
            description: None,
            input_schema: None,
        }]);

        let kiro = build_kiro_request(&req, Some("arn:aws:profile/x".into()));
        assert_eq!(kiro.profile_arn.as_deref(), Some("arn:aws:profile/x"));

        let images = kiro.user_input_message.images.as_ref().unwrap();
        assert_eq!(images[0].format, "jpeg");
        assert_eq!(images[0].source.bytes, "QUJD");

        let tools = &kiro.tool_configuration.as_ref().unwrap().tools;
        assert_eq!(tools[0].tool_specification.name, "zoom");
        assert_eq!(tools[0].tool_specification.input_schema.json["type"], "object");
    }
}
