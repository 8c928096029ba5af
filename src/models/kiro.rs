// Kiro (CodeWhisperer) wire models. The upstream speaks a camelCase
// conversation-state protocol; requests carry the whole history in
// previousTurns and the current prompt in userInputMessage.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==================================================================================================
// Request models
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroRequest {
    pub conversation_id: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    pub user_input_message: UserInputMessage,
    pub user_input_message_context: UserInputMessageContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_configuration: Option<ToolConfiguration>,
}

impl KiroRequest {
    pub fn new(model_id: String, message: String) -> Self {
        Self {
            conversation_id: Uuid::new_v4().to_string(),
            model_id,
            profile_arn: None,
            user_input_message: UserInputMessage {
                content: message,
                images: None,
            },
            user_input_message_context: UserInputMessageContext {
                system: None,
                previous_turns: vec![],
            },
            tool_configuration: None,
        }
    }

    pub fn with_system(mut self, system: String) -> Self {
        if !system.is_empty() {
            self.user_input_message_context.system = Some(vec![SystemBlock { text: system }]);
        }
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        if !tools.is_empty() {
            self.tool_configuration = Some(ToolConfiguration { tools });
        }
        self
    }

    pub fn with_turns(mut self, turns: Vec<Turn>) -> Self {
        self.user_input_message_context.previous_turns = turns;
        self
    }

    pub fn with_images(mut self, images: Vec<KiroImage>) -> Self {
        if !images.is_empty() {
            self.user_input_message.images = Some(images);
        }
        self
    }

    pub fn with_profile_arn(mut self, profile_arn: Option<String>) -> Self {
        self.profile_arn = profile_arn;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<KiroImage>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Vec<SystemBlock>>,
    #[serde(default)]
    pub previous_turns: Vec<Turn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub user_input_message: UserInputMessage,
    pub assistant_response_message: AssistantResponseMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<KiroToolUse>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroImage {
    pub format: String,
    pub source: KiroImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroImageSource {
    pub bytes: String,
}

// ==================================================================================================
// Tool models
// ==================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfiguration {
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_camel_case() {
        let req = KiroRequest::new("CLAUDE_SONNET_4_20250514_V1_0".into(), "hello".into())
            .with_system("be brief".into());
        let json = serde_json::to_value(&req).unwrap();

        assert!(json.get("conversationId").is_some());
        assert!(json.get("modelId").is_some());
        assert_eq!(json["userInputMessage"]["content"], "hello");
        assert_eq!(
            json["userInputMessageContext"]["system"][0]["text"],
            "be brief"
        );
        // Absent optionals are omitted entirely
        assert!(json.get("toolConfiguration").is_none());
        assert!(json.get("profileArn").is_none());
    }

    #[test]
    fn test_tool_spec_shape() {
        let spec = ToolSpec {
            tool_specification: ToolSpecification {
                name: "get_weather".into(),
                description: "weather lookup".into(),
                input_schema: InputSchema {
                    json: serde_json::json!({"type": "object"}),
                },
            },
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["toolSpecification"]["name"], "get_weather");
        assert_eq!(json["toolSpecification"]["inputSchema"]["json"]["type"], "object");
    }
}
