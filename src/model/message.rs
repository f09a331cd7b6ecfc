use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Base64 {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::Url { url: url.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of a conversation, provider-agnostic.
///
/// Tool-result turns carry the `call_id` of the request they answer and the
/// function name; assistant turns that requested calls are reconstructed by
/// the adapters from [`Response::function_calls`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
    /// Function name for tool-result turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the function call this turn answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Marks a tool result that reports an executor failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
            name: None,
            call_id: None,
            is_error: false,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, text)
    }

    pub fn user_with_image(text: impl Into<String>, source: ImageSource) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![
                ContentPart::Text { text: text.into() },
                ContentPart::Image { source },
            ],
            name: None,
            call_id: None,
            is_error: false,
            metadata: serde_json::Map::new(),
        }
    }

    /// Result of executing a requested function call.
    pub fn tool_result(
        name: impl Into<String>,
        call_id: Option<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: vec![ContentPart::Text {
                text: content.into(),
            }],
            name: Some(name.into()),
            call_id,
            is_error,
            metadata: serde_json::Map::new(),
        }
    }

    /// Concatenated text parts; image parts are skipped.
    pub fn text_content(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect();
        parts.join("\n")
    }

    pub fn has_images(&self) -> bool {
        self.content
            .iter()
            .any(|part| matches!(part, ContentPart::Image { .. }))
    }
}

/// Rough character count of a conversation, used for cost estimation.
pub fn conversation_char_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|message| message.text_content().chars().count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_constructor_builds_single_text_part() {
        let message = Message::user("hello");
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.text_content(), "hello");
        assert!(!message.has_images());
    }

    #[test]
    fn tool_result_carries_name_and_call_id() {
        let message = Message::tool_result("calc", Some("call_1".into()), "4", false);
        assert_eq!(message.role, MessageRole::Tool);
        assert_eq!(message.name.as_deref(), Some("calc"));
        assert_eq!(message.call_id.as_deref(), Some("call_1"));
        assert!(!message.is_error);
    }

    #[test]
    fn text_content_skips_image_parts() {
        let message = Message::user_with_image("look", ImageSource::url("https://x/y.png"));
        assert_eq!(message.text_content(), "look");
        assert!(message.has_images());
    }

    #[test]
    fn message_serde_round_trip() {
        let message = Message::tool_result("search", Some("call_9".into()), "no results", true);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["is_error"], true);
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn char_count_sums_text_parts() {
        let messages = vec![Message::user("abcd"), Message::assistant("ef")];
        assert_eq!(conversation_char_count(&messages), 6);
    }
}
