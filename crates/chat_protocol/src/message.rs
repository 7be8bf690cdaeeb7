use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Streaming state of a text or reasoning part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartState {
    Streaming,
    #[default]
    Done,
}

/// Tool invocation lifecycle.
///
/// `input-streaming -> input-available -> (approval-requested) ->
/// output-available | output-error | output-denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    ApprovalRequested,
    OutputAvailable,
    OutputError,
    OutputDenied,
}

impl ToolState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputStreaming => "input-streaming",
            Self::InputAvailable => "input-available",
            Self::ApprovalRequested => "approval-requested",
            Self::OutputAvailable => "output-available",
            Self::OutputError => "output-error",
            Self::OutputDenied => "output-denied",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OutputAvailable | Self::OutputError | Self::OutputDenied
        )
    }

    /// Returns true once the tool input is final and outputs may be attached.
    #[must_use]
    pub fn accepts_output(&self) -> bool {
        matches!(self, Self::InputAvailable | Self::ApprovalRequested)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
    #[serde(default)]
    pub state: PartState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningPart {
    pub text: String,
    #[serde(default)]
    pub state: PartState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPart {
    pub tool_call_id: String,
    pub tool_name: String,
    pub state: ToolState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

impl ToolPart {
    #[must_use]
    pub fn streaming(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state: ToolState::InputStreaming,
            input: None,
            output: None,
            error_text: None,
            approval_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePart {
    pub media_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceUrlPart {
    pub source_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One typed part of a message, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text(TextPart),
    Reasoning(ReasoningPart),
    Tool(ToolPart),
    File(FilePart),
    SourceUrl(SourceUrlPart),
}

impl MessagePart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextPart {
            text: text.into(),
            state: PartState::Done,
        })
    }

    #[must_use]
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning(ReasoningPart {
            text: text.into(),
            state: PartState::Done,
        })
    }
}

/// Render-ready conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl UiMessage {
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn user_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut message = Self::new(id, Role::User);
        message.parts.push(MessagePart::text(text));
        message
    }

    #[must_use]
    pub fn assistant_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut message = Self::new(id, Role::Assistant);
        message.parts.push(MessagePart::text(text));
        message
    }

    /// Concatenation of all text parts, in order, without separators.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text(part) => Some(part.text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn reasoning_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Reasoning(part) => Some(part.text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn tool_part(&self, tool_call_id: &str) -> Option<&ToolPart> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::Tool(tool) if tool.tool_call_id == tool_call_id => Some(tool),
            _ => None,
        })
    }

    /// Returns true when no part is still streaming.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.parts.iter().all(|part| match part {
            MessagePart::Text(part) => part.state == PartState::Done,
            MessagePart::Reasoning(part) => part.state == PartState::Done,
            MessagePart::Tool(part) => part.state != ToolState::InputStreaming,
            MessagePart::File(_) | MessagePart::SourceUrl(_) => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn parts_are_tagged_by_type() {
        let message = UiMessage {
            id: "m1".to_string(),
            role: Role::Assistant,
            parts: vec![
                MessagePart::reasoning("think"),
                MessagePart::text("answer"),
                MessagePart::Tool(ToolPart::streaming("call-1", "search")),
            ],
            metadata: None,
        };

        let value = serde_json::to_value(&message).expect("message should serialize");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["parts"][0]["type"], "reasoning");
        assert_eq!(value["parts"][1]["type"], "text");
        assert_eq!(value["parts"][1]["state"], "done");
        assert_eq!(value["parts"][2]["type"], "tool");
        assert_eq!(value["parts"][2]["toolCallId"], "call-1");
        assert_eq!(value["parts"][2]["state"], "input-streaming");

        let decoded: UiMessage = serde_json::from_value(value).expect("message should decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn text_parts_default_to_done_when_state_is_missing() {
        let message: UiMessage = serde_json::from_value(json!({
            "id": "u1",
            "role": "user",
            "parts": [{"type": "text", "text": "hi"}],
        }))
        .expect("user message should decode");

        assert_eq!(message, UiMessage::user_text("u1", "hi"));
    }

    #[test]
    fn text_concatenates_parts_without_separators() {
        let mut message = UiMessage::assistant_text("a1", "Hello");
        message.parts.push(MessagePart::reasoning("ignored"));
        message.parts.push(MessagePart::text(", world"));

        assert_eq!(message.text(), "Hello, world");
        assert_eq!(message.reasoning_text(), "ignored");
    }

    #[test]
    fn tool_state_terminal_and_output_acceptance() {
        assert!(!ToolState::InputStreaming.accepts_output());
        assert!(ToolState::InputAvailable.accepts_output());
        assert!(ToolState::ApprovalRequested.accepts_output());
        assert!(ToolState::OutputDenied.is_terminal());
        assert!(!ToolState::ApprovalRequested.is_terminal());
    }

    #[test]
    fn settled_reports_streaming_parts() {
        let mut message = UiMessage::new("a1", Role::Assistant);
        message.parts.push(MessagePart::Text(TextPart {
            text: "partial".to_string(),
            state: PartState::Streaming,
        }));
        assert!(!message.is_settled());

        message.parts[0] = MessagePart::text("partial");
        assert!(message.is_settled());
    }
}
