use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire tags of every event kind this crate understands.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "start",
    "start-step",
    "reasoning-start",
    "reasoning-delta",
    "reasoning-end",
    "text-start",
    "text-delta",
    "text-end",
    "tool-input-start",
    "tool-input-delta",
    "tool-input-available",
    "tool-approval-request",
    "tool-output-available",
    "tool-output-error",
    "tool-output-denied",
    "file",
    "source-url",
    "message-metadata",
    "finish-step",
    "finish",
    "abort",
    "error",
];

/// One protocol chunk of a streamed assistant turn, tagged by `type`.
///
/// Unknown tags are preserved as [`StreamEvent::Unknown`] through
/// [`StreamEvent::from_value`] rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum StreamEvent {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    StartStep {},
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    ToolApprovalRequest {
        approval_id: String,
        tool_call_id: String,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        #[serde(default)]
        output: Value,
    },
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    ToolOutputDenied {
        tool_call_id: String,
    },
    File {
        url: String,
        media_type: String,
    },
    SourceUrl {
        source_id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    MessageMetadata {
        message_metadata: Value,
    },
    FinishStep {},
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        error_text: String,
    },
    /// Event with an unrecognised tag, kept verbatim for forward compatibility.
    #[serde(skip)]
    Unknown { event_type: String, payload: Value },
}

impl StreamEvent {
    /// Decodes one wire object, keeping unknown tags opaque.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Some(event_type) = value.get("type").and_then(Value::as_str) else {
            return Err(serde_json::Error::custom(
                "stream event is missing a string `type` tag",
            ));
        };

        if KNOWN_EVENT_TYPES.contains(&event_type) {
            return serde_json::from_value(value);
        }

        Ok(Self::Unknown {
            event_type: event_type.to_string(),
            payload: value,
        })
    }

    /// Encodes the event back into its wire object.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Unknown { payload, .. } => Ok(payload.clone()),
            known => serde_json::to_value(known),
        }
    }

    /// Wire tag of this event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::Start { .. } => "start",
            Self::StartStep {} => "start-step",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolApprovalRequest { .. } => "tool-approval-request",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::ToolOutputError { .. } => "tool-output-error",
            Self::ToolOutputDenied { .. } => "tool-output-denied",
            Self::File { .. } => "file",
            Self::SourceUrl { .. } => "source-url",
            Self::MessageMetadata { .. } => "message-metadata",
            Self::FinishStep {} => "finish-step",
            Self::Finish { .. } => "finish",
            Self::Abort { .. } => "abort",
            Self::Error { .. } => "error",
            Self::Unknown { event_type, .. } => event_type,
        }
    }

    /// Returns true when this event ends the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finish { .. } | Self::Abort { .. } | Self::Error { .. }
        )
    }

    #[must_use]
    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    #[must_use]
    pub fn reasoning_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::ReasoningDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{StreamEvent, KNOWN_EVENT_TYPES};

    #[test]
    fn decodes_camel_case_wire_fields() {
        let event = StreamEvent::from_value(json!({
            "type": "tool-input-delta",
            "toolCallId": "call-1",
            "inputTextDelta": "{\"q\":",
        }))
        .expect("tool input delta should decode");

        assert_eq!(
            event,
            StreamEvent::ToolInputDelta {
                tool_call_id: "call-1".to_string(),
                input_text_delta: "{\"q\":".to_string(),
            }
        );
    }

    #[test]
    fn empty_and_optional_payloads_decode() {
        assert_eq!(
            StreamEvent::from_value(json!({"type": "start-step"})).expect("start-step"),
            StreamEvent::StartStep {}
        );
        assert_eq!(
            StreamEvent::from_value(json!({"type": "finish"})).expect("finish"),
            StreamEvent::Finish {
                finish_reason: None
            }
        );
        assert_eq!(
            StreamEvent::from_value(json!({"type": "start", "messageId": "msg-1"}))
                .expect("start"),
            StreamEvent::Start {
                message_id: Some("msg-1".to_string())
            }
        );
    }

    #[test]
    fn unknown_tags_are_preserved_opaquely() {
        let payload = json!({"type": "data-weather", "data": {"temp": 21}});
        let event = StreamEvent::from_value(payload.clone()).expect("unknown tag is not an error");

        assert_eq!(event.event_type(), "data-weather");
        assert!(!event.is_terminal());
        assert_eq!(event.to_value().expect("unknown re-encodes"), payload);
    }

    #[test]
    fn malformed_known_events_and_missing_tags_are_errors() {
        assert!(StreamEvent::from_value(json!({"type": "text-delta", "id": "t"})).is_err());
        assert!(StreamEvent::from_value(json!({"delta": "x"})).is_err());
    }

    #[test]
    fn event_type_matches_serialized_tag_for_known_events() {
        let samples = vec![
            StreamEvent::Start { message_id: None },
            StreamEvent::StartStep {},
            StreamEvent::ReasoningStart { id: "r".into() },
            StreamEvent::reasoning_delta("r", "x"),
            StreamEvent::ReasoningEnd { id: "r".into() },
            StreamEvent::TextStart { id: "t".into() },
            StreamEvent::text_delta("t", "x"),
            StreamEvent::TextEnd { id: "t".into() },
            StreamEvent::ToolInputStart {
                tool_call_id: "c".into(),
                tool_name: "n".into(),
            },
            StreamEvent::ToolInputDelta {
                tool_call_id: "c".into(),
                input_text_delta: "{".into(),
            },
            StreamEvent::ToolInputAvailable {
                tool_call_id: "c".into(),
                tool_name: "n".into(),
                input: json!({}),
            },
            StreamEvent::ToolApprovalRequest {
                approval_id: "a".into(),
                tool_call_id: "c".into(),
            },
            StreamEvent::ToolOutputAvailable {
                tool_call_id: "c".into(),
                output: json!("ok"),
            },
            StreamEvent::ToolOutputError {
                tool_call_id: "c".into(),
                error_text: "bad".into(),
            },
            StreamEvent::ToolOutputDenied {
                tool_call_id: "c".into(),
            },
            StreamEvent::File {
                url: "https://example.com/a.png".into(),
                media_type: "image/png".into(),
            },
            StreamEvent::SourceUrl {
                source_id: "s".into(),
                url: "https://example.com".into(),
                title: None,
            },
            StreamEvent::MessageMetadata {
                message_metadata: json!({}),
            },
            StreamEvent::FinishStep {},
            StreamEvent::Finish {
                finish_reason: Some("stop".into()),
            },
            StreamEvent::Abort { reason: None },
            StreamEvent::Error {
                error_text: "boom".into(),
            },
        ];

        assert_eq!(samples.len(), KNOWN_EVENT_TYPES.len());
        for event in samples {
            let value = event.to_value().expect("known events serialize");
            assert_eq!(value["type"], event.event_type());
            assert!(KNOWN_EVENT_TYPES.contains(&event.event_type()));
            assert_eq!(
                StreamEvent::from_value(value).expect("known events decode"),
                event
            );
        }
    }
}
