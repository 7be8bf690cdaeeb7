use chat_protocol::{ModelSelection, ThreadRecord, ThreadUsage, UiMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /threads` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateThread {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_user_message: Option<UiMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_selection: Option<ModelSelection>,
}

impl CreateThread {
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_initial_user_message(mut self, message: UiMessage) -> Self {
        self.initial_user_message = Some(message);
        self
    }

    #[must_use]
    pub fn with_model_selection(mut self, selection: ModelSelection) -> Self {
        self.model_selection = Some(selection);
        self
    }
}

/// `POST /threads/:id/messages` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertMessage {
    pub message: UiMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_selection: Option<ModelSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ThreadUsage>,
}

impl UpsertMessage {
    #[must_use]
    pub fn new(message: UiMessage) -> Self {
        Self {
            message,
            model_selection: None,
            usage: None,
        }
    }

    #[must_use]
    pub fn with_model_selection(mut self, selection: ModelSelection) -> Self {
        self.model_selection = Some(selection);
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: ThreadUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// `PATCH /threads/:id` body. The selection stays loosely typed on the wire
/// so malformed selections can be rejected explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateThreadBody {
    pub model_selection: Value,
}

/// `PATCH /threads/:id/messages/:messageId` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditMessageBody {
    pub message: UiMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadEnvelope {
    pub thread: ThreadRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadListEnvelope {
    pub threads: Vec<ThreadRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkEnvelope {
    pub ok: bool,
}
