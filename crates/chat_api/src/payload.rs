use chat_protocol::{ModelSelection, TurnRequest, TurnTrigger, UiMessage};
use serde::{Deserialize, Serialize};

/// Request body posted to the chat endpoint for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Thread the turn belongs to.
    pub id: String,
    pub messages: Vec<UiMessage>,
    pub model_selection: ModelSelection,
    /// `submit-message` or `regenerate-message`.
    pub trigger: String,
    /// Target of a regeneration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl From<&TurnRequest> for ChatRequest {
    fn from(request: &TurnRequest) -> Self {
        let message_id = match &request.trigger {
            TurnTrigger::SubmitMessage => None,
            TurnTrigger::RegenerateMessage { message_id } => Some(message_id.clone()),
        };

        Self {
            id: request.thread_id.clone(),
            messages: request.messages.clone(),
            model_selection: request.model_selection.clone(),
            trigger: request.trigger.as_str().to_owned(),
            message_id,
        }
    }
}
