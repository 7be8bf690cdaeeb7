use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::StreamEvent;
use crate::message::UiMessage;
use crate::selection::ModelSelection;

/// Cancellation signal attached to one turn's network read.
pub type CancelToken = CancellationToken;

/// Ordered events of exactly one turn.
pub type EventStream = BoxStream<'static, Result<StreamEvent, StreamSourceError>>;

/// Process-local identifier of one turn.
pub type TurnId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TurnTrigger {
    SubmitMessage,
    /// Regenerates the assistant message with `message_id` in place.
    RegenerateMessage { message_id: String },
}

impl TurnTrigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmitMessage => "submit-message",
            Self::RegenerateMessage { .. } => "regenerate-message",
        }
    }
}

/// Everything a stream source needs to open one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub turn_id: TurnId,
    pub thread_id: String,
    /// Live transcript the model should answer, oldest first.
    pub messages: Vec<UiMessage>,
    pub model_selection: ModelSelection,
    pub trigger: TurnTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSourceError {
    pub message: String,
}

impl StreamSourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StreamSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StreamSourceError {}

impl From<String> for StreamSourceError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for StreamSourceError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Producer of protocol event streams, one stream per turn.
///
/// Implementations must stop producing promptly once `cancel` fires. Events
/// that were read from the network but not yet yielded are discarded.
#[async_trait]
pub trait StreamSource: Send + Sync + 'static {
    fn source_id(&self) -> &str;

    async fn open(
        &self,
        request: TurnRequest,
        cancel: CancelToken,
    ) -> Result<EventStream, StreamSourceError>;
}
