//! Folds one turn's ordered protocol events into a draft assistant message.
//!
//! The processor owns no I/O. It is driven event by event by the session
//! controller and can be snapshotted at any point. Events that reference a
//! part or tool call that was never opened are protocol violations: they are
//! logged, dropped, and reported to the caller, but never end the turn.

use std::collections::{HashMap, HashSet};

use chat_protocol::{
    FilePart, MessagePart, PartState, ReasoningPart, Role, SourceUrlPart, StreamEvent, TextPart,
    ThreadUsage, ToolPart, ToolState, UiMessage,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Error text recorded when a stream closes without `finish`, `abort` or `error`.
pub const STREAM_ENDED_WITHOUT_TERMINAL: &str = "stream ended without a terminal event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnStatus {
    #[default]
    Idle,
    Submitted,
    Streaming,
    Ready,
    Error,
}

impl TurnStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Submitted => "submitted",
            Self::Streaming => "streaming",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitted | Self::Streaming)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    Text,
    Reasoning,
}

impl PartKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Reasoning => "reasoning",
        }
    }
}

/// An event that could not be applied to the draft. The event is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("{event_type} received before the turn began")]
    NotStarted { event_type: String },

    #[error("{event_type} received after the turn ended")]
    AfterTerminal { event_type: String },

    #[error("{} part '{id}' was never opened", .kind.as_str())]
    UnknownPart { kind: PartKind, id: String },

    #[error("{} part '{id}' is already closed", .kind.as_str())]
    ClosedPart { kind: PartKind, id: String },

    #[error("{} part '{id}' was opened twice", .kind.as_str())]
    DuplicatePart { kind: PartKind, id: String },

    #[error("tool call '{tool_call_id}' referenced by {event_type} was never started")]
    UnknownToolCall {
        tool_call_id: String,
        event_type: String,
    },

    #[error("message id '{message_id}' already belongs to a live message")]
    MessageIdInUse { message_id: String },

    #[error("{event_type} is not valid for tool call '{tool_call_id}' in state {state}")]
    InvalidToolTransition {
        tool_call_id: String,
        event_type: String,
        state: &'static str,
    },
}

/// Incremental state machine for one in-flight turn.
#[derive(Debug, Default)]
pub struct StreamChunkProcessor {
    status: TurnStatus,
    draft: Option<UiMessage>,
    pinned_id: bool,
    /// Ids a `start` event may not claim.
    reserved_ids: HashSet<String>,
    open_parts: HashMap<(PartKind, String), usize>,
    closed_parts: HashSet<(PartKind, String)>,
    tools: HashMap<String, usize>,
    tool_input_text: HashMap<String, String>,
    usage: ThreadUsage,
    opaque_events: Vec<StreamEvent>,
    finish_reason: Option<String>,
    error_text: Option<String>,
    stopped: bool,
    violations: usize,
}

impl StreamChunkProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fresh turn. A `start` event carrying a message id replaces
    /// `fallback_id` as long as no content has arrived yet.
    pub fn begin(&mut self, fallback_id: impl Into<String>) {
        self.reset(fallback_id.into(), false);
    }

    /// Starts a fresh turn whose draft keeps `message_id` regardless of what
    /// the stream announces. Used when regenerating an existing message.
    pub fn begin_with_id(&mut self, message_id: impl Into<String>) {
        self.reset(message_id.into(), true);
    }

    /// Forbids `start` events from claiming any of `message_ids`, typically
    /// the ids of the thread's live messages. The draft keeps its fallback id
    /// when the stream announces one of them.
    pub fn reserve_ids(&mut self, message_ids: impl IntoIterator<Item = String>) {
        self.reserved_ids.extend(message_ids);
    }

    fn reset(&mut self, message_id: String, pinned_id: bool) {
        *self = Self {
            status: TurnStatus::Submitted,
            draft: Some(UiMessage::new(message_id, Role::Assistant)),
            pinned_id,
            ..Self::default()
        };
    }

    #[must_use]
    pub fn status(&self) -> TurnStatus {
        self.status
    }

    /// The draft assistant message, if a turn has begun.
    #[must_use]
    pub fn draft(&self) -> Option<&UiMessage> {
        self.draft.as_ref()
    }

    /// Usage folded from `message-metadata` events; never decreases.
    #[must_use]
    pub fn usage(&self) -> ThreadUsage {
        self.usage
    }

    /// Unrecognised events, in arrival order.
    #[must_use]
    pub fn opaque_events(&self) -> &[StreamEvent] {
        &self.opaque_events
    }

    #[must_use]
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        self.error_text.as_deref()
    }

    /// True when the turn was ended by [`StreamChunkProcessor::stop`].
    #[must_use]
    pub fn was_stopped(&self) -> bool {
        self.stopped
    }

    #[must_use]
    pub fn violation_count(&self) -> usize {
        self.violations
    }

    /// Raw tool input accumulated from `tool-input-delta` events.
    #[must_use]
    pub fn tool_input_text(&self, tool_call_id: &str) -> Option<&str> {
        self.tool_input_text.get(tool_call_id).map(String::as_str)
    }

    /// Applies one event in arrival order.
    pub fn apply(&mut self, event: StreamEvent) -> Result<(), ProtocolViolation> {
        let result = self.apply_inner(event);
        if let Err(violation) = &result {
            self.violations += 1;
            warn!(%violation, "dropping stream event");
        }
        result
    }

    fn apply_inner(&mut self, event: StreamEvent) -> Result<(), ProtocolViolation> {
        match self.status {
            TurnStatus::Idle => {
                return Err(ProtocolViolation::NotStarted {
                    event_type: event.event_type().to_string(),
                })
            }
            TurnStatus::Ready | TurnStatus::Error => {
                return Err(ProtocolViolation::AfterTerminal {
                    event_type: event.event_type().to_string(),
                })
            }
            TurnStatus::Submitted => self.status = TurnStatus::Streaming,
            TurnStatus::Streaming => {}
        }

        match event {
            StreamEvent::Start { message_id } => self.adopt_message_id(message_id),
            StreamEvent::StartStep {} | StreamEvent::FinishStep {} => Ok(()),

            StreamEvent::ReasoningStart { id } => self.open_part(PartKind::Reasoning, id),
            StreamEvent::ReasoningDelta { id, delta } => {
                self.append_part(PartKind::Reasoning, &id, &delta)
            }
            StreamEvent::ReasoningEnd { id } => self.close_part(PartKind::Reasoning, id),

            StreamEvent::TextStart { id } => self.open_part(PartKind::Text, id),
            StreamEvent::TextDelta { id, delta } => self.append_part(PartKind::Text, &id, &delta),
            StreamEvent::TextEnd { id } => self.close_part(PartKind::Text, id),

            StreamEvent::ToolInputStart {
                tool_call_id,
                tool_name,
            } => self.start_tool(tool_call_id, tool_name),
            StreamEvent::ToolInputDelta {
                tool_call_id,
                input_text_delta,
            } => self.append_tool_input(&tool_call_id, &input_text_delta),
            StreamEvent::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => self.tool_input_available(tool_call_id, tool_name, input),
            StreamEvent::ToolApprovalRequest {
                approval_id,
                tool_call_id,
            } => {
                let tool = self.tool_mut(&tool_call_id, "tool-approval-request", |state| {
                    state == ToolState::InputAvailable
                })?;
                tool.state = ToolState::ApprovalRequested;
                tool.approval_id = Some(approval_id);
                Ok(())
            }
            StreamEvent::ToolOutputAvailable {
                tool_call_id,
                output,
            } => {
                let tool = self.tool_mut(&tool_call_id, "tool-output-available", |state| {
                    state.accepts_output()
                })?;
                tool.state = ToolState::OutputAvailable;
                tool.output = Some(output);
                Ok(())
            }
            StreamEvent::ToolOutputError {
                tool_call_id,
                error_text,
            } => {
                let tool = self.tool_mut(&tool_call_id, "tool-output-error", |state| {
                    state.accepts_output()
                })?;
                tool.state = ToolState::OutputError;
                tool.error_text = Some(error_text);
                Ok(())
            }
            StreamEvent::ToolOutputDenied { tool_call_id } => {
                let tool = self.tool_mut(&tool_call_id, "tool-output-denied", |state| {
                    state.accepts_output()
                })?;
                tool.state = ToolState::OutputDenied;
                Ok(())
            }

            StreamEvent::File { url, media_type } => {
                self.push_part(MessagePart::File(FilePart {
                    media_type,
                    url,
                    filename: None,
                }));
                Ok(())
            }
            StreamEvent::SourceUrl {
                source_id,
                url,
                title,
            } => {
                self.push_part(MessagePart::SourceUrl(SourceUrlPart {
                    source_id,
                    url,
                    title,
                }));
                Ok(())
            }
            StreamEvent::MessageMetadata { message_metadata } => {
                self.merge_metadata(message_metadata);
                Ok(())
            }

            StreamEvent::Finish { finish_reason } => {
                self.force_close_open_parts();
                self.finish_reason = finish_reason;
                self.status = TurnStatus::Ready;
                Ok(())
            }
            StreamEvent::Abort { reason } => {
                debug!(reason = reason.as_deref().unwrap_or(""), "turn aborted by stream");
                self.force_close_open_parts();
                self.finish_reason = reason.or_else(|| Some("abort".to_string()));
                self.status = TurnStatus::Ready;
                Ok(())
            }
            StreamEvent::Error { error_text } => {
                self.fail(error_text);
                Ok(())
            }

            unknown @ StreamEvent::Unknown { .. } => {
                debug!(event_type = unknown.event_type(), "keeping unrecognised stream event");
                self.opaque_events.push(unknown);
                Ok(())
            }
        }
    }

    /// Cancels an active turn, keeping only what was already applied.
    /// Returns false when no turn was active.
    pub fn stop(&mut self) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.force_close_open_parts();
        self.stopped = true;
        self.finish_reason = Some("stop".to_string());
        self.status = TurnStatus::Ready;
        true
    }

    /// Ends an active turn in the error state. Partial content is kept for
    /// display.
    pub fn fail(&mut self, error_text: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.force_close_open_parts();
        self.error_text = Some(error_text.into());
        self.status = TurnStatus::Error;
    }

    /// Marks the end of the event stream. A stream that closes while still
    /// active is a transport failure.
    pub fn end_of_stream(&mut self) {
        if self.status.is_active() {
            self.fail(STREAM_ENDED_WITHOUT_TERMINAL);
        }
    }

    fn draft_mut(&mut self) -> &mut UiMessage {
        self.draft
            .get_or_insert_with(|| UiMessage::new(String::new(), Role::Assistant))
    }

    fn push_part(&mut self, part: MessagePart) -> usize {
        let draft = self.draft_mut();
        draft.parts.push(part);
        draft.parts.len() - 1
    }

    fn adopt_message_id(&mut self, message_id: Option<String>) -> Result<(), ProtocolViolation> {
        let Some(message_id) = message_id.filter(|id| !id.trim().is_empty()) else {
            return Ok(());
        };
        if self.pinned_id {
            return Ok(());
        }
        if self.reserved_ids.contains(&message_id) {
            return Err(ProtocolViolation::MessageIdInUse { message_id });
        }
        let draft = self.draft_mut();
        if draft.parts.is_empty() {
            draft.id = message_id;
        }
        Ok(())
    }

    fn open_part(&mut self, kind: PartKind, id: String) -> Result<(), ProtocolViolation> {
        let key = (kind, id);
        if self.open_parts.contains_key(&key) || self.closed_parts.contains(&key) {
            return Err(ProtocolViolation::DuplicatePart { kind, id: key.1 });
        }
        let part = match kind {
            PartKind::Text => MessagePart::Text(TextPart {
                text: String::new(),
                state: PartState::Streaming,
            }),
            PartKind::Reasoning => MessagePart::Reasoning(ReasoningPart {
                text: String::new(),
                state: PartState::Streaming,
            }),
        };
        let index = self.push_part(part);
        self.open_parts.insert(key, index);
        Ok(())
    }

    fn lookup_open(&self, kind: PartKind, id: &str) -> Result<usize, ProtocolViolation> {
        let key = (kind, id.to_string());
        match self.open_parts.get(&key) {
            Some(index) => Ok(*index),
            None if self.closed_parts.contains(&key) => Err(ProtocolViolation::ClosedPart {
                kind,
                id: key.1,
            }),
            None => Err(ProtocolViolation::UnknownPart { kind, id: key.1 }),
        }
    }

    fn append_part(&mut self, kind: PartKind, id: &str, delta: &str) -> Result<(), ProtocolViolation> {
        let index = self.lookup_open(kind, id)?;
        match self.draft_mut().parts.get_mut(index) {
            Some(MessagePart::Text(part)) => part.text.push_str(delta),
            Some(MessagePart::Reasoning(part)) => part.text.push_str(delta),
            _ => {}
        }
        Ok(())
    }

    fn close_part(&mut self, kind: PartKind, id: String) -> Result<(), ProtocolViolation> {
        let index = self.lookup_open(kind, &id)?;
        set_part_done(self.draft_mut().parts.get_mut(index));
        self.open_parts.remove(&(kind, id.clone()));
        self.closed_parts.insert((kind, id));
        Ok(())
    }

    fn start_tool(&mut self, tool_call_id: String, tool_name: String) -> Result<(), ProtocolViolation> {
        if let Some(state) = self.tool_state(&tool_call_id) {
            return Err(ProtocolViolation::InvalidToolTransition {
                tool_call_id,
                event_type: "tool-input-start".to_string(),
                state: state.as_str(),
            });
        }
        let index = self.push_part(MessagePart::Tool(ToolPart::streaming(
            tool_call_id.clone(),
            tool_name,
        )));
        self.tools.insert(tool_call_id.clone(), index);
        self.tool_input_text.insert(tool_call_id, String::new());
        Ok(())
    }

    fn append_tool_input(&mut self, tool_call_id: &str, delta: &str) -> Result<(), ProtocolViolation> {
        self.tool_mut(tool_call_id, "tool-input-delta", |state| {
            state == ToolState::InputStreaming
        })?;
        let buffer = self
            .tool_input_text
            .entry(tool_call_id.to_string())
            .or_default();
        buffer.push_str(delta);
        let partial = Value::String(buffer.clone());
        if let Ok(tool) = self.tool_mut(tool_call_id, "tool-input-delta", |_| true) {
            tool.input = Some(partial);
        }
        Ok(())
    }

    fn tool_input_available(
        &mut self,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    ) -> Result<(), ProtocolViolation> {
        // A tool call may arrive complete without a preceding input-start.
        if self.tool_state(&tool_call_id).is_none() {
            self.start_tool(tool_call_id.clone(), tool_name.clone())?;
        }

        let input = if input.is_null() {
            self.tool_input_text
                .get(&tool_call_id)
                .map(|raw| parse_tool_input(raw))
                .unwrap_or(Value::Null)
        } else {
            input
        };

        let tool = self.tool_mut(&tool_call_id, "tool-input-available", |state| {
            state == ToolState::InputStreaming
        })?;
        tool.state = ToolState::InputAvailable;
        tool.tool_name = tool_name;
        tool.input = Some(input);
        Ok(())
    }

    fn tool_state(&self, tool_call_id: &str) -> Option<ToolState> {
        let index = self.tools.get(tool_call_id)?;
        match self.draft.as_ref()?.parts.get(*index)? {
            MessagePart::Tool(tool) => Some(tool.state),
            _ => None,
        }
    }

    fn tool_mut(
        &mut self,
        tool_call_id: &str,
        event_type: &str,
        allowed: impl Fn(ToolState) -> bool,
    ) -> Result<&mut ToolPart, ProtocolViolation> {
        let unknown = || ProtocolViolation::UnknownToolCall {
            tool_call_id: tool_call_id.to_string(),
            event_type: event_type.to_string(),
        };
        let index = *self.tools.get(tool_call_id).ok_or_else(unknown)?;
        let Some(MessagePart::Tool(tool)) = self
            .draft
            .as_mut()
            .and_then(|draft| draft.parts.get_mut(index))
        else {
            return Err(unknown());
        };
        if !allowed(tool.state) {
            return Err(ProtocolViolation::InvalidToolTransition {
                tool_call_id: tool_call_id.to_string(),
                event_type: event_type.to_string(),
                state: tool.state.as_str(),
            });
        }
        Ok(tool)
    }

    fn merge_metadata(&mut self, metadata: Value) {
        if let Some(usage) = ThreadUsage::from_metadata(&metadata) {
            self.usage = self.usage.max_merge(&usage);
        }

        let draft = self.draft_mut();
        match metadata {
            Value::Null => {}
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = draft.metadata.as_mut() {
                    existing.extend(incoming);
                } else {
                    draft.metadata = Some(Value::Object(incoming));
                }
            }
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other);
                draft.metadata = Some(Value::Object(wrapped));
            }
        }
    }

    /// Closes every open text/reasoning part with its partial content and
    /// settles tool calls whose input never completed.
    fn force_close_open_parts(&mut self) {
        let open: Vec<((PartKind, String), usize)> = self.open_parts.drain().collect();
        let tool_inputs = self.tool_input_text.clone();
        let Some(draft) = self.draft.as_mut() else {
            return;
        };

        for (key, index) in open {
            set_part_done(draft.parts.get_mut(index));
            self.closed_parts.insert(key);
        }

        for part in &mut draft.parts {
            if let MessagePart::Tool(tool) = part {
                if tool.state == ToolState::InputStreaming {
                    tool.state = ToolState::InputAvailable;
                    tool.input = Some(
                        tool_inputs
                            .get(&tool.tool_call_id)
                            .map(|raw| parse_tool_input(raw))
                            .unwrap_or(Value::Null),
                    );
                }
            }
        }
    }
}

fn set_part_done(part: Option<&mut MessagePart>) {
    match part {
        Some(MessagePart::Text(part)) => part.state = PartState::Done,
        Some(MessagePart::Reasoning(part)) => part.state = PartState::Done,
        _ => {}
    }
}

/// Parses accumulated raw tool input; unparsable fragments are kept as a string.
fn parse_tool_input(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
