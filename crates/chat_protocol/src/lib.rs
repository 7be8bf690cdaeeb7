//! Provider-neutral data model and wire contract for thread sessions.
//!
//! This crate defines the message/record shapes shared by the session runtime,
//! the persistence gateway, and stream transports, plus the [`StreamSource`]
//! seam a transport implements to deliver one turn's protocol events. It
//! contains no transport, storage, or orchestration logic.

pub mod events;
pub mod message;
pub mod record;
pub mod selection;
pub mod source;
pub mod usage;

pub use events::StreamEvent;
pub use message::{
    FilePart, MessagePart, PartState, ReasoningPart, Role, SourceUrlPart, TextPart, ToolPart,
    ToolState, UiMessage,
};
pub use record::{MessageRecord, ThreadRecord};
pub use selection::{ModelSelection, SelectionRequest};
pub use source::{
    CancelToken, EventStream, StreamSource, StreamSourceError, TurnId, TurnRequest, TurnTrigger,
};
pub use usage::ThreadUsage;
