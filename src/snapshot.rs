//! Immutable views of a session handed to readers.

use chat_protocol::{ModelSelection, StreamEvent, ThreadUsage, TurnId, UiMessage};

use crate::stream_processor::TurnStatus;

/// Position of an entry in the thread's history. Only positions returned by
/// the persistence gateway are numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordinal {
    Confirmed(u64),
    Provisional,
}

impl Ordinal {
    #[must_use]
    pub fn confirmed(&self) -> Option<u64> {
        match self {
            Self::Confirmed(ordinal) => Some(*ordinal),
            Self::Provisional => None,
        }
    }

    #[must_use]
    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub message: UiMessage,
    pub ordinal: Ordinal,
    pub usage: ThreadUsage,
    pub model_selection: Option<ModelSelection>,
}

impl TranscriptEntry {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// A generated message whose final write failed. It is not part of the
/// transcript until `retry_persistence` succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsavedMessage {
    pub message: UiMessage,
    pub usage: ThreadUsage,
    pub model_selection: ModelSelection,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranscriptSnapshot {
    pub thread_id: Option<String>,
    pub title: Option<String>,
    /// Thread default selection, when a thread is open.
    pub model_selection: Option<ModelSelection>,
    pub entries: Vec<TranscriptEntry>,
    pub status: TurnStatus,
    pub active_turn: Option<TurnId>,
    pub error: Option<String>,
    pub unsaved: Option<UnsavedMessage>,
    /// Rollup over entries with recorded usage.
    pub usage: ThreadUsage,
    /// Unrecognised events of the most recent turn.
    pub opaque_events: Vec<StreamEvent>,
}

impl TranscriptSnapshot {
    #[must_use]
    pub fn entry(&self, message_id: &str) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.id() == message_id)
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&UiMessage> {
        self.entries.last().map(|entry| &entry.message)
    }

    #[must_use]
    pub fn confirmed_ordinals(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter_map(|entry| entry.ordinal.confirmed())
            .collect()
    }

    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.message.text()).collect()
    }
}
