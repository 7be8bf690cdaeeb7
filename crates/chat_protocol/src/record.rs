use serde::{Deserialize, Serialize};

use crate::message::UiMessage;
use crate::selection::ModelSelection;
use crate::usage::ThreadUsage;

/// Durable message entry. `ordinal` is assigned by the store at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub ordinal: u64,
    pub message: UiMessage,
    #[serde(default)]
    pub usage: ThreadUsage,
    pub model_selection: ModelSelection,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl MessageRecord {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub model_selection: ModelSelection,
    #[serde(default)]
    pub history: Vec<MessageRecord>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl ThreadRecord {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Access rule shared by every boundary: owner only, and only while live.
    #[must_use]
    pub fn is_accessible_by(&self, user_id: &str) -> bool {
        self.is_live() && self.user_id == user_id
    }

    /// Live records sorted by ordinal; the only authoritative conversation order.
    #[must_use]
    pub fn live_transcript(&self) -> Vec<&MessageRecord> {
        let mut live: Vec<&MessageRecord> = self
            .history
            .iter()
            .filter(|record| record.is_live())
            .collect();
        live.sort_by_key(|record| record.ordinal);
        live
    }

    #[must_use]
    pub fn live_record(&self, message_id: &str) -> Option<&MessageRecord> {
        self.history
            .iter()
            .find(|record| record.is_live() && record.message.id == message_id)
    }
}
