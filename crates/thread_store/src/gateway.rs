use async_trait::async_trait;
use chat_protocol::{ModelSelection, ThreadRecord, UiMessage};

use crate::error::GatewayResult;
use crate::schema::{CreateThread, UpsertMessage};

/// Acting identity for every gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    /// Bearer credential forwarded by remote gateways.
    pub access_token: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: None,
        }
    }

    #[must_use]
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !self.user_id.trim().is_empty()
    }
}

/// Durable, ordinal-ordered thread store.
///
/// Every operation only sees threads owned by `identity` that are not
/// soft-deleted; anything else is reported as not found. Returned threads
/// carry their full history, including soft-deleted records.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Live threads owned by the caller, most recently updated first.
    async fn list_threads(&self, identity: &Identity) -> GatewayResult<Vec<ThreadRecord>>;

    /// Creates a thread, appending the optional initial user message with
    /// zeroed usage.
    async fn create_thread(
        &self,
        identity: &Identity,
        request: CreateThread,
    ) -> GatewayResult<ThreadRecord>;

    async fn get_thread(&self, identity: &Identity, thread_id: &str)
        -> GatewayResult<ThreadRecord>;

    /// Soft-deletes the thread and every live message in it.
    async fn delete_thread(&self, identity: &Identity, thread_id: &str) -> GatewayResult<()>;

    /// Replaces the thread's default selection. Incomplete selections are
    /// rejected as invalid.
    async fn update_model_selection(
        &self,
        identity: &Identity,
        thread_id: &str,
        selection: &ModelSelection,
    ) -> GatewayResult<ThreadRecord>;

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Appends the message with the next ordinal, or replaces the live record
    /// with the same message id at its existing ordinal.
    async fn upsert_message(
        &self,
        identity: &Identity,
        thread_id: &str,
        request: UpsertMessage,
    ) -> GatewayResult<ThreadRecord>;

    /// Replaces a live user message, then discards every record after it.
    async fn edit_and_truncate(
        &self,
        identity: &Identity,
        thread_id: &str,
        message_id: &str,
        message: UiMessage,
    ) -> GatewayResult<ThreadRecord>;
}
