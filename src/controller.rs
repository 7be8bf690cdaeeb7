//! Turn orchestration for one thread at a time.
//!
//! The controller owns the local transcript and reconciles it with the
//! persistence gateway after every write. At most one stream is active: a new
//! `send` or `rerun` cancels the active turn and waits for it to settle
//! (including its final write) before starting. Readers observe immutable
//! [`TranscriptSnapshot`]s, republished after every applied event.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chat_protocol::{
    EventStream, ModelSelection, Role, SelectionRequest, StreamSource, ThreadRecord, ThreadUsage,
    TurnId, TurnRequest, TurnTrigger, UiMessage,
};
use futures_util::StreamExt;
use thread_store::{CreateThread, Identity, PersistenceGateway, UpsertMessage};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::model_selection::ModelSelectionResolver;
use crate::snapshot::{Ordinal, TranscriptEntry, TranscriptSnapshot, UnsavedMessage};
use crate::stream_processor::{StreamChunkProcessor, TurnStatus};
use crate::usage::UsageAggregator;

const TITLE_MAX_CHARS: usize = 60;

/// User input for [`ThreadSessionController::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendInput {
    Text(String),
    /// A complete user message. Reusing the id of a live message overwrites
    /// it at its existing position.
    Message(UiMessage),
}

impl SendInput {
    fn into_user_message(self) -> SessionResult<UiMessage> {
        match self {
            Self::Text(text) => {
                if text.trim().is_empty() {
                    return Err(SessionError::InvalidRequest(
                        "message text must not be empty".to_string(),
                    ));
                }
                Ok(UiMessage::user_text(new_message_id(), text))
            }
            Self::Message(mut message) => {
                if message.role != Role::User {
                    return Err(SessionError::InvalidRequest(format!(
                        "only user messages can be sent, got {}",
                        message.role.as_str()
                    )));
                }
                if message.id.trim().is_empty() {
                    message.id = new_message_id();
                }
                Ok(message)
            }
        }
    }
}

impl From<&str> for SendInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for SendInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<UiMessage> for SendInput {
    fn from(message: UiMessage) -> Self {
        Self::Message(message)
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    /// `Ready` or `Error`.
    pub status: TurnStatus,
    /// Final (or, on error, partial) assistant message.
    pub message: Option<UiMessage>,
    /// True when the turn was cancelled by `stop` or a newer turn.
    pub stopped: bool,
    pub error: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: ThreadUsage,
    pub model_selection: ModelSelection,
}

impl TurnOutcome {
    #[must_use]
    pub fn text(&self) -> String {
        self.message
            .as_ref()
            .map(UiMessage::text)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
enum TurnKind {
    Submit,
    Regenerate { message_id: String },
}

struct ActiveTurn {
    turn_id: TurnId,
    cancel: CancellationToken,
}

/// Exclusive right to run one streamed turn. Dropping it releases the turn
/// gate and clears the active-turn registration.
struct TurnSlot<'a> {
    controller: &'a ThreadSessionController,
    turn_id: TurnId,
    cancel: CancellationToken,
    _gate: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        let mut active = lock_unpoisoned(&self.controller.active_turn);
        if active
            .as_ref()
            .is_some_and(|turn| turn.turn_id == self.turn_id)
        {
            *active = None;
        }
    }
}

enum Optimistic {
    Replaced {
        index: usize,
        previous: TranscriptEntry,
    },
    Appended {
        message_id: String,
    },
}

#[derive(Default)]
struct SessionState {
    thread: Option<ThreadRecord>,
    /// Live records as last confirmed by the gateway, plus in-place
    /// optimistic overwrites.
    entries: Vec<TranscriptEntry>,
    /// Optimistic messages the gateway has not yet assigned ordinals to.
    pending: Vec<TranscriptEntry>,
    processor: StreamChunkProcessor,
    show_draft: bool,
    /// Message id the draft replaces in place while regenerating.
    draft_target: Option<String>,
    turn_selection: Option<ModelSelection>,
    turn_id: Option<TurnId>,
    error: Option<String>,
    unsaved: Option<UnsavedMessage>,
    usage: UsageAggregator,
}

impl SessionState {
    fn thread_id(&self) -> Option<&str> {
        self.thread.as_ref().map(|thread| thread.id.as_str())
    }

    fn require_thread_id(&self) -> SessionResult<String> {
        self.thread_id()
            .map(ToString::to_string)
            .ok_or_else(|| SessionError::invalid_operation("no thread is open"))
    }

    /// Id of the open thread when `message_id` is a live assistant message.
    fn rerun_target(&self, message_id: &str) -> SessionResult<String> {
        let thread = self
            .thread
            .as_ref()
            .ok_or_else(|| SessionError::invalid_operation("no thread is open"))?;
        thread
            .live_record(message_id)
            .filter(|record| record.message.role == Role::Assistant)
            .ok_or_else(|| {
                SessionError::invalid_operation(format!(
                    "message {message_id} is not a live assistant message"
                ))
            })?;
        Ok(thread.id.clone())
    }

    fn thread_default(&self) -> Option<&ModelSelection> {
        self.thread
            .as_ref()
            .map(|thread| &thread.model_selection)
            .filter(|selection| selection.is_complete())
    }

    /// Replaces the session with a different thread, discarding turn state.
    fn replace_thread(&mut self, thread: ThreadRecord) {
        *self = Self::default();
        self.apply_thread(thread);
    }

    /// Adopts the gateway's view of the current thread.
    fn apply_thread(&mut self, thread: ThreadRecord) {
        let entries: Vec<TranscriptEntry> = {
            let live = thread.live_transcript();
            for record in &live {
                let known = self.usage.get(&record.message.id).is_some();
                if record.usage != ThreadUsage::default() || !known {
                    self.usage.record(record.message.id.clone(), record.usage);
                }
            }
            live.iter()
                .map(|record| TranscriptEntry {
                    message: record.message.clone(),
                    ordinal: Ordinal::Confirmed(record.ordinal),
                    usage: self.usage.get(&record.message.id).unwrap_or(record.usage),
                    model_selection: Some(record.model_selection.clone()),
                })
                .collect()
        };
        let live_ids: HashSet<String> = entries
            .iter()
            .map(|entry| entry.id().to_string())
            .collect();
        self.usage.retain(|message_id| live_ids.contains(message_id));

        self.entries = entries;
        self.pending.clear();
        self.thread = Some(thread);
    }

    fn insert_optimistic(&mut self, message: UiMessage) -> Optimistic {
        if let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.id() == message.id)
        {
            let previous = self.entries[index].clone();
            self.entries[index].message = message;
            return Optimistic::Replaced { index, previous };
        }

        let message_id = message.id.clone();
        self.pending.push(TranscriptEntry {
            message,
            ordinal: Ordinal::Provisional,
            usage: ThreadUsage::default(),
            model_selection: None,
        });
        Optimistic::Appended { message_id }
    }

    fn rollback(&mut self, optimistic: Optimistic) {
        match optimistic {
            Optimistic::Replaced { index, previous } => {
                if let Some(entry) = self.entries.get_mut(index) {
                    *entry = previous;
                }
            }
            Optimistic::Appended { message_id } => {
                self.pending.retain(|entry| entry.id() != message_id);
            }
        }
    }

    fn hide_draft(&mut self) {
        self.show_draft = false;
        self.draft_target = None;
    }

    /// Live messages sent as model context. For a regeneration, only the
    /// messages before the target are included.
    fn context_messages(&self, kind: &TurnKind) -> Vec<UiMessage> {
        let Some(thread) = self.thread.as_ref() else {
            return Vec::new();
        };
        let live = thread.live_transcript();
        let cutoff = match kind {
            TurnKind::Submit => None,
            TurnKind::Regenerate { message_id } => live
                .iter()
                .find(|record| record.message.id == *message_id)
                .map(|record| record.ordinal),
        };
        live.into_iter()
            .filter(|record| cutoff.map_or(true, |cutoff| record.ordinal < cutoff))
            .map(|record| record.message.clone())
            .collect()
    }

    fn snapshot(&self) -> TranscriptSnapshot {
        let draft = if self.show_draft {
            self.processor.draft()
        } else {
            None
        };
        let draft_usage = self.processor.usage();

        let mut entries = Vec::with_capacity(self.entries.len() + self.pending.len() + 1);
        let mut draft_placed = false;
        for entry in &self.entries {
            match (draft, self.draft_target.as_deref()) {
                (Some(draft), Some(target)) if target == entry.id() => {
                    entries.push(TranscriptEntry {
                        message: draft.clone(),
                        usage: draft_usage,
                        ..entry.clone()
                    });
                    draft_placed = true;
                }
                _ => entries.push(entry.clone()),
            }
        }
        entries.extend(self.pending.iter().cloned());
        if let Some(draft) = draft.filter(|_| !draft_placed) {
            entries.push(TranscriptEntry {
                message: draft.clone(),
                ordinal: Ordinal::Provisional,
                usage: draft_usage,
                model_selection: self.turn_selection.clone(),
            });
        }

        TranscriptSnapshot {
            thread_id: self.thread_id().map(ToString::to_string),
            title: self.thread.as_ref().and_then(|thread| thread.title.clone()),
            model_selection: self
                .thread
                .as_ref()
                .map(|thread| thread.model_selection.clone()),
            usage: self
                .thread
                .as_ref()
                .map(|thread| self.usage.rollup_thread(thread))
                .unwrap_or_default(),
            entries,
            status: self.processor.status(),
            active_turn: self.turn_id,
            error: self.error.clone(),
            unsaved: self.unsaved.clone(),
            opaque_events: self.processor.opaque_events().to_vec(),
        }
    }
}

/// Orchestrates the turns of one open thread.
pub struct ThreadSessionController {
    identity: Identity,
    gateway: Arc<dyn PersistenceGateway>,
    source: Arc<dyn StreamSource>,
    resolver: ModelSelectionResolver,
    state: Mutex<SessionState>,
    active_turn: Mutex<Option<ActiveTurn>>,
    turn_gate: tokio::sync::Mutex<()>,
    next_turn_id: AtomicU64,
    snapshots: watch::Sender<Arc<TranscriptSnapshot>>,
}

impl ThreadSessionController {
    pub fn new(
        identity: Identity,
        gateway: Arc<dyn PersistenceGateway>,
        source: Arc<dyn StreamSource>,
        resolver: ModelSelectionResolver,
    ) -> Arc<Self> {
        let (snapshots, _) = watch::channel(Arc::new(TranscriptSnapshot::default()));
        Arc::new(Self {
            identity,
            gateway,
            source,
            resolver,
            state: Mutex::new(SessionState::default()),
            active_turn: Mutex::new(None),
            turn_gate: tokio::sync::Mutex::new(()),
            next_turn_id: AtomicU64::new(1),
            snapshots,
        })
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn resolver(&self) -> &ModelSelectionResolver {
        &self.resolver
    }

    #[must_use]
    pub fn thread_id(&self) -> Option<String> {
        self.lock_state().thread_id().map(ToString::to_string)
    }

    /// Latest published view of the session.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TranscriptSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<TranscriptSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Usage summed over the live transcript.
    #[must_use]
    pub fn usage_rollup(&self) -> ThreadUsage {
        self.snapshot().usage
    }

    /// Cancels the active stream. Returns false when nothing was streaming or
    /// the active turn was already cancelled.
    pub fn stop(&self) -> bool {
        let active = lock_unpoisoned(&self.active_turn);
        match active.as_ref() {
            Some(turn) if !turn.cancel.is_cancelled() => {
                info!(turn_id = turn.turn_id, "stopping active turn");
                turn.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Thread operations
    // ------------------------------------------------------------------

    pub async fn list_threads(&self) -> SessionResult<Vec<ThreadRecord>> {
        Ok(self.gateway.list_threads(&self.identity).await?)
    }

    /// Creates an empty thread with the process default selection and makes
    /// it the open thread.
    pub async fn create(&self, title: Option<String>) -> SessionResult<Arc<TranscriptSnapshot>> {
        let _gate = self.exclusive().await;
        let request = CreateThread {
            title,
            initial_user_message: None,
            model_selection: Some(self.resolver.resolve(None, None)),
        };
        let thread = self.gateway.create_thread(&self.identity, request).await?;
        check_access(&self.identity, &thread)?;
        info!(thread_id = %thread.id, "thread created");

        let mut state = self.lock_state();
        state.replace_thread(thread);
        Ok(self.publish(&state))
    }

    pub async fn open(&self, thread_id: &str) -> SessionResult<Arc<TranscriptSnapshot>> {
        let _gate = self.exclusive().await;
        let thread = self.gateway.get_thread(&self.identity, thread_id).await?;
        check_access(&self.identity, &thread)?;
        debug!(thread_id, records = thread.history.len(), "thread opened");

        let mut state = self.lock_state();
        state.replace_thread(thread);
        Ok(self.publish(&state))
    }

    /// Re-reads the open thread from the gateway.
    pub async fn reload(&self) -> SessionResult<Arc<TranscriptSnapshot>> {
        let _gate = self.turn_gate.lock().await;
        let thread_id = self.lock_state().require_thread_id()?;
        let thread = self.gateway.get_thread(&self.identity, &thread_id).await?;
        check_access(&self.identity, &thread)?;

        let mut state = self.lock_state();
        state.apply_thread(thread);
        Ok(self.publish(&state))
    }

    /// Resolves `request` against the thread default and stores the result as
    /// the thread's new default.
    pub async fn set_model_selection(
        &self,
        request: SelectionRequest,
    ) -> SessionResult<ModelSelection> {
        let _gate = self.turn_gate.lock().await;
        let (thread_id, resolved) = {
            let state = self.lock_state();
            let thread_id = state.require_thread_id()?;
            let resolved = self.resolver.resolve(Some(&request), state.thread_default());
            (thread_id, resolved)
        };

        let thread = self
            .gateway
            .update_model_selection(&self.identity, &thread_id, &resolved)
            .await?;
        check_access(&self.identity, &thread)?;
        info!(%thread_id, model_id = %resolved.model_id, budget = %resolved.reasoning_budget, "thread model selection updated");

        let mut state = self.lock_state();
        state.apply_thread(thread);
        self.publish(&state);
        Ok(resolved)
    }

    /// Soft-deletes the open thread and closes it.
    pub async fn delete_thread(&self) -> SessionResult<()> {
        let _gate = self.exclusive().await;
        let thread_id = self.lock_state().require_thread_id()?;
        self.gateway
            .delete_thread(&self.identity, &thread_id)
            .await?;
        info!(%thread_id, "thread deleted");

        let mut state = self.lock_state();
        *state = SessionState::default();
        self.publish(&state);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Turn operations
    // ------------------------------------------------------------------

    /// Sends a user message and streams the reply. Without an open thread, a
    /// new thread is created with the message as its first record.
    pub async fn send(
        &self,
        input: impl Into<SendInput>,
        selection: Option<SelectionRequest>,
    ) -> SessionResult<TurnOutcome> {
        let message = input.into().into_user_message()?;
        let slot = self.begin_turn().await;

        let (thread_id, resolved) = {
            let state = self.lock_state();
            let resolved = self
                .resolver
                .resolve(selection.as_ref(), state.thread_default());
            (state.thread_id().map(ToString::to_string), resolved)
        };

        let thread_id = match thread_id {
            Some(thread_id) => {
                self.persist_user_message(&thread_id, message, &resolved)
                    .await?;
                thread_id
            }
            None => self.create_with_message(message, &resolved).await?,
        };

        self.run_turn(&slot, thread_id, TurnKind::Submit, resolved)
            .await
    }

    /// Replaces a live user message and discards every later record. Does not
    /// start a new turn.
    pub async fn edit_and_truncate(
        &self,
        message_id: &str,
        new_message: UiMessage,
    ) -> SessionResult<Arc<TranscriptSnapshot>> {
        if new_message.role != Role::User {
            return Err(SessionError::InvalidRequest(
                "edited message must have role user".to_string(),
            ));
        }
        let _gate = self.exclusive().await;

        let (thread_id, saved_entries, saved_pending) = {
            let mut state = self.lock_state();
            let thread_id = state.require_thread_id()?;
            let index = state
                .entries
                .iter()
                .position(|entry| entry.id() == message_id && entry.message.role == Role::User)
                .ok_or_else(|| {
                    SessionError::invalid_operation(format!(
                        "message {message_id} is not a live user message"
                    ))
                })?;

            let saved = (state.entries.clone(), state.pending.clone());
            let mut edited = new_message.clone();
            edited.id = message_id.to_string();
            state.entries[index].message = edited;
            state.entries.truncate(index + 1);
            state.pending.clear();
            state.hide_draft();
            state.error = None;
            self.publish(&state);
            (thread_id, saved.0, saved.1)
        };

        let result = self
            .gateway
            .edit_and_truncate(&self.identity, &thread_id, message_id, new_message)
            .await
            .map_err(SessionError::from)
            .and_then(|thread| check_access(&self.identity, &thread).map(|()| thread));

        let mut state = self.lock_state();
        match result {
            Ok(thread) => {
                debug!(%thread_id, message_id, "history truncated after edit");
                state.apply_thread(thread);
                Ok(self.publish(&state))
            }
            Err(error) => {
                warn!(%thread_id, message_id, %error, "edit failed; restoring transcript");
                state.entries = saved_entries;
                state.pending = saved_pending;
                state.error = Some(error.to_string());
                self.publish(&state);
                Err(error)
            }
        }
    }

    /// Regenerates a live assistant message in place, optionally with a
    /// different model selection.
    pub async fn rerun(
        &self,
        message_id: &str,
        selection: Option<SelectionRequest>,
    ) -> SessionResult<TurnOutcome> {
        // An invalid target must not cancel the active turn.
        self.lock_state().rerun_target(message_id)?;
        let slot = self.begin_turn().await;

        let (thread_id, resolved) = {
            let state = self.lock_state();
            let thread_id = state.rerun_target(message_id)?;
            let resolved = self
                .resolver
                .resolve(selection.as_ref(), state.thread_default());
            (thread_id, resolved)
        };

        let kind = TurnKind::Regenerate {
            message_id: message_id.to_string(),
        };
        self.run_turn(&slot, thread_id, kind, resolved).await
    }

    /// Re-attempts the final write of a generated message whose persistence
    /// failed.
    pub async fn retry_persistence(&self) -> SessionResult<Arc<TranscriptSnapshot>> {
        let _gate = self.turn_gate.lock().await;
        let (thread_id, unsaved) = {
            let state = self.lock_state();
            let thread_id = state.require_thread_id()?;
            let unsaved = state
                .unsaved
                .clone()
                .ok_or_else(|| SessionError::invalid_operation("no unsaved message to retry"))?;
            (thread_id, unsaved)
        };

        let request = UpsertMessage::new(unsaved.message.clone())
            .with_model_selection(unsaved.model_selection.clone())
            .with_usage(unsaved.usage);
        let result = self
            .gateway
            .upsert_message(&self.identity, &thread_id, request)
            .await;

        let mut state = self.lock_state();
        match result {
            Ok(thread) => {
                check_access(&self.identity, &thread)?;
                info!(%thread_id, message_id = %unsaved.message.id, "unsaved message persisted");
                state
                    .usage
                    .record(unsaved.message.id.clone(), unsaved.usage);
                state.apply_thread(thread);
                state.unsaved = None;
                state.error = None;
                Ok(self.publish(&state))
            }
            Err(source) => {
                error!(%thread_id, error = %source, "retrying persistence failed");
                if let Some(unsaved) = state.unsaved.as_mut() {
                    unsaved.error = source.to_string();
                }
                state.error = Some(source.to_string());
                self.publish(&state);
                Err(SessionError::PersistenceFailure(source))
            }
        }
    }

    // ------------------------------------------------------------------
    // Turn internals
    // ------------------------------------------------------------------

    /// Cancels the active turn, registers a new one, and waits until every
    /// earlier turn has settled.
    async fn begin_turn(&self) -> TurnSlot<'_> {
        let turn_id = self.next_turn_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        {
            let mut active = lock_unpoisoned(&self.active_turn);
            if let Some(previous) = active.take() {
                debug!(previous = previous.turn_id, turn_id, "superseding active turn");
                previous.cancel.cancel();
            }
            *active = Some(ActiveTurn {
                turn_id,
                cancel: cancel.clone(),
            });
        }

        let gate = self.turn_gate.lock().await;
        TurnSlot {
            controller: self,
            turn_id,
            cancel,
            _gate: gate,
        }
    }

    /// Cancels the active turn and waits for exclusive access.
    async fn exclusive(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.stop();
        self.turn_gate.lock().await
    }

    async fn persist_user_message(
        &self,
        thread_id: &str,
        message: UiMessage,
        selection: &ModelSelection,
    ) -> SessionResult<()> {
        let optimistic = {
            let mut state = self.lock_state();
            state.hide_draft();
            state.error = None;
            let optimistic = state.insert_optimistic(message.clone());
            self.publish(&state);
            optimistic
        };

        let request = UpsertMessage::new(message).with_model_selection(selection.clone());
        let result = self
            .gateway
            .upsert_message(&self.identity, thread_id, request)
            .await
            .map_err(SessionError::from)
            .and_then(|thread| check_access(&self.identity, &thread).map(|()| thread));

        let mut state = self.lock_state();
        match result {
            Ok(thread) => {
                state.apply_thread(thread);
                self.publish(&state);
                Ok(())
            }
            Err(error) => {
                warn!(%thread_id, %error, "user message write failed; rolling back");
                state.rollback(optimistic);
                state.error = Some(error.to_string());
                self.publish(&state);
                Err(error)
            }
        }
    }

    async fn create_with_message(
        &self,
        message: UiMessage,
        selection: &ModelSelection,
    ) -> SessionResult<String> {
        let optimistic = {
            let mut state = self.lock_state();
            *state = SessionState::default();
            let optimistic = state.insert_optimistic(message.clone());
            self.publish(&state);
            optimistic
        };

        let request = CreateThread {
            title: title_for(&message),
            initial_user_message: Some(message),
            model_selection: Some(selection.clone()),
        };
        let result = self
            .gateway
            .create_thread(&self.identity, request)
            .await
            .map_err(SessionError::from)
            .and_then(|thread| check_access(&self.identity, &thread).map(|()| thread));

        let mut state = self.lock_state();
        match result {
            Ok(thread) => {
                let thread_id = thread.id.clone();
                info!(%thread_id, "thread created for first message");
                state.replace_thread(thread);
                self.publish(&state);
                Ok(thread_id)
            }
            Err(error) => {
                warn!(%error, "thread creation failed; rolling back");
                state.rollback(optimistic);
                state.error = Some(error.to_string());
                self.publish(&state);
                Err(error)
            }
        }
    }

    async fn run_turn(
        &self,
        slot: &TurnSlot<'_>,
        thread_id: String,
        kind: TurnKind,
        selection: ModelSelection,
    ) -> SessionResult<TurnOutcome> {
        let request = {
            let mut state = self.lock_state();
            let messages = state.context_messages(&kind);
            let trigger = match &kind {
                TurnKind::Submit => {
                    let live_ids: Vec<String> = state
                        .entries
                        .iter()
                        .chain(&state.pending)
                        .map(|entry| entry.id().to_string())
                        .collect();
                    state.processor.begin(new_message_id());
                    state.processor.reserve_ids(live_ids);
                    state.draft_target = None;
                    TurnTrigger::SubmitMessage
                }
                TurnKind::Regenerate { message_id } => {
                    state.processor.begin_with_id(message_id.clone());
                    state.draft_target = Some(message_id.clone());
                    TurnTrigger::RegenerateMessage {
                        message_id: message_id.clone(),
                    }
                }
            };
            state.show_draft = true;
            state.turn_selection = Some(selection.clone());
            state.turn_id = Some(slot.turn_id);
            state.error = None;
            self.publish(&state);

            TurnRequest {
                turn_id: slot.turn_id,
                thread_id: thread_id.clone(),
                messages,
                model_selection: selection.clone(),
                trigger,
            }
        };

        info!(
            turn_id = slot.turn_id,
            %thread_id,
            trigger = request.trigger.as_str(),
            model_id = %selection.model_id,
            source = self.source.source_id(),
            "turn started"
        );

        if slot.cancel.is_cancelled() {
            let mut state = self.lock_state();
            state.processor.stop();
            self.publish(&state);
        } else {
            match self.source.open(request, slot.cancel.clone()).await {
                Ok(stream) => self.drive(stream, &slot.cancel).await,
                Err(error) => {
                    warn!(turn_id = slot.turn_id, %error, "stream failed to open");
                    let mut state = self.lock_state();
                    if slot.cancel.is_cancelled() {
                        state.processor.stop();
                    } else {
                        state.processor.fail(error.message);
                    }
                    self.publish(&state);
                }
            }
        }

        self.finish_turn(slot.turn_id, thread_id, kind, selection)
            .await
    }

    /// Applies events in arrival order until a terminal event, the end of the
    /// stream, or cancellation. Dropping the stream aborts the network read.
    async fn drive(&self, mut stream: EventStream, cancel: &CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };

            let mut state = self.lock_state();
            match next {
                None => {
                    state.processor.stop();
                }
                Some(Some(Ok(event))) => {
                    // Violations are logged and dropped by the processor.
                    let _ = state.processor.apply(event);
                }
                Some(Some(Err(error))) => {
                    state.processor.fail(error.message);
                }
                Some(None) => {
                    state.processor.end_of_stream();
                }
            }
            self.publish(&state);
            if state.processor.status().is_terminal() {
                return;
            }
        }
    }

    async fn finish_turn(
        &self,
        turn_id: TurnId,
        thread_id: String,
        kind: TurnKind,
        selection: ModelSelection,
    ) -> SessionResult<TurnOutcome> {
        let outcome = {
            let state = self.lock_state();
            TurnOutcome {
                turn_id,
                status: state.processor.status(),
                message: state.processor.draft().cloned(),
                stopped: state.processor.was_stopped(),
                error: state.processor.error_text().map(ToString::to_string),
                finish_reason: state.processor.finish_reason().map(ToString::to_string),
                usage: state.processor.usage(),
                model_selection: selection.clone(),
            }
        };

        if outcome.status == TurnStatus::Error {
            warn!(turn_id, error = outcome.error.as_deref().unwrap_or(""), "turn ended with error");
            let mut state = self.lock_state();
            if matches!(kind, TurnKind::Regenerate { .. }) {
                // The previous content stays authoritative.
                state.hide_draft();
            }
            state.turn_id = None;
            state.error = outcome.error.clone();
            self.publish(&state);
            return Ok(outcome);
        }

        let message = match outcome.message.clone() {
            // A turn cancelled before any content arrived leaves no record.
            Some(message) if !(outcome.stopped && message.parts.is_empty()) => message,
            _ => {
                debug!(turn_id, "stopped before any content; nothing to persist");
                let mut state = self.lock_state();
                state.hide_draft();
                state.turn_id = None;
                self.publish(&state);
                return Ok(outcome);
            }
        };

        let request = UpsertMessage::new(message.clone())
            .with_model_selection(selection.clone())
            .with_usage(outcome.usage);
        let result = self
            .gateway
            .upsert_message(&self.identity, &thread_id, request)
            .await;
        let persisted = match result {
            Ok(thread) => check_access(&self.identity, &thread).map(|()| thread),
            Err(source) => Err(SessionError::PersistenceFailure(source)),
        };

        let mut state = self.lock_state();
        state.turn_id = None;
        state.hide_draft();
        match persisted {
            Ok(thread) => {
                state.usage.record(message.id.clone(), outcome.usage);
                state.apply_thread(thread);
                self.publish(&state);
                info!(
                    turn_id,
                    %thread_id,
                    stopped = outcome.stopped,
                    input_tokens = outcome.usage.input_tokens,
                    output_tokens = outcome.usage.output_tokens,
                    "turn persisted"
                );
                Ok(outcome)
            }
            Err(failure) => {
                error!(turn_id, %thread_id, error = %failure, "assistant message write failed; kept as unsaved");
                state.unsaved = Some(UnsavedMessage {
                    message,
                    usage: outcome.usage,
                    model_selection: selection,
                    error: failure.to_string(),
                });
                state.error = Some(failure.to_string());
                self.publish(&state);
                Err(failure)
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        lock_unpoisoned(&self.state)
    }

    fn publish(&self, state: &SessionState) -> Arc<TranscriptSnapshot> {
        let snapshot = Arc::new(state.snapshot());
        self.snapshots.send_replace(Arc::clone(&snapshot));
        snapshot
    }
}

/// Rejects threads the acting identity may not see.
fn check_access(identity: &Identity, thread: &ThreadRecord) -> SessionResult<()> {
    if thread.user_id != identity.user_id {
        return Err(SessionError::Unauthorized(format!(
            "thread {} is not owned by {}",
            thread.id, identity.user_id
        )));
    }
    if !thread.is_live() {
        return Err(SessionError::ThreadNotFound(thread.id.clone()));
    }
    Ok(())
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

fn title_for(message: &UiMessage) -> Option<String> {
    let text = message.text();
    let first_line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    Some(first_line.chars().take(TITLE_MAX_CHARS).collect())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
