use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chat_protocol::{
    ModelSelection, Role, SelectionRequest, StreamEvent, ThreadRecord, ThreadUsage, TurnTrigger,
    UiMessage,
};
use chat_protocol_mock::{ScriptedStreamSource, ScriptedTurn};
use pretty_assertions::assert_eq;
use serde_json::json;
use thread_session::stream_processor::STREAM_ENDED_WITHOUT_TERMINAL;
use thread_session::{
    ModelCatalog, ModelInfo, ModelSelectionResolver, SessionError, ThreadSessionController,
    TranscriptSnapshot, TurnStatus,
};
use thread_store::{
    CreateThread, GatewayError, GatewayResult, Identity, MemoryThreadStore, PersistenceGateway,
    UpsertMessage,
};

const USER_ID: &str = "user-1";

/// Delegates to a [`MemoryThreadStore`] and injects failures on demand.
struct FaultyGateway {
    inner: MemoryThreadStore,
    fail_user_writes: AtomicBool,
    fail_assistant_writes: AtomicBool,
    foreign_owner: AtomicBool,
}

impl FaultyGateway {
    fn new() -> Self {
        Self {
            inner: MemoryThreadStore::new(default_selection()),
            fail_user_writes: AtomicBool::new(false),
            fail_assistant_writes: AtomicBool::new(false),
            foreign_owner: AtomicBool::new(false),
        }
    }

    fn disguise(&self, mut thread: ThreadRecord) -> ThreadRecord {
        if self.foreign_owner.load(Ordering::SeqCst) {
            thread.user_id = "someone-else".to_string();
        }
        thread
    }
}

#[async_trait]
impl PersistenceGateway for FaultyGateway {
    async fn list_threads(&self, identity: &Identity) -> GatewayResult<Vec<ThreadRecord>> {
        self.inner.list_threads(identity).await
    }

    async fn create_thread(
        &self,
        identity: &Identity,
        request: CreateThread,
    ) -> GatewayResult<ThreadRecord> {
        self.inner.create_thread(identity, request).await
    }

    async fn get_thread(
        &self,
        identity: &Identity,
        thread_id: &str,
    ) -> GatewayResult<ThreadRecord> {
        let thread = self.inner.get_thread(identity, thread_id).await?;
        Ok(self.disguise(thread))
    }

    async fn delete_thread(&self, identity: &Identity, thread_id: &str) -> GatewayResult<()> {
        self.inner.delete_thread(identity, thread_id).await
    }

    async fn update_model_selection(
        &self,
        identity: &Identity,
        thread_id: &str,
        selection: &ModelSelection,
    ) -> GatewayResult<ThreadRecord> {
        self.inner
            .update_model_selection(identity, thread_id, selection)
            .await
    }

    async fn upsert_message(
        &self,
        identity: &Identity,
        thread_id: &str,
        request: UpsertMessage,
    ) -> GatewayResult<ThreadRecord> {
        let flag = match request.message.role {
            Role::User => &self.fail_user_writes,
            _ => &self.fail_assistant_writes,
        };
        if flag.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("store unavailable".to_string()));
        }
        self.inner.upsert_message(identity, thread_id, request).await
    }

    async fn edit_and_truncate(
        &self,
        identity: &Identity,
        thread_id: &str,
        message_id: &str,
        message: UiMessage,
    ) -> GatewayResult<ThreadRecord> {
        self.inner
            .edit_and_truncate(identity, thread_id, message_id, message)
            .await
    }
}

struct Harness {
    controller: Arc<ThreadSessionController>,
    source: Arc<ScriptedStreamSource>,
    gateway: Arc<FaultyGateway>,
}

fn default_selection() -> ModelSelection {
    ModelSelection::new("claude-y", "anthropic", "medium", "anthropic")
}

fn resolver() -> ModelSelectionResolver {
    let catalog = ModelCatalog::new(
        vec![
            ModelInfo::new("claude-y", "anthropic", &["low", "medium", "high"], "medium"),
            ModelInfo::new("gpt-x", "openai", &["low", "high"], "low")
                .with_runtime_providers(&["openai", "azure"]),
        ],
        None,
    )
    .expect("catalog should be valid");
    ModelSelectionResolver::new(catalog)
}

fn harness(turns: Vec<ScriptedTurn>) -> Harness {
    let source = Arc::new(ScriptedStreamSource::new(turns));
    let gateway = Arc::new(FaultyGateway::new());
    let controller = ThreadSessionController::new(
        Identity::new(USER_ID),
        gateway.clone(),
        source.clone(),
        resolver(),
    );
    Harness {
        controller,
        source,
        gateway,
    }
}

fn held_after_two_deltas(message_id: &str) -> ScriptedTurn {
    ScriptedTurn::new(vec![
        StreamEvent::Start {
            message_id: Some(message_id.to_string()),
        },
        StreamEvent::TextStart {
            id: "t".to_string(),
        },
        StreamEvent::text_delta("t", "a"),
        StreamEvent::text_delta("t", "b"),
    ])
    .hold_open()
}

fn reply_with_usage(message_id: &str, text: &str, input: u64, output: u64) -> ScriptedTurn {
    ScriptedTurn::new(vec![
        StreamEvent::Start {
            message_id: Some(message_id.to_string()),
        },
        StreamEvent::TextStart {
            id: "t".to_string(),
        },
        StreamEvent::text_delta("t", text),
        StreamEvent::TextEnd {
            id: "t".to_string(),
        },
        StreamEvent::MessageMetadata {
            message_metadata: json!({"usage": {"inputTokens": input, "outputTokens": output}}),
        },
        StreamEvent::Finish {
            finish_reason: Some("stop".to_string()),
        },
    ])
}

async fn wait_for(
    controller: &ThreadSessionController,
    predicate: impl Fn(&TranscriptSnapshot) -> bool,
) -> Arc<TranscriptSnapshot> {
    let mut snapshots = controller.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = Arc::clone(&snapshots.borrow_and_update());
            if predicate(&snapshot) {
                return snapshot;
            }
            snapshots
                .changed()
                .await
                .expect("controller should outlive the wait");
        }
    })
    .await
    .expect("snapshot condition should be reached")
}

fn streaming_text(snapshot: &TranscriptSnapshot, text: &str) -> bool {
    snapshot.status == TurnStatus::Streaming
        && snapshot
            .last_message()
            .is_some_and(|message| message.role == Role::Assistant && message.text() == text)
}

#[tokio::test]
async fn first_send_creates_thread_and_persists_reply() {
    let harness = harness(vec![ScriptedTurn::text_reply("a1", &["Hel", "lo"])]);

    let outcome = harness
        .controller
        .send("Plan the release\nwith details", None)
        .await
        .expect("turn should complete");

    assert_eq!(outcome.status, TurnStatus::Ready);
    assert_eq!(outcome.text(), "Hello");
    assert!(!outcome.stopped);
    assert_eq!(outcome.model_selection, default_selection());

    let snapshot = harness.controller.snapshot();
    assert_eq!(snapshot.title.as_deref(), Some("Plan the release"));
    assert_eq!(
        snapshot.texts(),
        vec!["Plan the release\nwith details".to_string(), "Hello".to_string()]
    );
    assert_eq!(snapshot.confirmed_ordinals(), vec![0, 1]);
    assert_eq!(snapshot.status, TurnStatus::Ready);
    assert_eq!(snapshot.active_turn, None);

    let requests = harness.source.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].trigger, TurnTrigger::SubmitMessage);
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].role, Role::User);
}

#[tokio::test]
async fn live_transcript_is_ordered_and_excludes_deleted_records() {
    let harness = harness(vec![
        ScriptedTurn::text_reply("a1", &["one"]),
        ScriptedTurn::text_reply("a2", &["two"]),
        ScriptedTurn::text_reply("a3", &["three"]),
    ]);
    let controller = &harness.controller;

    controller
        .send(UiMessage::user_text("u1", "first"), None)
        .await
        .expect("first turn");
    controller
        .send(UiMessage::user_text("u2", "second"), None)
        .await
        .expect("second turn");
    controller
        .edit_and_truncate("u2", UiMessage::user_text("u2", "second, edited"))
        .await
        .expect("edit should truncate");
    controller
        .send(UiMessage::user_text("u3", "third"), None)
        .await
        .expect("third turn");

    let snapshot = controller.reload().await.expect("reload");
    assert_eq!(
        snapshot.texts(),
        vec!["first", "one", "second, edited", "third", "three"]
    );
    // Ordinal 3 belonged to the truncated reply and is never reused.
    assert_eq!(snapshot.confirmed_ordinals(), vec![0, 1, 2, 4, 5]);
}

#[tokio::test]
async fn edit_truncates_everything_after_the_edited_message() {
    let harness = harness(Vec::new());
    let owner = Identity::new(USER_ID);
    let gateway = &harness.gateway;

    let thread = gateway
        .create_thread(
            &owner,
            CreateThread::titled("seeded")
                .with_initial_user_message(UiMessage::user_text("m0", "zero")),
        )
        .await
        .expect("seed thread");
    for message in [
        UiMessage::user_text("m1", "one"),
        UiMessage::assistant_text("m2", "two"),
        UiMessage::user_text("m3", "three"),
    ] {
        gateway
            .upsert_message(&owner, &thread.id, UpsertMessage::new(message))
            .await
            .expect("seed message");
    }

    let opened = harness.controller.open(&thread.id).await.expect("open");
    assert_eq!(opened.confirmed_ordinals(), vec![0, 1, 2, 3]);

    let snapshot = harness
        .controller
        .edit_and_truncate("m1", UiMessage::user_text("ignored", "one, edited"))
        .await
        .expect("edit");

    assert_eq!(snapshot.confirmed_ordinals(), vec![0, 1]);
    assert_eq!(snapshot.texts(), vec!["zero".to_string(), "one, edited".to_string()]);
    assert_eq!(snapshot.entries[1].id(), "m1");
    assert_eq!(harness.source.requests().len(), 0);
}

#[tokio::test]
async fn stop_mid_stream_keeps_exactly_the_applied_deltas() {
    let harness = harness(vec![held_after_two_deltas("a1")]);
    let controller = Arc::clone(&harness.controller);

    let turn = tokio::spawn(async move { controller.send("hello", None).await });
    wait_for(&harness.controller, |snapshot| streaming_text(snapshot, "ab")).await;

    assert!(harness.controller.stop());
    let outcome = turn
        .await
        .expect("turn task should not panic")
        .expect("stopped turn is not an error");

    assert_eq!(outcome.status, TurnStatus::Ready);
    assert!(outcome.stopped);
    assert_eq!(outcome.finish_reason.as_deref(), Some("stop"));
    assert_eq!(outcome.text(), "ab");

    let snapshot = harness.controller.snapshot();
    assert_eq!(snapshot.status, TurnStatus::Ready);
    assert_eq!(snapshot.texts(), vec!["hello".to_string(), "ab".to_string()]);
    assert_eq!(snapshot.confirmed_ordinals(), vec![0, 1]);
    assert!(!harness.controller.stop());
}

#[tokio::test]
async fn new_send_settles_the_streaming_turn_before_starting() {
    let harness = harness(vec![
        held_after_two_deltas("a1"),
        ScriptedTurn::text_reply("a2", &["done"]),
    ]);
    let controller = Arc::clone(&harness.controller);

    let first = tokio::spawn(async move { controller.send("first", None).await });
    wait_for(&harness.controller, |snapshot| streaming_text(snapshot, "ab")).await;

    let second = harness
        .controller
        .send("second", None)
        .await
        .expect("second turn");
    let first = first
        .await
        .expect("first task should not panic")
        .expect("superseded turn is not an error");

    assert_eq!(first.status, TurnStatus::Ready);
    assert!(first.stopped);
    assert_eq!(first.text(), "ab");
    assert_eq!(second.text(), "done");
    assert!(second.turn_id > first.turn_id);

    let requests = harness.source.requests();
    assert_eq!(requests.len(), 2);
    let context: Vec<String> = requests[1].messages.iter().map(UiMessage::text).collect();
    assert_eq!(context, vec!["first", "ab", "second"]);

    let snapshot = harness.controller.snapshot();
    assert_eq!(snapshot.texts(), vec!["first", "ab", "second", "done"]);
    assert_eq!(snapshot.confirmed_ordinals(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn failed_user_write_rolls_back_without_opening_a_stream() {
    let harness = harness(vec![ScriptedTurn::text_reply("a1", &["hi"])]);
    harness
        .controller
        .send("hello", None)
        .await
        .expect("first turn");
    let before = harness.controller.snapshot();

    harness.gateway.fail_user_writes.store(true, Ordering::SeqCst);
    let error = harness
        .controller
        .send("lost", None)
        .await
        .expect_err("user write should fail");

    assert!(matches!(error, SessionError::PersistenceFailure(_)));
    assert!(error.is_recoverable());
    let after = harness.controller.snapshot();
    assert_eq!(after.texts(), before.texts());
    assert!(after.error.is_some());
    assert_eq!(harness.source.requests().len(), 1);
}

#[tokio::test]
async fn failed_reply_write_is_kept_unsaved_until_retried() {
    let harness = harness(vec![ScriptedTurn::text_reply("a1", &["Hel", "lo"])]);
    let controller = &harness.controller;
    controller.create(None).await.expect("create");

    harness
        .gateway
        .fail_assistant_writes
        .store(true, Ordering::SeqCst);
    let error = controller
        .send("hi", None)
        .await
        .expect_err("final write should fail");
    assert!(matches!(error, SessionError::PersistenceFailure(_)));

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.texts(), vec!["hi".to_string()]);
    let unsaved = snapshot.unsaved.as_ref().expect("reply kept as unsaved");
    assert_eq!(unsaved.message.id, "a1");
    assert_eq!(unsaved.message.text(), "Hello");
    assert!(snapshot.error.is_some());

    harness
        .gateway
        .fail_assistant_writes
        .store(false, Ordering::SeqCst);
    let snapshot = controller
        .retry_persistence()
        .await
        .expect("retry should persist");
    assert_eq!(snapshot.texts(), vec!["hi".to_string(), "Hello".to_string()]);
    assert_eq!(snapshot.unsaved, None);
    assert_eq!(snapshot.error, None);

    assert!(matches!(
        controller.retry_persistence().await,
        Err(SessionError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn threads_of_other_users_are_unauthorized() {
    let harness = harness(Vec::new());
    let snapshot = harness.controller.create(None).await.expect("create");
    let thread_id = snapshot.thread_id.clone().expect("thread id");

    harness.gateway.foreign_owner.store(true, Ordering::SeqCst);
    assert!(matches!(
        harness.controller.open(&thread_id).await,
        Err(SessionError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn deleted_and_unknown_threads_are_not_found() {
    let harness = harness(Vec::new());
    let controller = &harness.controller;

    assert!(matches!(
        controller.open("missing").await,
        Err(SessionError::ThreadNotFound(_))
    ));

    let snapshot = controller.create(Some("doomed".to_string())).await.expect("create");
    let thread_id = snapshot.thread_id.clone().expect("thread id");
    controller.delete_thread().await.expect("delete");

    assert_eq!(controller.thread_id(), None);
    assert!(matches!(
        controller.open(&thread_id).await,
        Err(SessionError::ThreadNotFound(_))
    ));
    assert!(controller
        .list_threads()
        .await
        .expect("list")
        .iter()
        .all(|thread| thread.id != thread_id));
}

#[tokio::test]
async fn edit_and_rerun_reject_invalid_targets() {
    let harness = harness(vec![ScriptedTurn::text_reply("a1", &["reply"])]);
    let controller = &harness.controller;

    assert!(matches!(
        controller.rerun("a1", None).await,
        Err(SessionError::InvalidOperation(_))
    ));
    assert!(matches!(
        controller
            .edit_and_truncate("u1", UiMessage::user_text("u1", "x"))
            .await,
        Err(SessionError::InvalidOperation(_))
    ));

    controller
        .send(UiMessage::user_text("u1", "question"), None)
        .await
        .expect("turn");

    assert!(matches!(
        controller.rerun("u1", None).await,
        Err(SessionError::InvalidOperation(_))
    ));
    assert!(matches!(
        controller
            .edit_and_truncate("a1", UiMessage::user_text("a1", "x"))
            .await,
        Err(SessionError::InvalidOperation(_))
    ));
    assert!(matches!(
        controller
            .edit_and_truncate("u1", UiMessage::assistant_text("u1", "x"))
            .await,
        Err(SessionError::InvalidRequest(_))
    ));
    assert_eq!(
        controller.snapshot().texts(),
        vec!["question".to_string(), "reply".to_string()]
    );
}

#[tokio::test]
async fn rerun_replaces_the_assistant_message_in_place() {
    let harness = harness(vec![
        ScriptedTurn::text_reply("a1", &["first"]),
        ScriptedTurn::text_reply("server-id", &["second"]),
    ]);
    let controller = &harness.controller;
    controller
        .send(UiMessage::user_text("u1", "question"), None)
        .await
        .expect("turn");

    let outcome = controller
        .rerun("a1", Some(SelectionRequest::for_model("gpt-x")))
        .await
        .expect("rerun");

    assert_eq!(outcome.text(), "second");
    assert_eq!(outcome.model_selection.model_id, "gpt-x");
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.texts(), vec!["question".to_string(), "second".to_string()]);
    assert_eq!(snapshot.confirmed_ordinals(), vec![0, 1]);
    let entry = snapshot.entry("a1").expect("message keeps its id");
    assert_eq!(
        entry.model_selection.as_ref().map(|selection| selection.model_id.as_str()),
        Some("gpt-x")
    );

    let requests = harness.source.requests();
    assert_eq!(
        requests[1].trigger,
        TurnTrigger::RegenerateMessage {
            message_id: "a1".to_string()
        }
    );
    let context: Vec<String> = requests[1].messages.iter().map(UiMessage::text).collect();
    assert_eq!(context, vec!["question"]);
}

#[tokio::test]
async fn failed_rerun_restores_the_previous_content() {
    let harness = harness(vec![
        ScriptedTurn::text_reply("a1", &["original"]),
        ScriptedTurn::new(vec![
            StreamEvent::Start { message_id: None },
            StreamEvent::TextStart {
                id: "t".to_string(),
            },
            StreamEvent::text_delta("t", "par"),
        ])
        .fail_with("upstream reset"),
    ]);
    let controller = &harness.controller;
    controller
        .send(UiMessage::user_text("u1", "question"), None)
        .await
        .expect("turn");

    let outcome = controller.rerun("a1", None).await.expect("error is an outcome");

    assert_eq!(outcome.status, TurnStatus::Error);
    assert_eq!(outcome.error.as_deref(), Some("upstream reset"));
    assert_eq!(outcome.text(), "par");

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.status, TurnStatus::Error);
    assert_eq!(snapshot.error.as_deref(), Some("upstream reset"));
    assert_eq!(
        snapshot.texts(),
        vec!["question".to_string(), "original".to_string()]
    );
}

#[tokio::test]
async fn stream_closing_without_terminal_event_is_an_error() {
    let harness = harness(vec![ScriptedTurn::new(vec![
        StreamEvent::Start {
            message_id: Some("a1".to_string()),
        },
        StreamEvent::TextStart {
            id: "t".to_string(),
        },
        StreamEvent::text_delta("t", "half"),
    ])]);

    let outcome = harness
        .controller
        .send("hello", None)
        .await
        .expect("error is an outcome");

    assert_eq!(outcome.status, TurnStatus::Error);
    assert_eq!(outcome.error.as_deref(), Some(STREAM_ENDED_WITHOUT_TERMINAL));
    assert_eq!(outcome.text(), "half");

    let thread_id = harness.controller.thread_id().expect("thread was created");
    let stored = harness
        .gateway
        .get_thread(&Identity::new(USER_ID), &thread_id)
        .await
        .expect("thread");
    assert_eq!(stored.live_transcript().len(), 1);
}

#[tokio::test]
async fn stream_that_fails_to_open_reports_an_error_outcome() {
    let harness = harness(vec![ScriptedTurn::open_failure("connection refused")]);

    let outcome = harness
        .controller
        .send("hello", None)
        .await
        .expect("error is an outcome");

    assert_eq!(outcome.status, TurnStatus::Error);
    assert_eq!(outcome.error.as_deref(), Some("connection refused"));
    assert_eq!(harness.controller.snapshot().texts()[0], "hello");
}

#[tokio::test]
async fn model_selection_is_stored_on_the_thread_and_remapped() {
    let harness = harness(vec![
        ScriptedTurn::text_reply("a1", &["one"]),
        ScriptedTurn::text_reply("a2", &["two"]),
    ]);
    let controller = &harness.controller;

    assert!(matches!(
        controller
            .set_model_selection(SelectionRequest::for_model("gpt-x"))
            .await,
        Err(SessionError::InvalidOperation(_))
    ));

    controller.create(None).await.expect("create");
    let selection = controller
        .set_model_selection(SelectionRequest::for_model("gpt-x").with_reasoning_budget("medium"))
        .await
        .expect("update selection");

    assert_eq!(
        selection,
        ModelSelection::new("gpt-x", "openai", "low", "openai")
    );
    assert_eq!(controller.snapshot().model_selection, Some(selection.clone()));

    controller.send("hi", None).await.expect("turn");
    controller
        .send("again", Some(SelectionRequest::for_model("unknown-model")))
        .await
        .expect("turn");

    let requests = harness.source.requests();
    assert_eq!(requests[0].model_selection, selection);
    assert_eq!(requests[1].model_selection, selection);
}

#[tokio::test]
async fn usage_is_recorded_per_message_and_rolled_up() {
    let harness = harness(vec![
        reply_with_usage("a1", "one", 10, 5),
        reply_with_usage("a2", "two", 12, 5),
    ]);
    let controller = &harness.controller;

    let first = controller.send("q1", None).await.expect("turn");
    assert_eq!(first.usage, ThreadUsage::new(10, 5));
    controller.send("q2", None).await.expect("turn");

    let snapshot = controller.snapshot();
    assert_eq!(
        snapshot.entry("a2").map(|entry| entry.usage),
        Some(ThreadUsage::new(12, 5))
    );
    assert_eq!(controller.usage_rollup(), ThreadUsage::new(22, 10));

    let reopened = controller
        .open(snapshot.thread_id.as_deref().expect("thread id"))
        .await
        .expect("reopen");
    assert_eq!(reopened.usage, ThreadUsage::new(22, 10));
}

#[tokio::test]
async fn start_id_of_a_live_message_is_not_adopted() {
    let harness = harness(vec![
        ScriptedTurn::text_reply("a1", &["one"]),
        ScriptedTurn::text_reply("a1", &["two"]),
    ]);
    let controller = &harness.controller;

    controller.send("q1", None).await.expect("turn");
    let second = controller.send("q2", None).await.expect("turn");

    let second_id = second.message.as_ref().map(|message| message.id.clone());
    assert_ne!(second_id.as_deref(), Some("a1"));

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.texts(), vec!["q1", "one", "q2", "two"]);
    assert_eq!(snapshot.confirmed_ordinals(), vec![0, 1, 2, 3]);
    assert_eq!(
        snapshot.entry("a1").map(|entry| entry.message.text()),
        Some("one".to_string())
    );

    let thread_id = controller.thread_id().expect("thread was created");
    let stored = harness
        .gateway
        .get_thread(&Identity::new(USER_ID), &thread_id)
        .await
        .expect("thread");
    assert_eq!(stored.live_transcript().len(), 4);
}

#[tokio::test]
async fn finished_turn_without_parts_still_records_usage() {
    let harness = harness(vec![ScriptedTurn::new(vec![
        StreamEvent::Start {
            message_id: Some("a1".to_string()),
        },
        StreamEvent::MessageMetadata {
            message_metadata: json!({"usage": {"inputTokens": 7}}),
        },
        StreamEvent::Finish {
            finish_reason: Some("stop".to_string()),
        },
    ])]);
    let controller = &harness.controller;

    let outcome = controller.send("hello", None).await.expect("turn");

    assert_eq!(outcome.status, TurnStatus::Ready);
    assert!(!outcome.stopped);
    assert_eq!(controller.usage_rollup().input_tokens, 7);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.confirmed_ordinals(), vec![0, 1]);
    let thread_id = controller.thread_id().expect("thread was created");
    let stored = harness
        .gateway
        .get_thread(&Identity::new(USER_ID), &thread_id)
        .await
        .expect("thread");
    assert_eq!(stored.live_transcript().len(), 2);
}

#[tokio::test]
async fn invalid_rerun_leaves_the_streaming_turn_running() {
    let harness = harness(vec![held_after_two_deltas("a1")]);
    let controller = Arc::clone(&harness.controller);

    let turn = tokio::spawn(async move { controller.send("hello", None).await });
    wait_for(&harness.controller, |snapshot| streaming_text(snapshot, "ab")).await;

    assert!(matches!(
        harness.controller.rerun("does-not-exist", None).await,
        Err(SessionError::InvalidOperation(_))
    ));
    assert_eq!(harness.controller.snapshot().status, TurnStatus::Streaming);

    assert!(harness.controller.stop());
    let outcome = turn
        .await
        .expect("turn task should not panic")
        .expect("stopped turn is not an error");
    assert!(outcome.stopped);
    assert_eq!(outcome.text(), "ab");
    assert_eq!(harness.source.requests().len(), 1);
}
