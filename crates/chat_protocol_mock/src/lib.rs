//! Deterministic scripted implementations of the `chat_protocol` stream seam.
//!
//! This crate contains no transport logic and is intended for local
//! development and contract-level testing of the session runtime.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chat_protocol::{
    CancelToken, EventStream, Role, StreamEvent, StreamSource, StreamSourceError, TurnRequest,
};
use futures_util::stream::{self, BoxStream, StreamExt};

/// Stable source identifier used by scripted sources.
pub const MOCK_SOURCE_ID: &str = "mock";

/// How a scripted stream behaves after its last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEnding {
    /// The stream ends.
    Close,
    /// The stream never yields again until cancelled.
    HoldOpen,
    /// The stream yields one transport error, then ends.
    TransportError(String),
}

/// One turn's worth of scripted behavior.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub events: Vec<StreamEvent>,
    pub ending: TurnEnding,
    pub event_delay: Option<Duration>,
    open_error: Option<String>,
}

impl ScriptedTurn {
    #[must_use]
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            ending: TurnEnding::Close,
            event_delay: None,
            open_error: None,
        }
    }

    /// A turn whose `open` call itself fails.
    #[must_use]
    pub fn open_failure(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            ..Self::new(Vec::new())
        }
    }

    /// `start`, one text part built from `chunks`, then `finish`.
    #[must_use]
    pub fn text_reply(message_id: impl Into<String>, chunks: &[&str]) -> Self {
        let mut events = vec![
            StreamEvent::Start {
                message_id: Some(message_id.into()),
            },
            StreamEvent::TextStart {
                id: "text-0".to_string(),
            },
        ];
        events.extend(
            chunks
                .iter()
                .map(|chunk| StreamEvent::text_delta("text-0", *chunk)),
        );
        events.push(StreamEvent::TextEnd {
            id: "text-0".to_string(),
        });
        events.push(StreamEvent::Finish {
            finish_reason: Some("stop".to_string()),
        });
        Self::new(events)
    }

    #[must_use]
    pub fn hold_open(mut self) -> Self {
        self.ending = TurnEnding::HoldOpen;
        self
    }

    #[must_use]
    pub fn fail_with(mut self, message: impl Into<String>) -> Self {
        self.ending = TurnEnding::TransportError(message.into());
        self
    }

    #[must_use]
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    fn into_stream(self, cancel: CancelToken) -> EventStream {
        let delay = self.event_delay;
        let events = stream::iter(self.events.into_iter().map(Ok)).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });

        let ending: BoxStream<'static, Result<StreamEvent, StreamSourceError>> = match self.ending
        {
            TurnEnding::Close => stream::empty().boxed(),
            TurnEnding::HoldOpen => stream::pending().boxed(),
            TurnEnding::TransportError(message) => {
                stream::once(async move { Err(StreamSourceError::new(message)) }).boxed()
            }
        };

        events
            .chain(ending)
            .take_until(cancel.cancelled_owned())
            .boxed()
    }
}

/// Replays queued [`ScriptedTurn`]s, one per `open` call, and records requests.
#[derive(Debug, Default)]
pub struct ScriptedStreamSource {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedStreamSource {
    #[must_use]
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        lock_unpoisoned(&self.turns).push_back(turn);
    }

    /// Requests received so far, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<TurnRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    #[must_use]
    pub fn remaining_turns(&self) -> usize {
        lock_unpoisoned(&self.turns).len()
    }
}

#[async_trait]
impl StreamSource for ScriptedStreamSource {
    fn source_id(&self) -> &str {
        MOCK_SOURCE_ID
    }

    async fn open(
        &self,
        request: TurnRequest,
        cancel: CancelToken,
    ) -> Result<EventStream, StreamSourceError> {
        lock_unpoisoned(&self.requests).push(request);
        let turn = lock_unpoisoned(&self.turns)
            .pop_front()
            .ok_or_else(|| StreamSourceError::new("no scripted turn remaining"))?;

        if let Some(message) = turn.open_error.clone() {
            return Err(StreamSourceError::new(message));
        }

        Ok(turn.into_stream(cancel))
    }
}

/// Answers every turn by echoing the latest user message in small chunks.
#[derive(Debug, Default)]
pub struct EchoStreamSource {
    chunk_delay: Option<Duration>,
}

impl EchoStreamSource {
    #[must_use]
    pub fn with_chunk_delay(delay: Duration) -> Self {
        Self {
            chunk_delay: Some(delay),
        }
    }
}

#[async_trait]
impl StreamSource for EchoStreamSource {
    fn source_id(&self) -> &str {
        MOCK_SOURCE_ID
    }

    async fn open(
        &self,
        request: TurnRequest,
        cancel: CancelToken,
    ) -> Result<EventStream, StreamSourceError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.text())
            .unwrap_or_default();
        let reply = format!("echo ({}): {prompt}", request.model_selection.model_id);
        let chunks: Vec<&str> = reply.split_inclusive(' ').collect();

        let mut turn = ScriptedTurn::text_reply(format!("echo-{}", request.turn_id), &chunks);
        turn.event_delay = self.chunk_delay;
        Ok(turn.into_stream(cancel))
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use chat_protocol::{ModelSelection, TurnTrigger, UiMessage};

    use super::*;

    fn request(turn_id: u64, text: &str) -> TurnRequest {
        TurnRequest {
            turn_id,
            thread_id: "thread-1".to_string(),
            messages: vec![UiMessage::user_text("u1", text)],
            model_selection: ModelSelection::new("mock-model", "mock", "low", "mock"),
            trigger: TurnTrigger::SubmitMessage,
        }
    }

    async fn collect(stream: EventStream) -> Vec<Result<StreamEvent, StreamSourceError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn scripted_turns_are_replayed_in_order_and_requests_recorded() {
        let source = ScriptedStreamSource::new(vec![
            ScriptedTurn::text_reply("a1", &["Hel", "lo"]),
            ScriptedTurn::open_failure("unavailable"),
        ]);

        let events = collect(
            source
                .open(request(1, "hi"), CancelToken::new())
                .await
                .expect("first turn opens"),
        )
        .await;
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(Result::is_ok));

        let error = match source.open(request(2, "again"), CancelToken::new()).await {
            Ok(_) => panic!("second turn should fail to open"),
            Err(error) => error,
        };
        assert_eq!(error.message, "unavailable");
        assert_eq!(source.requests().len(), 2);
        assert_eq!(source.remaining_turns(), 0);
    }

    #[tokio::test]
    async fn held_open_stream_ends_on_cancellation() {
        let source = ScriptedStreamSource::new(vec![ScriptedTurn::new(vec![
            StreamEvent::text_delta("t", "a"),
        ])
        .hold_open()]);
        let cancel = CancelToken::new();
        let mut stream = source
            .open(request(1, "hi"), cancel.clone())
            .await
            .expect("turn opens");

        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn transport_error_ending_yields_error_item() {
        let source = ScriptedStreamSource::new(vec![ScriptedTurn::new(Vec::new()).fail_with("reset")]);
        let events = collect(
            source
                .open(request(1, "hi"), CancelToken::new())
                .await
                .expect("turn opens"),
        )
        .await;

        assert_eq!(events, vec![Err(StreamSourceError::new("reset"))]);
    }

    #[tokio::test]
    async fn echo_source_repeats_latest_user_text() {
        let events = collect(
            EchoStreamSource::default()
                .open(request(3, "ping pong"), CancelToken::new())
                .await
                .expect("echo opens"),
        )
        .await;

        let text: String = events
            .into_iter()
            .filter_map(|event| match event {
                Ok(StreamEvent::TextDelta { delta, .. }) => Some(delta),
                _ => None,
            })
            .collect();
        assert_eq!(text, "echo (mock-model): ping pong");
    }
}
