use std::collections::VecDeque;
use std::future::Future;

use async_trait::async_trait;
use chat_protocol::{
    CancelToken, EventStream, StreamSource, StreamSourceError, TurnRequest,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::ChatApiConfig;
use crate::error::{parse_error_message, ChatApiError};
use crate::headers::build_headers;
use crate::payload::ChatRequest;
use crate::retry::{is_retryable_http_error, retry_delay, MAX_RETRIES};
use crate::sse::SseStreamParser;
use crate::url::normalize_chat_url;

/// Stable source identifier reported through [`StreamSource::source_id`].
pub const CHAT_API_SOURCE_ID: &str = "chat-api";

#[derive(Debug)]
pub struct ChatApiClient {
    http: Client,
    config: ChatApiConfig,
}

impl ChatApiClient {
    pub fn new(config: ChatApiConfig) -> Result<Self, ChatApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(ChatApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ChatApiConfig {
        &self.config
    }

    pub fn normalized_endpoint(&self) -> String {
        normalize_chat_url(&self.config.base_url)
    }

    pub fn build_headers(&self) -> Result<HeaderMap, ChatApiError> {
        let mut out = HeaderMap::new();
        for (key, value) in build_headers(&self.config) {
            out.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| ChatApiError::InvalidHeader(format!("invalid header key: {key}")))?,
                HeaderValue::from_str(&value).map_err(|_| {
                    ChatApiError::InvalidHeader(format!("invalid header value for {key}"))
                })?,
            );
        }
        Ok(out)
    }

    pub fn build_request(
        &self,
        request: &ChatRequest,
    ) -> Result<reqwest::RequestBuilder, ChatApiError> {
        let headers = self.build_headers()?;
        Ok(self
            .http
            .post(self.normalized_endpoint())
            .headers(headers)
            .json(request))
    }

    /// Posts the turn, retrying transient failures with exponential backoff.
    ///
    /// Cancellation is honoured while connecting, while reading an error body,
    /// and while waiting between attempts.
    pub async fn send_with_retry(
        &self,
        request: &ChatRequest,
        cancel: &CancelToken,
    ) -> Result<Response, ChatApiError> {
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if cancel.is_cancelled() {
                return Err(ChatApiError::Cancelled);
            }

            let response = await_or_cancel(self.build_request(request)?.send(), cancel)
                .await?
                .map_err(ChatApiError::from);

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancel)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    if attempt < MAX_RETRIES && is_retryable_http_error(status.as_u16(), &body) {
                        warn!(%status, attempt, %message, "retrying chat request");
                        self.backoff(attempt, cancel).await?;
                        continue;
                    }

                    return Err(ChatApiError::Status(status, message));
                }
                Err(error) => {
                    let message = error.to_string();
                    last_error = Some(message.clone());
                    if attempt < MAX_RETRIES {
                        warn!(attempt, %message, "retrying chat request after transport error");
                        self.backoff(attempt, cancel).await?;
                        continue;
                    }
                    return Err(ChatApiError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(ChatApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    /// Opens the turn and returns its decoded event stream.
    pub async fn stream(
        &self,
        request: &TurnRequest,
        cancel: CancelToken,
    ) -> Result<EventStream, ChatApiError> {
        let body = ChatRequest::from(request);
        debug!(
            thread_id = %body.id,
            turn_id = request.turn_id,
            trigger = %body.trigger,
            model = %body.model_selection.model_id,
            "opening chat stream"
        );
        let response = self.send_with_retry(&body, &cancel).await?;
        Ok(event_stream(response, cancel))
    }

    async fn backoff(&self, attempt: u32, cancel: &CancelToken) -> Result<(), ChatApiError> {
        await_or_cancel(
            tokio::time::sleep(retry_delay(self.config.retry_base_delay, attempt)),
            cancel,
        )
        .await
    }
}

#[async_trait]
impl StreamSource for ChatApiClient {
    fn source_id(&self) -> &str {
        CHAT_API_SOURCE_ID
    }

    async fn open(
        &self,
        request: TurnRequest,
        cancel: CancelToken,
    ) -> Result<EventStream, StreamSourceError> {
        self.stream(&request, cancel)
            .await
            .map_err(|error| StreamSourceError::new(error.to_string()))
    }
}

struct BodyState {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    parser: SseStreamParser,
    pending: VecDeque<chat_protocol::StreamEvent>,
    finished: bool,
}

/// Decodes the response body lazily; nothing buffered is yielded after `cancel`.
fn event_stream(response: Response, cancel: CancelToken) -> EventStream {
    let state = BodyState {
        bytes: response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed(),
        parser: SseStreamParser::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.feed(&chunk);
                    state.pending.extend(events);
                }
                Some(Err(error)) => {
                    state.finished = true;
                    let error = StreamSourceError::new(format!("stream read failed: {error}"));
                    return Some((Err(error), state));
                }
                None => {
                    state.finished = true;
                    let events = state.parser.finish();
                    state.pending.extend(events);
                }
            }
        }
    })
    .take_until(cancel.cancelled_owned())
    .boxed()
}

async fn await_or_cancel<F>(future: F, cancel: &CancelToken) -> Result<F::Output, ChatApiError>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatApiError::Cancelled),
        output = future => Ok(output),
    }
}
