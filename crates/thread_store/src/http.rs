use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chat_protocol::{ModelSelection, ThreadRecord, UiMessage};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{Identity, PersistenceGateway};
use crate::schema::{
    CreateThread, EditMessageBody, OkEnvelope, ThreadEnvelope, ThreadListEnvelope,
    UpdateThreadBody, UpsertMessage,
};

/// Header carrying the acting user id alongside the bearer credential.
pub const HEADER_USER_ID: &str = "x-user-id";

/// Transport configuration for the remote thread API.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    /// Base URL under which `/threads` is served.
    pub base_url: String,
    /// Fallback bearer token when the identity carries none.
    pub access_token: Option<String>,
    /// Additional headers merged into request headers.
    pub extra_headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl HttpGatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: None,
            extra_headers: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }
}

/// [`PersistenceGateway`] over the thread HTTP API.
#[derive(Debug)]
pub struct HttpThreadGateway {
    http: Client,
    config: HttpGatewayConfig,
    base: Url,
}

impl HttpThreadGateway {
    pub fn new(config: HttpGatewayConfig) -> GatewayResult<Self> {
        let base = Url::parse(config.base_url.trim()).map_err(|error| {
            GatewayError::invalid_request(format!("invalid store base URL: {error}"))
        })?;
        if base.cannot_be_a_base() {
            return Err(GatewayError::invalid_request(format!(
                "store base URL cannot carry paths: {base}"
            )));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|error| GatewayError::Transport(error.to_string()))?;

        Ok(Self { http, config, base })
    }

    pub fn config(&self) -> &HttpGatewayConfig {
        &self.config
    }

    /// Resolves `segments` under the base URL, escaping each segment.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    fn headers(&self, identity: &Identity) -> GatewayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut insert = |key: &str, value: &str| -> GatewayResult<()> {
            let name = HeaderName::from_bytes(key.trim().to_ascii_lowercase().as_bytes())
                .map_err(|_| GatewayError::invalid_request(format!("invalid header key: {key}")))?;
            let value = HeaderValue::from_str(value.trim()).map_err(|_| {
                GatewayError::invalid_request(format!("invalid header value for {key}"))
            })?;
            headers.insert(name, value);
            Ok(())
        };

        insert("accept", "application/json")?;
        insert(HEADER_USER_ID, &identity.user_id)?;

        let token = identity
            .access_token
            .as_deref()
            .or(self.config.access_token.as_deref())
            .map(str::trim)
            .filter(|token| !token.is_empty());
        if let Some(token) = token {
            insert("authorization", &format!("Bearer {token}"))?;
        }

        for (key, value) in &self.config.extra_headers {
            insert(key, value)?;
        }

        Ok(headers)
    }

    fn request(
        &self,
        identity: &Identity,
        method: Method,
        segments: &[&str],
    ) -> GatewayResult<RequestBuilder> {
        if !identity.is_authenticated() {
            return Err(GatewayError::unauthorized("missing user identity"));
        }
        let url = self.endpoint(segments);
        debug!(%method, %url, "thread store request");
        Ok(self
            .http
            .request(method, url)
            .headers(self.headers(identity)?))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        not_found: impl FnOnce() -> GatewayError,
    ) -> GatewayResult<T> {
        let response = request
            .send()
            .await
            .map_err(|error| GatewayError::Transport(error.to_string()))?;
        let response = check_status(response, not_found).await?;
        response
            .json::<T>()
            .await
            .map_err(|error| GatewayError::Transport(format!("invalid response body: {error}")))
    }
}

async fn check_status(
    response: Response,
    not_found: impl FnOnce() -> GatewayError,
) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(status, &body);
    warn!(%status, %message, "thread store request failed");

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized(message),
        StatusCode::BAD_REQUEST => GatewayError::InvalidRequest(message),
        StatusCode::NOT_FOUND => not_found(),
        other => GatewayError::UnexpectedStatus {
            status: other.as_u16(),
            message,
        },
    })
}

fn error_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let from_body = parsed.as_ref().and_then(|value| {
        value
            .get("error")
            .and_then(|error| error.as_str().or_else(|| error.get("message")?.as_str()))
            .or_else(|| value.get("message")?.as_str())
            .map(ToString::to_string)
    });

    from_body
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

#[async_trait]
impl PersistenceGateway for HttpThreadGateway {
    async fn list_threads(&self, identity: &Identity) -> GatewayResult<Vec<ThreadRecord>> {
        let request = self.request(identity, Method::GET, &["threads"])?;
        let envelope: ThreadListEnvelope = self
            .execute(request, || GatewayError::thread_not_found("*"))
            .await?;
        Ok(envelope.threads)
    }

    async fn create_thread(
        &self,
        identity: &Identity,
        request: CreateThread,
    ) -> GatewayResult<ThreadRecord> {
        let builder = self
            .request(identity, Method::POST, &["threads"])?
            .json(&request);
        let envelope: ThreadEnvelope = self
            .execute(builder, || GatewayError::thread_not_found("*"))
            .await?;
        Ok(envelope.thread)
    }

    async fn get_thread(
        &self,
        identity: &Identity,
        thread_id: &str,
    ) -> GatewayResult<ThreadRecord> {
        let request = self.request(identity, Method::GET, &["threads", thread_id])?;
        let envelope: ThreadEnvelope = self
            .execute(request, || GatewayError::thread_not_found(thread_id))
            .await?;
        Ok(envelope.thread)
    }

    async fn delete_thread(&self, identity: &Identity, thread_id: &str) -> GatewayResult<()> {
        let request = self.request(identity, Method::DELETE, &["threads", thread_id])?;
        let envelope: OkEnvelope = self
            .execute(request, || GatewayError::thread_not_found(thread_id))
            .await?;
        if envelope.ok {
            Ok(())
        } else {
            Err(GatewayError::UnexpectedStatus {
                status: 200,
                message: "delete was not acknowledged".to_string(),
            })
        }
    }

    async fn update_model_selection(
        &self,
        identity: &Identity,
        thread_id: &str,
        selection: &ModelSelection,
    ) -> GatewayResult<ThreadRecord> {
        let body = UpdateThreadBody {
            model_selection: serde_json::to_value(selection)?,
        };
        let request = self
            .request(identity, Method::PATCH, &["threads", thread_id])?
            .json(&body);
        let envelope: ThreadEnvelope = self
            .execute(request, || GatewayError::thread_not_found(thread_id))
            .await?;
        Ok(envelope.thread)
    }

    async fn upsert_message(
        &self,
        identity: &Identity,
        thread_id: &str,
        request: UpsertMessage,
    ) -> GatewayResult<ThreadRecord> {
        let builder = self
            .request(identity, Method::POST, &["threads", thread_id, "messages"])?
            .json(&request);
        let envelope: ThreadEnvelope = self
            .execute(builder, || GatewayError::thread_not_found(thread_id))
            .await?;
        Ok(envelope.thread)
    }

    async fn edit_and_truncate(
        &self,
        identity: &Identity,
        thread_id: &str,
        message_id: &str,
        message: UiMessage,
    ) -> GatewayResult<ThreadRecord> {
        let body = EditMessageBody { message };
        let request = self
            .request(
                identity,
                Method::PATCH,
                &["threads", thread_id, "messages", message_id],
            )?
            .json(&body);
        let envelope: ThreadEnvelope = self
            .execute(request, || GatewayError::message_not_found(message_id))
            .await?;
        Ok(envelope.thread)
    }
}
