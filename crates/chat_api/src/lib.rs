//! HTTP transport for streamed chat turns.
//!
//! This crate posts one turn to a chat endpoint and decodes the server-sent
//! event body into [`chat_protocol::StreamEvent`]s. It implements
//! [`chat_protocol::StreamSource`] and owns retry, timeout, and read
//! cancellation. It contains no transcript or persistence logic.

pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod sse;
pub mod url;

pub use client::ChatApiClient;
pub use config::ChatApiConfig;
pub use error::ChatApiError;
pub use payload::ChatRequest;
pub use sse::SseStreamParser;
pub use url::normalize_chat_url;
