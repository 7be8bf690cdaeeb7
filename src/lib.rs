//! Thread session runtime.
//!
//! Turns a turn's ordered protocol events into a render-ready transcript,
//! reconciles optimistic local edits with an append-only thread store,
//! resolves the effective model selection per turn, and tracks per-message
//! usage.
//!
//! # Public API Overview
//! - [`ThreadSessionController`] orchestrates send, edit, rerun and stop for
//!   one open thread and publishes [`TranscriptSnapshot`]s.
//! - [`StreamChunkProcessor`] folds one turn's events into a draft message.
//! - [`ModelSelectionResolver`] applies catalog-backed selection precedence.
//! - [`UsageAggregator`] keeps per-message usage and thread rollups.
//! - [`collaborators`] builds a controller from [`EnvConfig`].

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod model_selection;
pub mod snapshot;
pub mod stream_processor;
pub mod usage;

pub use crate::config::{ConfigError, EnvConfig};
pub use crate::controller::{SendInput, ThreadSessionController, TurnOutcome};
pub use crate::error::{SessionError, SessionResult};
pub use crate::model_selection::{CatalogError, ModelCatalog, ModelInfo, ModelSelectionResolver};
pub use crate::snapshot::{Ordinal, TranscriptEntry, TranscriptSnapshot, UnsavedMessage};
pub use crate::stream_processor::{ProtocolViolation, StreamChunkProcessor, TurnStatus};
pub use crate::usage::UsageAggregator;
