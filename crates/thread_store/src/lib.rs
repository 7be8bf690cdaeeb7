//! Durable thread/message persistence for thread sessions.
//!
//! [`PersistenceGateway`] is the contract the session runtime writes through.
//! [`MemoryThreadStore`] is an in-process reference store (optionally backed
//! by a JSON file) and [`HttpThreadGateway`] talks to a remote thread API.
//! Both assign ordinals and enforce owner-only access to live threads.

mod error;
mod gateway;
mod http;
mod memory;
mod schema;

pub use error::{GatewayError, GatewayResult};
pub use gateway::{Identity, PersistenceGateway};
pub use http::{HttpGatewayConfig, HttpThreadGateway};
pub use memory::MemoryThreadStore;
pub use schema::{
    CreateThread, EditMessageBody, OkEnvelope, ThreadEnvelope, ThreadListEnvelope,
    UpdateThreadBody, UpsertMessage,
};
