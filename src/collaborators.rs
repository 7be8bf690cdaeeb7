//! Wires the stream source, persistence gateway and model catalog from
//! [`EnvConfig`].
//!
//! Configured URLs select the HTTP collaborators. Without them the session
//! runs fully locally against [`MemoryThreadStore`] and an echo source.

use std::sync::Arc;

use chat_api::{ChatApiClient, ChatApiConfig};
use chat_protocol::StreamSource;
use chat_protocol_mock::EchoStreamSource;
use thread_store::{
    HttpGatewayConfig, HttpThreadGateway, Identity, MemoryThreadStore, PersistenceGateway,
};

use crate::config::EnvConfig;
use crate::controller::ThreadSessionController;
use crate::error::{SessionError, SessionResult};
use crate::model_selection::{ModelCatalog, ModelInfo, ModelSelectionResolver};

pub const LOCAL_MODEL_ID: &str = "echo-1";
pub const LOCAL_PROVIDER_ID: &str = "local";

/// Catalog used when no catalog file is configured.
pub fn builtin_catalog() -> SessionResult<ModelCatalog> {
    Ok(ModelCatalog::new(
        vec![ModelInfo::new(
            LOCAL_MODEL_ID,
            LOCAL_PROVIDER_ID,
            &["low", "medium", "high"],
            "medium",
        )],
        None,
    )?)
}

pub fn catalog_from_config(config: &EnvConfig) -> SessionResult<ModelCatalog> {
    match config.model_catalog.as_deref() {
        Some(path) => Ok(ModelCatalog::load(path)?),
        None => builtin_catalog(),
    }
}

pub fn identity_from_config(config: &EnvConfig) -> Identity {
    let identity = Identity::new(config.user_id.clone());
    match config.access_token.as_deref() {
        Some(token) => identity.with_access_token(token),
        None => identity,
    }
}

pub fn stream_source_from_config(config: &EnvConfig) -> SessionResult<Arc<dyn StreamSource>> {
    let Some(chat_url) = config.chat_url.as_deref() else {
        return Ok(Arc::new(EchoStreamSource::default()));
    };

    let mut api_config = ChatApiConfig::new(chat_url);
    if let Some(token) = config.access_token.as_deref() {
        api_config = api_config.with_access_token(token);
    }
    if let Some(timeout) = config.timeout {
        api_config = api_config.with_timeout(timeout);
    }
    let client = ChatApiClient::new(api_config)
        .map_err(|error| SessionError::InvalidRequest(format!("chat transport: {error}")))?;
    Ok(Arc::new(client))
}

pub fn gateway_from_config(
    config: &EnvConfig,
    catalog: &ModelCatalog,
) -> SessionResult<Arc<dyn PersistenceGateway>> {
    if let Some(store_url) = config.store_url.as_deref() {
        let mut gateway_config = HttpGatewayConfig::new(store_url);
        if let Some(token) = config.access_token.as_deref() {
            gateway_config = gateway_config.with_access_token(token);
        }
        if let Some(timeout) = config.timeout {
            gateway_config = gateway_config.with_timeout(timeout);
        }
        return Ok(Arc::new(HttpThreadGateway::new(gateway_config)?));
    }

    let default_selection = catalog.default_selection().clone();
    match config.store_file.as_deref() {
        Some(path) => Ok(Arc::new(MemoryThreadStore::open(path, default_selection)?)),
        None => Ok(Arc::new(MemoryThreadStore::new(default_selection))),
    }
}

/// Builds a controller from the environment-derived configuration.
pub fn controller_from_config(config: &EnvConfig) -> SessionResult<Arc<ThreadSessionController>> {
    let catalog = catalog_from_config(config)?;
    let gateway = gateway_from_config(config, &catalog)?;
    let source = stream_source_from_config(config)?;

    Ok(ThreadSessionController::new(
        identity_from_config(config),
        gateway,
        source,
        ModelSelectionResolver::new(catalog),
    ))
}
