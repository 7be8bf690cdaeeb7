//! Model catalog lookup and layered model-selection resolution.
//!
//! Precedence, highest first: the per-turn request, the thread's stored
//! default, the catalog's process-wide default. A level naming a model the
//! catalog does not know is skipped. The chosen model's catalog entry then
//! decides the provider, validates the reasoning budget (remapping
//! unsupported budgets to the model default) and the runtime provider.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chat_protocol::{ModelSelection, SelectionRequest};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("model catalog must contain at least one model")]
    Empty,

    #[error("failed to read model catalog at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("model '{model_id}' is invalid: {reason}")]
    InvalidModel { model_id: String, reason: String },

    #[error("model '{0}' appears more than once")]
    DuplicateModel(String),

    #[error("default selection is invalid: {0}")]
    InvalidDefault(String),
}

/// Static metadata for one selectable model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub reasoning_budgets: Vec<String>,
    pub default_reasoning_budget: String,
    /// Runtimes able to serve the model; the first one is the default.
    /// Defaults to `[provider_id]` when omitted.
    #[serde(default)]
    pub runtime_providers: Vec<String>,
}

impl ModelInfo {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        provider_id: impl Into<String>,
        reasoning_budgets: &[&str],
        default_reasoning_budget: impl Into<String>,
    ) -> Self {
        let provider_id = provider_id.into();
        Self {
            id: id.into(),
            runtime_providers: vec![provider_id.clone()],
            provider_id,
            display_name: None,
            reasoning_budgets: reasoning_budgets.iter().map(|value| value.to_string()).collect(),
            default_reasoning_budget: default_reasoning_budget.into(),
        }
    }

    #[must_use]
    pub fn with_runtime_providers(mut self, runtime_providers: &[&str]) -> Self {
        self.runtime_providers = runtime_providers
            .iter()
            .map(|value| value.to_string())
            .collect();
        self
    }

    #[must_use]
    pub fn supports_budget(&self, budget: &str) -> bool {
        self.reasoning_budgets.iter().any(|known| known == budget)
    }

    #[must_use]
    pub fn supports_runtime_provider(&self, runtime_provider: &str) -> bool {
        self.runtime_providers
            .iter()
            .any(|known| known == runtime_provider)
    }

    #[must_use]
    pub fn default_runtime_provider(&self) -> &str {
        self.runtime_providers
            .first()
            .map(String::as_str)
            .unwrap_or(&self.provider_id)
    }

    /// The selection this model resolves to with no other preferences.
    #[must_use]
    pub fn default_selection(&self) -> ModelSelection {
        ModelSelection::new(
            self.id.clone(),
            self.provider_id.clone(),
            self.default_reasoning_budget.clone(),
            self.default_runtime_provider(),
        )
    }

    fn validate(&mut self) -> Result<(), CatalogError> {
        let invalid = |reason: &str| CatalogError::InvalidModel {
            model_id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.provider_id.trim().is_empty() {
            return Err(invalid("providerId must not be empty"));
        }
        if self.reasoning_budgets.is_empty()
            || self.reasoning_budgets.iter().any(|budget| budget.trim().is_empty())
        {
            return Err(invalid("reasoningBudgets must be a non-empty list of names"));
        }
        if !self.supports_budget(&self.default_reasoning_budget) {
            return Err(invalid("defaultReasoningBudget must be one of reasoningBudgets"));
        }
        if self
            .runtime_providers
            .iter()
            .any(|provider| provider.trim().is_empty())
        {
            return Err(invalid("runtimeProviders must not contain empty names"));
        }
        if self.runtime_providers.is_empty() {
            self.runtime_providers.push(self.provider_id.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CatalogFile {
    models: Vec<ModelInfo>,
    #[serde(default)]
    default_selection: Option<Value>,
}

/// Immutable lookup table of models plus the process-wide default selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    models: Vec<ModelInfo>,
    default_selection: ModelSelection,
}

impl ModelCatalog {
    /// Builds a validated catalog. Without an explicit default the first
    /// model's default selection is used.
    pub fn new(
        models: Vec<ModelInfo>,
        default_selection: Option<ModelSelection>,
    ) -> Result<Self, CatalogError> {
        if models.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        let mut validated = Vec::with_capacity(models.len());
        for mut model in models {
            model.validate()?;
            if !seen.insert(model.id.clone()) {
                return Err(CatalogError::DuplicateModel(model.id));
            }
            validated.push(model);
        }

        let default_selection = match default_selection {
            None => validated[0].default_selection(),
            Some(selection) => {
                let model = validated
                    .iter()
                    .find(|model| model.id == selection.model_id)
                    .ok_or_else(|| {
                        CatalogError::InvalidDefault(format!(
                            "model '{}' is not in the catalog",
                            selection.model_id
                        ))
                    })?;
                if !selection.is_complete() {
                    return Err(CatalogError::InvalidDefault(
                        "all four fields are required".to_string(),
                    ));
                }
                if selection.provider_id != model.provider_id
                    || !model.supports_budget(&selection.reasoning_budget)
                    || !model.supports_runtime_provider(&selection.runtime_provider)
                {
                    return Err(CatalogError::InvalidDefault(format!(
                        "selection does not match catalog entry for '{}'",
                        model.id
                    )));
                }
                selection
            }
        };

        Ok(Self {
            models: validated,
            default_selection,
        })
    }

    /// Parses the JSON catalog format:
    /// `{"models": [ModelInfo..], "defaultSelection": {..}?}`.
    pub fn from_json(input: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(input)?;
        let default_selection = match file.default_selection {
            None => None,
            Some(value) => Some(ModelSelection::parse(&value).ok_or_else(|| {
                CatalogError::InvalidDefault("defaultSelection is missing required fields".into())
            })?),
        };
        Self::new(file.models, default_selection)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let input = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&input)
    }

    #[must_use]
    pub fn model(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|model| model.id == model_id)
    }

    #[must_use]
    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    #[must_use]
    pub fn default_selection(&self) -> &ModelSelection {
        &self.default_selection
    }
}

/// Pure resolution of the effective selection for one turn.
#[derive(Debug, Clone)]
pub struct ModelSelectionResolver {
    catalog: ModelCatalog,
}

impl ModelSelectionResolver {
    #[must_use]
    pub fn new(catalog: ModelCatalog) -> Self {
        Self { catalog }
    }

    #[must_use]
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Resolves the effective selection. Never fails: unknown models fall
    /// through to lower precedence levels and unsupported budgets or runtime
    /// providers are remapped to the chosen model's defaults.
    #[must_use]
    pub fn resolve(
        &self,
        explicit: Option<&SelectionRequest>,
        thread_default: Option<&ModelSelection>,
    ) -> ModelSelection {
        let levels: Vec<SelectionRequest> = [
            explicit.cloned(),
            thread_default.map(SelectionRequest::from),
            Some(SelectionRequest::from(self.catalog.default_selection())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let model = levels
            .iter()
            .filter_map(|level| level.model_id())
            .find_map(|model_id| {
                let found = self.catalog.model(model_id);
                if found.is_none() {
                    debug!(%model_id, "requested model is not in the catalog; falling back");
                }
                found
            })
            .unwrap_or(&self.catalog.models[0]);

        let budget = levels
            .iter()
            .find_map(|level| level.reasoning_budget())
            .filter(|budget| model.supports_budget(budget))
            .unwrap_or(model.default_reasoning_budget.as_str())
            .to_string();

        let runtime_provider = levels
            .iter()
            .find_map(|level| level.runtime_provider())
            .filter(|provider| model.supports_runtime_provider(provider))
            .unwrap_or_else(|| model.default_runtime_provider())
            .to_string();

        ModelSelection::new(
            model.id.clone(),
            model.provider_id.clone(),
            budget,
            runtime_provider,
        )
    }

    /// Loosely-typed parse; `None` when any field is missing or blank.
    #[must_use]
    pub fn parse(value: &Value) -> Option<ModelSelection> {
        ModelSelection::parse(value)
    }
}
