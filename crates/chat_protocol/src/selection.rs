use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resolved model choice in effect for a thread or a single turn.
///
/// All four fields are non-empty once resolved. [`ModelSelection::empty`] is a
/// placeholder for uninitialized state and must never be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    pub model_id: String,
    pub provider_id: String,
    pub reasoning_budget: String,
    pub runtime_provider: String,
}

impl ModelSelection {
    #[must_use]
    pub fn new(
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
        reasoning_budget: impl Into<String>,
        runtime_provider: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider_id: provider_id.into(),
            reasoning_budget: reasoning_budget.into(),
            runtime_provider: runtime_provider.into(),
        }
    }

    /// Uninitialized placeholder selection.
    #[must_use]
    pub fn empty() -> Self {
        Self::new("", "", "", "")
    }

    /// Returns true when every field carries a non-blank value.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        [
            &self.model_id,
            &self.provider_id,
            &self.reasoning_budget,
            &self.runtime_provider,
        ]
        .iter()
        .all(|value| !value.trim().is_empty())
    }

    /// Parses a loosely-typed selection object.
    ///
    /// Returns `None` when any required field is missing, blank, or not a
    /// string. Nothing is guessed or defaulted.
    #[must_use]
    pub fn parse(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let field = |key: &str| -> Option<String> {
            object
                .get(key)?
                .as_str()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };

        Some(Self {
            model_id: field("modelId")?,
            provider_id: field("providerId")?,
            reasoning_budget: field("reasoningBudget")?,
            runtime_provider: field("runtimeProvider")?,
        })
    }
}

/// Partial selection supplied with a single turn.
///
/// Any field may be omitted; the resolver fills gaps from lower-precedence
/// selections and catalog defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_provider: Option<String>,
}

impl SelectionRequest {
    #[must_use]
    pub fn for_model(model_id: impl Into<String>) -> Self {
        Self {
            model_id: Some(model_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_reasoning_budget(mut self, reasoning_budget: impl Into<String>) -> Self {
        self.reasoning_budget = Some(reasoning_budget.into());
        self
    }

    #[must_use]
    pub fn with_runtime_provider(mut self, runtime_provider: impl Into<String>) -> Self {
        self.runtime_provider = Some(runtime_provider.into());
        self
    }

    /// Returns the requested model id when present and non-blank.
    #[must_use]
    pub fn model_id(&self) -> Option<&str> {
        non_blank(self.model_id.as_deref())
    }

    #[must_use]
    pub fn reasoning_budget(&self) -> Option<&str> {
        non_blank(self.reasoning_budget.as_deref())
    }

    #[must_use]
    pub fn runtime_provider(&self) -> Option<&str> {
        non_blank(self.runtime_provider.as_deref())
    }
}

impl From<ModelSelection> for SelectionRequest {
    fn from(selection: ModelSelection) -> Self {
        Self {
            model_id: Some(selection.model_id),
            provider_id: Some(selection.provider_id),
            reasoning_budget: Some(selection.reasoning_budget),
            runtime_provider: Some(selection.runtime_provider),
        }
    }
}

impl From<&ModelSelection> for SelectionRequest {
    fn from(selection: &ModelSelection) -> Self {
        Self::from(selection.clone())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ModelSelection, SelectionRequest};

    #[test]
    fn parse_accepts_complete_selection_objects() {
        let parsed = ModelSelection::parse(&json!({
            "modelId": "claude-y",
            "providerId": "anthropic",
            "reasoningBudget": "high",
            "runtimeProvider": "anthropic",
            "extra": 42,
        }))
        .expect("complete selection should parse");

        assert_eq!(
            parsed,
            ModelSelection::new("claude-y", "anthropic", "high", "anthropic")
        );
    }

    #[test]
    fn parse_rejects_missing_blank_or_non_string_fields() {
        let missing = json!({
            "modelId": "claude-y",
            "providerId": "anthropic",
            "reasoningBudget": "high",
        });
        let blank = json!({
            "modelId": "  ",
            "providerId": "anthropic",
            "reasoningBudget": "high",
            "runtimeProvider": "anthropic",
        });
        let wrong_type = json!({
            "modelId": "claude-y",
            "providerId": "anthropic",
            "reasoningBudget": 3,
            "runtimeProvider": "anthropic",
        });

        assert_eq!(ModelSelection::parse(&missing), None);
        assert_eq!(ModelSelection::parse(&blank), None);
        assert_eq!(ModelSelection::parse(&wrong_type), None);
        assert_eq!(ModelSelection::parse(&json!("claude-y")), None);
    }

    #[test]
    fn empty_placeholder_is_not_complete() {
        assert!(!ModelSelection::empty().is_complete());
        assert!(ModelSelection::new("m", "p", "low", "r").is_complete());
    }

    #[test]
    fn selection_serializes_with_camel_case_keys() {
        let value = serde_json::to_value(ModelSelection::new("m", "p", "low", "r"))
            .expect("selection should serialize");

        assert_eq!(value["modelId"], "m");
        assert_eq!(value["runtimeProvider"], "r");
    }

    #[test]
    fn request_accessors_ignore_blank_values() {
        let request = SelectionRequest::for_model(" ").with_reasoning_budget("low");

        assert_eq!(request.model_id(), None);
        assert_eq!(request.reasoning_budget(), Some("low"));
        assert_eq!(request.runtime_provider(), None);
    }
}
