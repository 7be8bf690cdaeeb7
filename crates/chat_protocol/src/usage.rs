use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource usage attributed to one message (or a rollup of messages).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

impl ThreadUsage {
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_duration_ms(mut self, total_duration_ms: u64) -> Self {
        self.total_duration_ms = total_duration_ms;
        self
    }

    #[must_use]
    pub fn with_cost_usd(mut self, total_cost_usd: f64) -> Self {
        self.total_cost_usd = sanitize_cost(total_cost_usd);
        self
    }

    /// Field-wise maximum of two observations of the same turn.
    #[must_use]
    pub fn max_merge(&self, other: &Self) -> Self {
        Self {
            input_tokens: self.input_tokens.max(other.input_tokens),
            output_tokens: self.output_tokens.max(other.output_tokens),
            total_duration_ms: self.total_duration_ms.max(other.total_duration_ms),
            total_cost_usd: match (self.total_cost_usd, other.total_cost_usd) {
                (Some(left), Some(right)) => Some(left.max(right)),
                (left, right) => left.or(right),
            },
        }
    }

    /// Sum of two usages, as used for thread rollups.
    #[must_use]
    pub fn saturating_add(&self, other: &Self) -> Self {
        Self {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
            total_duration_ms: self
                .total_duration_ms
                .saturating_add(other.total_duration_ms),
            total_cost_usd: match (self.total_cost_usd, other.total_cost_usd) {
                (Some(left), Some(right)) => Some(left + right),
                (left, right) => left.or(right),
            },
        }
    }

    /// Extracts usage from message metadata of the shape
    /// `{"usage": {"inputTokens": .., "outputTokens": .., "totalCostUsd": ..}}`.
    #[must_use]
    pub fn from_metadata(metadata: &Value) -> Option<Self> {
        let usage = metadata.get("usage")?.as_object()?;
        let count = |key: &str| usage.get(key).and_then(Value::as_u64);

        let input_tokens = count("inputTokens");
        let output_tokens = count("outputTokens");
        let total_duration_ms = count("totalDurationMs");
        let total_cost_usd = usage
            .get("totalCostUsd")
            .and_then(Value::as_f64)
            .and_then(sanitize_cost);

        if input_tokens.is_none()
            && output_tokens.is_none()
            && total_duration_ms.is_none()
            && total_cost_usd.is_none()
        {
            return None;
        }

        Some(Self {
            input_tokens: input_tokens.unwrap_or(0),
            output_tokens: output_tokens.unwrap_or(0),
            total_duration_ms: total_duration_ms.unwrap_or(0),
            total_cost_usd,
        })
    }
}

fn sanitize_cost(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value.max(0.0))
    } else {
        None
    }
}
