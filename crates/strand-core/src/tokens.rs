use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token usage of one generation call, raw from the provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// Counters accumulated across every generation call of a turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

impl UsageStats {
    pub fn accumulate(&mut self, usage: &TokenUsage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cached_input_tokens += usage.cache_read_tokens;
    }
}

/// Payload of the `usage` event: `{"tokenUsage": {"total": {...}}}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    #[serde(default)]
    pub token_usage: TokenUsageBreakdown,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_context_window: Option<u64>,
    /// Engine fields forwarded as received.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageBreakdown {
    #[serde(default)]
    pub total: UsageStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<UsageStats>,
}

impl UsageReport {
    pub fn from_total(total: UsageStats) -> Self {
        Self {
            token_usage: TokenUsageBreakdown { total, last: None },
            model_context_window: None,
            extra: Map::new(),
        }
    }

    /// Parse an engine notification. Fields that do not fit the typed view
    /// are dropped one by one; the rest of the payload is kept.
    pub fn from_params(params: &Value) -> Self {
        if let Ok(report) = serde_json::from_value(params.clone()) {
            return report;
        }
        let mut extra = params.as_object().cloned().unwrap_or_default();
        let token_usage = extra
            .remove("tokenUsage")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let model_context_window = extra.remove("modelContextWindow").and_then(|v| v.as_u64());
        Self { token_usage, model_context_window, extra }
    }
}
