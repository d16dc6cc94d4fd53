use serde::{Deserialize, Serialize};

/// A provider/model pair — the unit of routing and circuit-breaker keying.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderModel {
    pub provider: String,
    pub model: String,
}

impl ProviderModel {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse a `"provider/model"` spec as used in route configuration.
    /// The model part may itself contain slashes (e.g. OpenRouter ids).
    pub fn parse_spec(spec: &str) -> Option<Self> {
        let (provider, model) = spec.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }

    /// Circuit-breaker key for this candidate.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

impl std::fmt::Display for ProviderModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec() {
        let pm = ProviderModel::parse_spec("anthropic/claude-sonnet-4").unwrap();
        assert_eq!(pm.provider, "anthropic");
        assert_eq!(pm.model, "claude-sonnet-4");
    }

    #[test]
    fn test_parse_spec_model_with_slash() {
        let pm = ProviderModel::parse_spec("openrouter/meta/llama-3-70b").unwrap();
        assert_eq!(pm.provider, "openrouter");
        assert_eq!(pm.model, "meta/llama-3-70b");
    }

    #[test]
    fn test_parse_spec_rejects_malformed() {
        assert!(ProviderModel::parse_spec("no-slash").is_none());
        assert!(ProviderModel::parse_spec("/model-only").is_none());
        assert!(ProviderModel::parse_spec("provider/").is_none());
        assert!(ProviderModel::parse_spec("").is_none());
    }

    #[test]
    fn test_key_uses_colon() {
        let pm = ProviderModel::new("openai", "gpt-4o-mini");
        assert_eq!(pm.key(), "openai:gpt-4o-mini");
    }

    #[test]
    fn test_display_round_trips_simple_spec() {
        let pm = ProviderModel::parse_spec("google/gemini-2.5-pro").unwrap();
        assert_eq!(pm.to_string(), "google/gemini-2.5-pro");
    }
}
