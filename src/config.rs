//! Provider configuration records.
//!
//! These are the records an external configuration service hands to the
//! registry, one per backend provider. Loading, persistence, and validation
//! tooling live outside this crate; the shapes here only define the boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Key rotation strategy
// ---------------------------------------------------------------------------

/// Strategy used by a provider's key selector to pick a credential for each
/// outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// Cycle through keys in order, one per call.
    #[default]
    RoundRobin,
    /// Pick a uniformly random key per call.
    Random,
    /// Stick with the current key until it fails, then move to the next.
    Failover,
}

// ---------------------------------------------------------------------------
// Transformer chain specs
// ---------------------------------------------------------------------------

/// One unresolved step of a transformer chain.
///
/// Deserializes from either a bare adapter name (`"gemini"`) or a two-element
/// `["name", { ... }]` pair carrying per-instance configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformerSpec {
    Named(String),
    NamedWithConfig(String, serde_json::Value),
}

impl TransformerSpec {
    /// The adapter name this spec refers to.
    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) | Self::NamedWithConfig(name, _) => name,
        }
    }

    /// The per-instance configuration, if any.
    pub fn config(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Named(_) => None,
            Self::NamedWithConfig(_, config) => Some(config),
        }
    }
}

/// The `transformer` section of a provider record.
///
/// The `use` key holds the provider-wide chain; any other key names one of the
/// provider's models and holds an override chain for that model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformerSetting {
    #[serde(default, rename = "use")]
    pub provider_chain: Vec<TransformerSpec>,
    #[serde(default, flatten)]
    pub model_chains: HashMap<String, Vec<TransformerSpec>>,
}

// ---------------------------------------------------------------------------
// Provider record
// ---------------------------------------------------------------------------

/// A single API key or an ordered pool of them.
///
/// An array of one behaves identically to a bare string; rotation strategies
/// only matter once the pool holds two or more keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiKeys {
    Single(String),
    Pool(Vec<String>),
}

impl ApiKeys {
    /// Flatten to an ordered key list.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Single(key) => vec![key.clone()],
            Self::Pool(keys) => keys.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(key) => key.is_empty(),
            Self::Pool(keys) => keys.is_empty(),
        }
    }
}

/// One provider record as consumed from the external configuration service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name; also the prefix of qualified model names.
    pub name: String,
    /// Base URL of the provider's API.
    pub api_base_url: String,
    /// Credential pool, in rotation order.
    pub api_key: ApiKeys,
    /// Rotation strategy for the credential pool.
    #[serde(default)]
    pub api_key_strategy: KeyStrategy,
    /// Model names this provider serves, in listing order.
    #[serde(default)]
    pub models: Vec<String>,
    /// Transformer chain configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<TransformerSetting>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_single_key() {
        let cfg: ProviderConfig = serde_json::from_value(json!({
            "name": "gemini",
            "api_base_url": "https://generativelanguage.googleapis.com/v1beta/models",
            "api_key": "sk-one",
            "models": ["gemini-2.5-flash"]
        }))
        .expect("config");
        assert_eq!(cfg.api_key.to_vec(), vec!["sk-one".to_string()]);
        assert_eq!(cfg.api_key_strategy, KeyStrategy::RoundRobin);
    }

    #[test]
    fn test_deserialize_key_pool_and_strategy() {
        let cfg: ProviderConfig = serde_json::from_value(json!({
            "name": "p1",
            "api_base_url": "https://api.example.com",
            "api_key": ["a", "b", "c"],
            "api_key_strategy": "failover"
        }))
        .expect("config");
        assert_eq!(cfg.api_key.to_vec().len(), 3);
        assert_eq!(cfg.api_key_strategy, KeyStrategy::Failover);
        assert!(cfg.models.is_empty());
    }

    #[test]
    fn test_deserialize_transformer_section() {
        let cfg: ProviderConfig = serde_json::from_value(json!({
            "name": "gemini",
            "api_base_url": "https://example.com",
            "api_key": "k",
            "transformer": {
                "use": ["gemini", ["maxtoken", {"max_tokens": 8192}]],
                "gemini-2.5-pro": ["gemini"]
            }
        }))
        .expect("config");

        let transformer = cfg.transformer.expect("transformer section");
        assert_eq!(transformer.provider_chain.len(), 2);
        assert_eq!(transformer.provider_chain[0], TransformerSpec::Named("gemini".into()));
        assert_eq!(transformer.provider_chain[1].name(), "maxtoken");
        assert_eq!(
            transformer.provider_chain[1].config(),
            Some(&json!({"max_tokens": 8192}))
        );
        assert_eq!(
            transformer.model_chains.get("gemini-2.5-pro").map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn test_strategy_kebab_case_names() {
        assert_eq!(
            serde_json::from_value::<KeyStrategy>(json!("round-robin")).expect("strategy"),
            KeyStrategy::RoundRobin
        );
        assert_eq!(
            serde_json::from_value::<KeyStrategy>(json!("random")).expect("strategy"),
            KeyStrategy::Random
        );
    }
}
