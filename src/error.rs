//! Gateway error taxonomy.
//!
//! Route misses are deliberately not part of this enum: resolving an unknown
//! model name returns `None` and leaves retry/fallback policy to the caller.

/// Errors raised by the routing and adaptation core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A provider configuration record failed validation. During bulk loading
    /// this is logged and the offending entry skipped; it never aborts the
    /// remaining entries.
    #[error("Invalid provider config for '{name}': {reason}")]
    InvalidProviderConfig { name: String, reason: String },

    /// Key selection or count query against a name that is not registered.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// A provider's key selector holds zero keys. Registration rejects empty
    /// key lists, so hitting this indicates a config invariant violation.
    #[error("No API keys available for provider: {0}")]
    NoKeysAvailable(String),

    /// Request or response transformation failed.
    #[error("Transform error: {0}")]
    Transform(String),

    /// The upstream stream misbehaved (malformed SSE, loop detection).
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_display() {
        let err = GatewayError::UnknownProvider("nope".into());
        assert_eq!(err.to_string(), "Unknown provider: nope");
    }

    #[test]
    fn test_invalid_config_display() {
        let err = GatewayError::InvalidProviderConfig {
            name: "p1".into(),
            reason: "api_key must not be empty".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid provider config for 'p1': api_key must not be empty"
        );
    }

    #[test]
    fn test_no_keys_display() {
        let err = GatewayError::NoKeysAvailable("p1".into());
        assert_eq!(err.to_string(), "No API keys available for provider: p1");
    }
}
