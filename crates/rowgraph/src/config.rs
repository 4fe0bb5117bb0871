//! Domain configuration loaded from JSON.

use serde::Deserialize;

use rowgraph_cache::SnapshotStoreConfig;
use rowgraph_core::Result;
use rowgraph_session::{ContextConfig, DataDomain};

/// Settings of a [`DataDomain`]: its shared snapshot store and the default
/// configuration of the contexts it creates.
///
/// ```json
/// { "cache": { "max_size": 10000 }, "context": { "refresh_on_query": true } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub cache: SnapshotStoreConfig,
    pub context: ContextConfig,
}

impl DomainConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        tracing::debug!(
            cache = %config.cache.name,
            max_size = ?config.cache.max_size,
            shared = config.context.use_shared_cache,
            "Loaded domain configuration"
        );
        Ok(config)
    }

    /// Apply to `domain`, replacing its snapshot store.
    pub fn apply(self, domain: DataDomain) -> DataDomain {
        domain
            .with_cache_config(self.cache)
            .with_context_config(self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::Error;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config = DomainConfig::from_json("{}").unwrap();
        assert_eq!(config, DomainConfig::default());
    }

    #[test]
    fn test_nested_sections() {
        let config = DomainConfig::from_json(
            r#"{"cache": {"name": "gallery", "max_size": 2}, "context": {"use_shared_cache": false}}"#,
        )
        .unwrap();
        assert_eq!(config.cache.name, "gallery");
        assert_eq!(config.cache.max_size.map(|n| n.get()), Some(2));
        assert!(!config.context.use_shared_cache);
        assert!(config.context.validate_arc_consistency);
    }

    #[test]
    fn test_malformed_json_is_a_serde_error() {
        let err = DomainConfig::from_json("{\"cache\": 3}").unwrap_err();
        assert!(matches!(err, Error::Serde(_)));
    }
}
