//! Session configuration.

use serde::Deserialize;

/// Behavior switches of a [`DataContext`](crate::DataContext).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Keep the reverse side of bidirectional relationships in sync when one
    /// side is changed.
    pub validate_arc_consistency: bool,
    /// Treat every query as a refreshing one: fetched rows also become the
    /// lock baseline of registered MODIFIED objects. Rows are merged into
    /// registered objects either way.
    pub refresh_on_query: bool,
    /// Share the domain's snapshot store; when false the context gets a
    /// private store and sees no changes committed by other contexts.
    pub use_shared_cache: bool,
    /// Entries kept by a context's query result cache, and by the domain's
    /// shared one; zero turns caching off.
    pub query_cache_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            validate_arc_consistency: true,
            refresh_on_query: false,
            use_shared_cache: true,
            query_cache_size: 100,
        }
    }
}

impl ContextConfig {
    /// Configuration of a context with its own snapshot store.
    pub fn isolated() -> Self {
        Self {
            use_shared_cache: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::default();
        assert!(config.validate_arc_consistency);
        assert!(!config.refresh_on_query);
        assert!(config.use_shared_cache);
        assert_eq!(config.query_cache_size, 100);
        assert!(!ContextConfig::isolated().use_shared_cache);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ContextConfig = serde_json::from_str(r#"{"refresh_on_query": true}"#).unwrap();
        assert!(config.refresh_on_query);
        assert!(config.use_shared_cache);
        assert!(config.validate_arc_consistency);
    }
}
