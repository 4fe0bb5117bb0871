//! Snapshot store configuration.

use std::num::NonZeroUsize;

use serde::Deserialize;

/// Default store name, used when sessions share the domain-wide cache.
pub const DEFAULT_STORE_NAME: &str = "shared";

/// Configuration of a [`SnapshotStore`](crate::SnapshotStore).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotStoreConfig {
    /// Name used in log output.
    pub name: String,
    /// Maximum number of cached rows; `None` means unbounded.
    pub max_size: Option<NonZeroUsize>,
}

impl SnapshotStoreConfig {
    /// Store evicting least-recently-used rows beyond `max_size`.
    ///
    /// A zero size is treated as unbounded.
    pub fn bounded(max_size: usize) -> Self {
        Self {
            max_size: NonZeroUsize::new(max_size),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_STORE_NAME.to_string(),
            max_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unbounded() {
        let config = SnapshotStoreConfig::default();
        assert_eq!(config.max_size, None);
        assert_eq!(config.name, DEFAULT_STORE_NAME);
    }

    #[test]
    fn test_load_from_json() {
        let config: SnapshotStoreConfig =
            serde_json::from_str(r#"{"name": "local", "max_size": 2}"#).unwrap();
        assert_eq!(config, SnapshotStoreConfig::bounded(2).name("local"));

        let config: SnapshotStoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SnapshotStoreConfig::default());
    }
}
