//! Caching of query results.
//!
//! A context keeps its own cache of object results. The domain keeps a cache
//! of fetched rows shared by all of its contexts, which each context turns
//! into its own objects on a hit. Entries are keyed by the query itself and
//! tagged with cache groups; committing does not touch either cache, stale
//! entries go away through [`remove_cache_group`] or by LRU eviction.
//!
//! [`remove_cache_group`]: crate::DataContext::remove_cache_group

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;

/// Where a query's result may be looked up and stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCacheStrategy {
    /// Always run the query.
    #[default]
    NoCache,
    /// Reuse the result cached in this context.
    LocalCache,
    /// Run the query and replace the result cached in this context.
    LocalCacheRefresh,
    /// Reuse rows cached for the whole domain.
    SharedCache,
    /// Run the query and replace the rows cached for the whole domain.
    SharedCacheRefresh,
}

impl QueryCacheStrategy {
    pub const fn is_local(self) -> bool {
        matches!(self, Self::LocalCache | Self::LocalCacheRefresh)
    }

    pub const fn is_shared(self) -> bool {
        matches!(self, Self::SharedCache | Self::SharedCacheRefresh)
    }

    /// True for the strategies that skip the cache lookup.
    pub const fn is_refresh(self) -> bool {
        matches!(self, Self::LocalCacheRefresh | Self::SharedCacheRefresh)
    }
}

struct Entry<T> {
    value: T,
    groups: Vec<String>,
}

/// Bounded LRU map from query keys to results. A capacity of zero turns the
/// cache off.
pub(crate) struct QueryCache<T> {
    entries: Option<Mutex<LruCache<String, Entry<T>>>>,
}

impl<T> std::fmt::Debug for QueryCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entries {
            Some(entries) => {
                let entries = entries.lock();
                f.debug_struct("QueryCache")
                    .field("len", &entries.len())
                    .field("cap", &entries.cap())
                    .finish()
            }
            None => f.debug_struct("QueryCache").field("disabled", &true).finish(),
        }
    }
}

impl<T: Clone> QueryCache<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|n| Mutex::new(LruCache::new(n))),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<T> {
        let hit = self.entries.as_ref()?.lock().get(key).map(|e| e.value.clone());
        tracing::trace!(key, hit = hit.is_some(), "Query cache lookup");
        hit
    }

    pub(crate) fn put(&self, key: String, value: T, groups: &[String]) {
        if let Some(entries) = &self.entries {
            entries.lock().put(
                key,
                Entry {
                    value,
                    groups: groups.to_vec(),
                },
            );
        }
    }

    /// Drop every entry tagged with `group`; returns how many went.
    pub(crate) fn remove_group(&self, group: &str) -> usize {
        let Some(entries) = &self.entries else {
            return 0;
        };
        let mut entries = entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.groups.iter().any(|g| g == group))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        keys.len()
    }

    pub(crate) fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.lock().len())
    }
}
