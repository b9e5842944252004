//! LRU + TTL cache for hybrid search results.
//!
//! Keyed by the full scope of a search; cleared wholesale whenever a
//! learning is created or updated, so cached arrays are never stale with
//! respect to writes.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;

/// Cache TTL (5 minutes).
pub const CACHE_TTL: Duration = Duration::from_secs(300);
/// Cache capacity (entries).
pub const CACHE_CAPACITY: usize = 100;

/// The full identity of a search: same key ⇒ same result array within TTL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query: String,
    pub limit: usize,
    pub agent_id: Option<i64>,
    pub shared: bool,
    pub project_path: Option<String>,
}

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

pub struct RecallCache<T> {
    inner: Mutex<LruCache<CacheKey, Entry<T>>>,
    ttl: Duration,
}

impl<T: Clone> RecallCache<T> {
    pub fn new() -> Self {
        Self::with_settings(CACHE_CAPACITY, CACHE_TTL)
    }

    pub fn with_settings(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<T> {
        let mut cache = self.inner.lock().await;
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: CacheKey, value: T) {
        let mut cache = self.inner.lock().await;
        cache.put(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop everything (called on learning create/update).
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl<T: Clone> Default for RecallCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(query: &str) -> CacheKey {
        CacheKey {
            query: query.into(),
            limit: 5,
            agent_id: None,
            shared: true,
            project_path: None,
        }
    }

    #[tokio::test]
    async fn hit_within_ttl() {
        let cache: RecallCache<Vec<i64>> = RecallCache::new();
        cache.put(key("q"), vec![1, 2, 3]).await;
        assert_eq!(cache.get(&key("q")).await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let cache: RecallCache<Vec<i64>> =
            RecallCache::with_settings(10, Duration::from_millis(10));
        cache.put(key("q"), vec![1]).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(&key("q")).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn scope_is_part_of_the_key() {
        let cache: RecallCache<Vec<i64>> = RecallCache::new();
        cache.put(key("q"), vec![1]).await;

        let mut scoped = key("q");
        scoped.agent_id = Some(2);
        assert_eq!(cache.get(&scoped).await, None);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let cache: RecallCache<Vec<i64>> = RecallCache::new();
        cache.put(key("a"), vec![1]).await;
        cache.put(key("b"), vec![2]).await;
        cache.clear().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn lru_evicts_oldest() {
        let cache: RecallCache<Vec<i64>> =
            RecallCache::with_settings(2, Duration::from_secs(60));
        cache.put(key("a"), vec![1]).await;
        cache.put(key("b"), vec![2]).await;
        cache.put(key("c"), vec![3]).await;
        assert_eq!(cache.get(&key("a")).await, None);
        assert!(cache.get(&key("c")).await.is_some());
    }
}
