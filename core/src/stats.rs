use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Concurrent crawl statistics.
///
/// Numeric counters and string values live in separate maps. Every method takes
/// `&self` so a single `Arc<Stats>` can be updated from many tasks at once.
#[derive(Debug, Default)]
pub struct Stats {
    counters: DashMap<String, u64>,
    values: DashMap<String, String>,
}

/// Point-in-time copy of [`Stats`], sorted by key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub values: BTreeMap<String, String>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one
    pub fn inc(&self, key: &str) {
        self.inc_by(key, 1);
    }

    /// Increment a counter by `n`
    pub fn inc_by(&self, key: &str, n: u64) {
        *self.counters.entry(key.to_string()).or_insert(0) += n;
    }

    /// Current value of a counter, zero if unset
    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Overwrite a counter
    pub fn set(&self, key: &str, value: u64) {
        self.counters.insert(key.to_string(), value);
    }

    /// Keep the larger of the stored value and `value`
    pub fn max(&self, key: &str, value: u64) {
        self.counters
            .entry(key.to_string())
            .and_modify(|v| *v = (*v).max(value))
            .or_insert(value);
    }

    /// Keep the smaller of the stored value and `value`
    pub fn min(&self, key: &str, value: u64) {
        self.counters
            .entry(key.to_string())
            .and_modify(|v| *v = (*v).min(value))
            .or_insert(value);
    }

    pub fn set_str(&self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    /// Remove a key from both maps
    pub fn del(&self, key: &str) {
        self.counters.remove(key);
        self.values.remove(key);
    }

    pub fn clear(&self) {
        self.counters.clear();
        self.values.clear();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            values: self
                .values
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_inc_and_get() {
        let stats = Stats::new();
        assert_eq!(stats.get("dupefilter/filtered"), 0);
        stats.inc("dupefilter/filtered");
        stats.inc("dupefilter/filtered");
        stats.inc_by("dupefilter/filtered", 3);
        assert_eq!(stats.get("dupefilter/filtered"), 5);
    }

    #[test]
    fn test_max_min() {
        let stats = Stats::new();
        stats.max("depth", 3);
        stats.max("depth", 1);
        stats.min("latency_ms", 40);
        stats.min("latency_ms", 90);
        assert_eq!(stats.get("depth"), 3);
        assert_eq!(stats.get("latency_ms"), 40);
    }

    #[test]
    fn test_strings_and_del() {
        let stats = Stats::new();
        stats.set_str("start_time", "2024-01-01T00:00:00Z");
        stats.set("count", 7);
        assert_eq!(stats.get_str("start_time").as_deref(), Some("2024-01-01T00:00:00Z"));
        stats.del("start_time");
        assert_eq!(stats.get_str("start_time"), None);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.counters.get("count"), Some(&7));
        stats.clear();
        assert_eq!(stats.get("count"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let stats = Arc::new(Stats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    stats.inc("fetcher/request_count");
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(stats.get("fetcher/request_count"), 800);
    }
}
