use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Default cap for per-symbol analysis histories
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Thread-safe bounded history keyed by symbol
///
/// Each key holds a rolling window of at most `capacity` entries; pushing onto
/// a full window evicts the oldest entry. Keys live in a sharded map, so
/// writers on different symbols do not contend on a single lock.
#[derive(Debug)]
pub struct SymbolHistory<T> {
    data: Arc<DashMap<String, VecDeque<T>>>,
    capacity: usize,
}

impl<T> Clone for SymbolHistory<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone> SymbolHistory<T> {
    /// Create a new history
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of entries to keep per key (at least 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, trimming the oldest ones past capacity.
    ///
    /// Returns the number of entries now held for the key.
    pub fn push(&self, key: &str, item: T) -> usize {
        let mut entries = self.data.entry(key.to_string()).or_default();

        entries.push_back(item);
        while entries.len() > self.capacity {
            entries.pop_front();
        }

        entries.len()
    }

    /// Most recent entry for a key
    pub fn latest(&self, key: &str) -> Option<T> {
        self.data.get(key).and_then(|entries| entries.back().cloned())
    }

    /// All entries for a key, oldest first
    pub fn all(&self, key: &str) -> Vec<T> {
        self.data
            .get(key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The `n` most recent entries for a key, oldest first
    pub fn recent(&self, key: &str, n: usize) -> Vec<T> {
        self.data
            .get(key)
            .map(|entries| {
                let skip = entries.len().saturating_sub(n);
                entries.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Entries matching a predicate, oldest first
    pub fn filter<F>(&self, key: &str, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.data
            .get(key)
            .map(|entries| entries.iter().filter(|e| predicate(e)).cloned().collect())
            .unwrap_or_default()
    }

    /// Apply `update` to every entry matching `predicate`; returns how many changed
    pub fn update_matching<P, F>(&self, key: &str, predicate: P, mut update: F) -> usize
    where
        P: Fn(&T) -> bool,
        F: FnMut(&mut T),
    {
        let Some(mut entries) = self.data.get_mut(key) else {
            return 0;
        };

        let mut updated = 0;
        for entry in entries.iter_mut().filter(|e| predicate(e)) {
            update(entry);
            updated += 1;
        }
        updated
    }

    pub fn len(&self, key: &str) -> usize {
        self.data.get(key).map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clear(&self, key: &str) {
        self.data.remove(key);
    }

    pub fn clear_all(&self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_history() {
        let history: SymbolHistory<u32> = SymbolHistory::new(100);
        assert_eq!(history.capacity(), 100);
        assert!(history.keys().is_empty());
        assert!(history.latest("BTCUSDT").is_none());
        assert!(history.all("BTCUSDT").is_empty());
    }

    #[test]
    fn test_push_and_latest() {
        let history = SymbolHistory::new(10);
        history.push("BTCUSDT", 1);
        history.push("BTCUSDT", 2);

        assert_eq!(history.len("BTCUSDT"), 2);
        assert_eq!(history.latest("BTCUSDT"), Some(2));
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let history = SymbolHistory::new(100);
        for i in 0..150 {
            history.push("ETHUSDT", i);
        }

        let entries = history.all("ETHUSDT");
        assert_eq!(entries.len(), 100);
        assert_eq!(entries[0], 50);
        assert_eq!(entries[99], 149);
    }

    #[test]
    fn test_recent_returns_oldest_first() {
        let history = SymbolHistory::new(10);
        for i in 0..5 {
            history.push("SOLUSDT", i);
        }

        assert_eq!(history.recent("SOLUSDT", 3), vec![2, 3, 4]);
        assert_eq!(history.recent("SOLUSDT", 50), vec![0, 1, 2, 3, 4]);
        assert!(history.recent("UNKNOWN", 3).is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let history = SymbolHistory::new(2);
        history.push("A", 1);
        history.push("A", 2);
        history.push("A", 3);
        history.push("B", 10);

        assert_eq!(history.all("A"), vec![2, 3]);
        assert_eq!(history.all("B"), vec![10]);

        history.clear("A");
        assert!(history.is_empty("A"));
        assert_eq!(history.len("B"), 1);

        history.clear_all();
        assert!(history.keys().is_empty());
    }

    #[test]
    fn test_clones_share_storage() {
        let history = SymbolHistory::new(5);
        let clone = history.clone();
        clone.push("A", 7);
        assert_eq!(history.latest("A"), Some(7));
    }

    #[test]
    fn test_filter() {
        let history = SymbolHistory::new(10);
        for i in 0..6 {
            history.push("A", i);
        }
        assert_eq!(history.filter("A", |v| v % 2 == 0), vec![0, 2, 4]);
    }

    #[test]
    fn test_update_matching() {
        let history = SymbolHistory::new(10);
        for i in 0..4 {
            history.push("A", i);
        }

        assert_eq!(history.update_matching("A", |v| *v >= 2, |v| *v *= 10), 2);
        assert_eq!(history.all("A"), vec![0, 1, 20, 30]);
        assert_eq!(history.update_matching("B", |_| true, |v| *v += 1), 0);
    }
}
