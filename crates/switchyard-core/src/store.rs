use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// The two sides of a successful replace.
#[derive(Debug)]
pub struct Swapped<V> {
    /// Snapshot that was replaced.
    pub previous: Arc<V>,
    /// Snapshot now stored.
    pub current: Arc<V>,
}

/// Concurrent map of immutable snapshots.
///
/// Records are never mutated in place: every change installs a new `Arc<V>`
/// under the write lock, so readers always see a whole record and writers
/// cannot lose each other's updates. The lock is synchronous and must never
/// be held across an `.await`; all closures passed in run while it is held.
#[derive(Debug)]
pub struct SnapshotMap<K, V> {
    inner: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> SnapshotMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Current snapshot for `key`.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.read().get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// All keys.
    pub fn keys(&self) -> Vec<K> {
        self.inner.read().keys().cloned().collect()
    }

    /// All current snapshots.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.inner.read().values().cloned().collect()
    }

    /// Snapshots matching a predicate.
    pub fn filter<F>(&self, mut predicate: F) -> Vec<Arc<V>>
    where
        F: FnMut(&V) -> bool,
    {
        self.inner
            .read()
            .values()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    /// Install `value`, returning the snapshot it replaced.
    pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        self.inner.write().insert(key, Arc::new(value))
    }

    /// Install `value` only if `key` is absent; returns the existing snapshot otherwise.
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<Arc<V>, Arc<V>> {
        let mut map = self.inner.write();
        if let Some(existing) = map.get(&key) {
            return Err(existing.clone());
        }
        let value = Arc::new(value);
        map.insert(key, value.clone());
        Ok(value)
    }

    /// Remove and return the snapshot for `key`.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.inner.write().remove(key)
    }

    /// Replace the record only if it is still exactly `expected`.
    ///
    /// On success returns the replaced snapshot; on a lost race returns the
    /// snapshot currently stored (`None` if the key was removed).
    pub fn compare_and_swap(
        &self,
        key: &K,
        expected: &Arc<V>,
        new: V,
    ) -> Result<Arc<V>, Option<Arc<V>>> {
        let mut map = self.inner.write();
        match map.get(key) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                let previous = current.clone();
                map.insert(key.clone(), Arc::new(new));
                Ok(previous)
            }
            other => Err(other.cloned()),
        }
    }

    /// Atomically derive a new snapshot from the current one.
    ///
    /// Returns `None` when `key` is absent. When `f` returns an error the
    /// record is left untouched.
    pub fn update<E, F>(&self, key: &K, f: F) -> Option<Result<Swapped<V>, E>>
    where
        F: FnOnce(&V) -> Result<V, E>,
    {
        let mut map = self.inner.write();
        let previous = map.get(key)?.clone();
        Some(f(&previous).map(|next| {
            let current = Arc::new(next);
            map.insert(key.clone(), current.clone());
            Swapped { previous, current }
        }))
    }

    /// Remove every record for which `keep` returns false; returns what was removed.
    pub fn retain<F>(&self, mut keep: F) -> Vec<(K, Arc<V>)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut map = self.inner.write();
        let doomed: Vec<K> = map
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| map.remove(&k).map(|v| (k, v)))
            .collect()
    }
}

impl<K, V> Default for SnapshotMap<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
