//! Per-key mutual exclusion
//!
//! Contention is scoped to the single entity being mutated: each key gets its
//! own async mutex, and there is no lock spanning keys once the entry is found.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of async mutexes keyed by entity id, each guarding a value of type `V`
pub struct KeyedMutex<K, V = ()> {
    entries: Mutex<HashMap<K, Arc<AsyncMutex<V>>>>,
}

impl<K, V> KeyedMutex<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<V>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(V::default())))
            .clone()
    }

    /// Waits for exclusive access to the value stored under `key`
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<V> {
        self.entry(key).lock_owned().await
    }

    /// Returns `None` while another task holds `key`
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<V>> {
        self.entry(key).try_lock_owned().ok()
    }

    /// Forgets `key`; outstanding guards stay valid
    pub fn remove(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Drops entries nobody is holding or waiting on. Only meaningful when the
    /// guarded value carries no state worth keeping.
    pub fn prune_idle(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for KeyedMutex<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks: Arc<KeyedMutex<&'static str, Vec<u32>>> = Arc::new(KeyedMutex::new());

        let first = locks.lock(&"tunnel").await;
        assert!(locks.try_lock(&"tunnel").is_none());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let mut guard = locks.lock(&"tunnel").await;
                guard.push(2);
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);
        waiter.await.unwrap();

        let guard = locks.lock(&"tunnel").await;
        assert_eq!(*guard, vec![2]);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks: KeyedMutex<u32> = KeyedMutex::new();
        let _a = locks.lock(&1).await;
        assert!(locks.try_lock(&2).is_some());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_entries() {
        let locks: KeyedMutex<u32> = KeyedMutex::new();
        let held = locks.lock(&1).await;
        drop(locks.lock(&2).await);
        assert_eq!(locks.len(), 2);

        assert_eq!(locks.prune_idle(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune_idle(), 1);
        assert!(locks.is_empty());
    }
}
