use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A mutex that allows locking based on a key (e.g., one uploaded file).
/// Writers to different keys never wait on each other.
#[derive(Debug)]
pub struct KeyedMutex<K: Eq + Hash> {
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquires the lock for `key`. Released when the guard is dropped.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard guard is gone before we await
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        mutex.lock_owned().await
    }

    /// Removes locks that are not currently held by any task.
    pub fn cleanup(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Clone for KeyedMutex<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks: KeyedMutex<String> = KeyedMutex::new();
        let guard = locks.lock(&"a".to_string()).await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock(&"a".to_string()).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different key is not blocked
        let _b = locks.lock(&"b".to_string()).await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_locks() {
        let locks: KeyedMutex<u32> = KeyedMutex::new();
        let held = locks.lock(&1).await;
        drop(locks.lock(&2).await);
        locks.cleanup();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.cleanup();
        assert!(locks.is_empty());
    }
}
