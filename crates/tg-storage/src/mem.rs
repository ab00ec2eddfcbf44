use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use tg_types::{Key, ShardId, TgError, Value};

use crate::traits::KvStore;

/// In-memory `KvStore` backed by a `BTreeMap`.
///
/// Intended for tests and single-process clusters; not persisted across
/// restarts.
pub struct MemStore {
    inner: Arc<RwLock<BTreeMap<(ShardId, Key), Value>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore { inner: Arc::new(RwLock::new(BTreeMap::new())) }
    }

    /// Number of committed keys held for `shard_id`.
    #[cfg(test)]
    pub(crate) async fn len(&self, shard_id: ShardId) -> usize {
        self.inner
            .read()
            .await
            .range((shard_id, Key::default())..)
            .take_while(|((s, _), _)| *s == shard_id)
            .count()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemStore {
    async fn get(&self, shard_id: ShardId, key: &Key) -> Result<Option<Value>, TgError> {
        Ok(self.inner.read().await.get(&(shard_id, key.clone())).cloned())
    }

    async fn apply(&self, shard_id: ShardId, writes: Vec<(Key, Value)>) -> Result<(), TgError> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut g = self.inner.write().await;
        for (key, value) in writes {
            g.insert((shard_id, key), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get_latest() {
        let store = MemStore::new();
        let k = Key::from("k");

        assert!(store.get(0, &k).await.unwrap().is_none());

        store.apply(0, vec![(k.clone(), b"v1".to_vec())]).await.unwrap();
        store.apply(0, vec![(k.clone(), b"v2".to_vec())]).await.unwrap();

        assert_eq!(store.get(0, &k).await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn shards_are_isolated() {
        let store = MemStore::new();
        let k = Key::from("shared-name");

        store.apply(1, vec![(k.clone(), b"one".to_vec())]).await.unwrap();

        assert!(store.get(0, &k).await.unwrap().is_none());
        assert!(store.get(2, &k).await.unwrap().is_none());
        assert_eq!(store.len(1).await, 1);
        assert_eq!(store.len(0).await, 0);
    }

    #[tokio::test]
    async fn batch_applies_every_write() {
        let store = MemStore::new();
        let writes = (0u8..5)
            .map(|i| (Key::new(vec![i]), vec![i; 3]))
            .collect::<Vec<_>>();

        store.apply(3, writes).await.unwrap();

        assert_eq!(store.len(3).await, 5);
        for i in 0u8..5 {
            assert_eq!(store.get(3, &Key::new(vec![i])).await.unwrap().unwrap(), vec![i; 3]);
        }
    }

    #[tokio::test]
    async fn shared_handle_sees_same_data() {
        let store = Arc::new(MemStore::new());
        let other = store.clone();

        store.apply(0, vec![(Key::from("a"), b"1".to_vec())]).await.unwrap();
        assert_eq!(other.get(0, &Key::from("a")).await.unwrap().unwrap(), b"1");
    }
}
