use std::path::Path;
use std::sync::Arc;

use tg_types::{Key, ShardId, TgError, Value};

use crate::keys::data_key;
use crate::traits::KvStore;

fn fjall_err(e: fjall::Error) -> TgError {
    TgError::Storage(e.to_string())
}

/// `KvStore` backed by fjall.
///
/// Every shard of a node shares the single `data` keyspace, keyed by
/// `shard(8) ++ key_bytes`. Batches commit atomically, so a shard commit
/// is never half applied on disk.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// Committed values: `shard(8) ++ key_bytes` → raw value
    pub data: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, TgError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let data =
            db.keyspace("data", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, data }))
    }

    /// All committed entries for `shard_id`, in key order.
    #[cfg(test)]
    pub(crate) async fn scan_shard(self: &Arc<Self>, shard_id: ShardId) -> Result<Vec<(Key, Value)>, TgError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(Key, Value)>, TgError> {
            use crate::keys::{data_shard_end, data_shard_start, user_key};

            let start = data_shard_start(shard_id).to_vec();
            let end = data_shard_end(shard_id).to_vec();
            store
                .data
                .range(start..end)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let key = user_key(&k)
                            .ok_or_else(|| TgError::Storage("short data key".into()))?;
                        Ok((key, v.to_vec()))
                    })
                })
                .collect()
        })
        .await
        .map_err(|e| TgError::Storage(e.to_string()))?
    }
}

impl KvStore for FjallStore {
    async fn get(&self, shard_id: ShardId, key: &Key) -> Result<Option<Value>, TgError> {
        let data = self.data.clone();
        let raw = data_key(shard_id, key);
        tokio::task::spawn_blocking(move || -> Result<Option<Value>, TgError> {
            Ok(data.get(raw).map_err(fjall_err)?.map(|v| v.to_vec()))
        })
        .await
        .map_err(|e| TgError::Storage(e.to_string()))?
    }

    async fn apply(&self, shard_id: ShardId, writes: Vec<(Key, Value)>) -> Result<(), TgError> {
        if writes.is_empty() {
            return Ok(());
        }
        let db = self.db.clone();
        let data = self.data.clone();
        let count = writes.len();
        tokio::task::spawn_blocking(move || -> Result<(), TgError> {
            let mut batch = db.batch();
            for (key, value) in writes {
                batch.insert(&data, data_key(shard_id, &key), value);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(|e| TgError::Storage(e.to_string()))??;
        tracing::trace!(shard_id, count, "applied committed writes");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
