use std::future::Future;
use std::sync::Arc;

use tg_types::{Key, ShardId, TgError, Value};

/// Committed key-value state behind the runtime locking shards.
///
/// Methods use RPITIT (`-> impl Future + Send`) so generic shards can
/// `.await` them across threads without an `async-trait` dependency.
///
/// Locking, buffering and visibility are the shard's job. A store only
/// ever sees values that have been committed.
pub trait KvStore: Send + Sync + 'static {
    /// Read the committed value of `key` in `shard_id`.
    fn get(&self, shard_id: ShardId, key: &Key)
        -> impl Future<Output = Result<Option<Value>, TgError>> + Send;

    /// Atomically persist a batch of committed writes for `shard_id`.
    /// An empty batch is a no-op.
    fn apply(&self, shard_id: ShardId, writes: Vec<(Key, Value)>)
        -> impl Future<Output = Result<(), TgError>> + Send;
}

/// Lets several shards share one store handle.
impl<T: KvStore> KvStore for Arc<T> {
    fn get(&self, shard_id: ShardId, key: &Key)
        -> impl Future<Output = Result<Option<Value>, TgError>> + Send {
        (**self).get(shard_id, key)
    }

    fn apply(&self, shard_id: ShardId, writes: Vec<(Key, Value)>)
        -> impl Future<Output = Result<(), TgError>> + Send {
        (**self).apply(shard_id, writes)
    }
}
