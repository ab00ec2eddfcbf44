use tg_types::{Key, ShardId};

/// `data` partition: `shard(8) ++ key_bytes`
///
/// Big-endian shard prefix keeps every shard's keys contiguous and
/// ordered, so one keyspace can hold all shards of a node.
pub fn data_key(shard_id: ShardId, key: &Key) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.as_bytes().len());
    buf.extend_from_slice(&shard_id.to_be_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf
}

/// Inclusive lower bound of a shard's data keys.
pub fn data_shard_start(shard_id: ShardId) -> [u8; 8] {
    shard_id.to_be_bytes()
}

/// Exclusive upper bound for a shard's data keys: `(shard_id + 1)(8)`.
pub fn data_shard_end(shard_id: ShardId) -> [u8; 8] {
    shard_id.wrapping_add(1).to_be_bytes()
}

/// Strip the shard prefix from a raw `data` key.
pub fn user_key(raw: &[u8]) -> Option<Key> {
    raw.get(8..).map(Key::from)
}
