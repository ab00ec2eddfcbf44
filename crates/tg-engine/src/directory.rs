use std::collections::BTreeSet;

use tg_types::{Key, ShardId, TgError};

/// A half-open key range `[start, end)` owned by one shard.
/// An empty `end` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Partition {
    pub start: Vec<u8>,
    #[serde(default)]
    pub end: Vec<u8>,
    pub shard: ShardId,
}

impl Partition {
    fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }
}

/// Maps keys to the shard that owns them.
///
/// Pure lookup; any two callers holding the same `Directory` agree on every
/// key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directory {
    /// XXH3 of the key bytes modulo `shard_count`. Shards are
    /// `0..shard_count`. Placement is fixed across builds and platforms.
    Hashed { shard_count: u64 },
    /// Sorted, non-overlapping ranges. Keys in gaps have no owner.
    Ranged { partitions: Vec<Partition> },
}

impl Directory {
    pub fn hashed(shard_count: u64) -> Self {
        Directory::Hashed { shard_count }
    }

    /// Build a range directory, rejecting empty or overlapping partitions.
    pub fn ranged(mut partitions: Vec<Partition>) -> Result<Self, TgError> {
        partitions.sort_by(|a, b| a.start.cmp(&b.start));
        for p in &partitions {
            if !p.end.is_empty() && p.end <= p.start {
                return Err(TgError::InvalidArgument(format!(
                    "partition for shard {} has end <= start",
                    p.shard
                )));
            }
        }
        for pair in partitions.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.end.is_empty() || a.end > b.start {
                return Err(TgError::InvalidArgument(format!(
                    "partitions for shards {} and {} overlap",
                    a.shard, b.shard
                )));
            }
        }
        Ok(Directory::Ranged { partitions })
    }

    pub fn locate(&self, key: &Key) -> Result<ShardId, TgError> {
        let unknown = || TgError::UnknownShard { key: key.clone() };
        match self {
            Directory::Hashed { shard_count: 0 } => Err(unknown()),
            Directory::Hashed { shard_count } => {
                Ok(xxhash_rust::xxh3::xxh3_64(key.as_bytes()) % shard_count)
            }
            Directory::Ranged { partitions } => {
                let bytes = key.as_bytes();
                // Last partition whose start is <= key.
                let idx = partitions.partition_point(|p| p.start.as_slice() <= bytes);
                idx.checked_sub(1)
                    .map(|i| &partitions[i])
                    .filter(|p| p.contains(bytes))
                    .map(|p| p.shard)
                    .ok_or_else(unknown)
            }
        }
    }

    /// Every shard this directory can route to.
    pub fn shard_ids(&self) -> BTreeSet<ShardId> {
        match self {
            Directory::Hashed { shard_count } => (0..*shard_count).collect(),
            Directory::Ranged { partitions } => partitions.iter().map(|p| p.shard).collect(),
        }
    }
}
