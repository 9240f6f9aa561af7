//! Tagged flow hashing used by the sketch.
//!
//! Every hash the encoder computes is tagged with the role it plays. The role
//! selects the seed handed to xxh3, so the novelty filter, the block selector
//! and the K cell selectors behave as independent hash functions over the
//! same 13-byte key encoding:
//!
//! | role          | seed                          |
//! |---------------|-------------------------------|
//! | `Novelty(i)`  | `base ^ (1 << 32) ^ i`        |
//! | `Block`       | `base ^ (2 << 32)`            |
//! | `Cell(k)`     | `base ^ (3 << 32) ^ k`        |
//!
//! The role sits above the 32-bit index, so no two roles share a seed. A
//! switch's base is `xxh3(switch_id, hash_seed)`.

use std::fmt::Debug;

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::flow::FlowKey;

const NOVELTY_TAG: u64 = 1 << 32;
const BLOCK_TAG: u64 = 2 << 32;
const CELL_TAG: u64 = 3 << 32;

/// What a hash value is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashRole {
    /// The i-th novelty filter hash.
    Novelty(u32),
    /// Block selection.
    Block,
    /// The k-th counter cell hash.
    Cell(u32),
}

impl HashRole {
    pub fn seed(self, base: u64) -> u64 {
        match self {
            HashRole::Novelty(i) => base ^ NOVELTY_TAG ^ i as u64,
            HashRole::Block => base ^ BLOCK_TAG,
            HashRole::Cell(k) => base ^ CELL_TAG ^ k as u64,
        }
    }
}

/// Hashes a flow key for a given role.
pub trait FlowHasher: Send + Sync + Debug {
    fn hash(&self, key: &FlowKey, role: HashRole) -> u64;
}

/// Default hasher: seeded xxh3 over [`FlowKey::to_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededHasher {
    base: u64,
}

impl SeededHasher {
    pub fn new(base: u64) -> SeededHasher {
        SeededHasher { base }
    }

    /// Hasher of switch `switch_id` under the configured `hash_seed`.
    pub fn for_switch(hash_seed: u64, switch_id: usize) -> SeededHasher {
        SeededHasher::new(xxh3_64_with_seed(&(switch_id as u64).to_le_bytes(), hash_seed))
    }
}

impl FlowHasher for SeededHasher {
    fn hash(&self, key: &FlowKey, role: HashRole) -> u64 {
        xxh3_64_with_seed(&key.to_bytes(), role.seed(self.base))
    }
}

/// Bucket a hash into `range` slots.
pub fn bucket(hash: u64, range: usize) -> usize {
    (hash % range as u64) as usize
}
