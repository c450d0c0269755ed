// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Oblivious, integrity-protected storage with secret-shared aggregate queries.
//!
//! The crate is organized around a Path ORAM engine ([`PathOram`]) that hides
//! access patterns from an untrusted [`StorageAdapter`], augmented with
//! per-bucket HMAC-SHA-256 tags ([`integrity::MacTable`]) and a client-side
//! stash and position map. On top of it sits a Shamir secret-sharing pipeline
//! that turns TPC-H `lineitem` tuples into per-replica share vectors
//! ([`encoder::ShareEncoder`]), packs them into length-prefixed containers
//! ([`container`]), and evaluates aggregate queries entirely in the share
//! domain ([`query`]).

#![warn(clippy::doc_markdown, missing_docs, rustdoc::all)]

use thiserror::Error;

pub mod backup;
pub mod bucket;
pub mod container;
pub mod encoder;
pub mod integrity;
pub mod lineitem;
pub mod path_oram;
pub mod position_map;
pub mod proxy;
pub mod query;
pub mod reconstruct;
pub mod shamir;
pub mod stash;
pub mod storage;
pub mod test_utils;
pub(crate) mod tree;
pub(crate) mod utils;

pub use bucket::{Block, Bucket};
pub use path_oram::PathOram;
pub use proxy::TrustedProxy;
pub use storage::{FileStorage, InMemoryStorage, StorageAdapter};

/// The numeric type of logical block identifiers.
pub type BlockId = u64;
/// The numeric type of bucket identifiers (1-based level-order tree index, root = 1).
pub type BucketId = u64;
/// The numeric type of leaf indices, in `[0, 2^(height-1))`.
pub type Leaf = u64;
/// The numeric type of tree heights and levels.
pub type TreeHeight = u32;

/// Sentinel block identifier marking an empty (dummy) block slot.
pub const NIL: BlockId = BlockId::MAX;

/// Keys and MAC tags are 256 bits.
pub const KEY_SIZE: usize = 32;

pub(crate) const MAXIMUM_TREE_HEIGHT: TreeHeight = 63;

/// The error type for all fallible operations in this crate.
#[derive(Debug, Error)]
pub enum OramError {
    /// Tree height, bucket capacity, block width, or adapter capacities are inconsistent.
    #[error("invalid configuration: {reason}")]
    Configuration {
        /// What was inconsistent.
        reason: String,
    },

    /// A bounded structure (stash, bulk load target) would overflow.
    #[error("capacity exceeded: {reason}")]
    CapacityExceeded {
        /// Which bound was hit.
        reason: String,
    },

    /// A `multi_access` call carried more requests than the configured batch limit.
    #[error("batch of {requested} requests exceeds limit {limit}")]
    BatchTooLarge {
        /// Number of requests submitted.
        requested: usize,
        /// The configured batch limit.
        limit: usize,
    },

    /// An address was outside the adapter's capacity.
    #[error("address {address} exceeds capacity {capacity}")]
    AddressExceedsCapacity {
        /// The offending address.
        address: u64,
        /// The adapter capacity.
        capacity: u64,
    },

    /// An adapter I/O operation failed. Propagated unchanged; no partial state.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A bucket failed MAC verification (or AEAD decryption) outside initialization.
    /// The ORAM instance should be discarded.
    #[error("integrity check failed for bucket {bucket}")]
    Integrity {
        /// The bucket whose tag did not verify.
        bucket: BucketId,
    },

    /// No MAC is recorded for a bucket that was read outside initialization.
    #[error("no MAC recorded for bucket {bucket}")]
    MacMissing {
        /// The bucket without a tag.
        bucket: BucketId,
    },

    /// A container failed to deserialize; the block is treated as corrupt.
    #[error("container in block {block} is corrupt: {reason}")]
    Corrupt {
        /// The block holding the corrupt container.
        block: BlockId,
        /// Why decoding failed.
        reason: String,
    },

    /// Key material is missing or unusable.
    #[error("key material error: {reason}")]
    Key {
        /// What went wrong with the key.
        reason: String,
    },

    /// A query file or plan was malformed.
    #[error("malformed query: {reason}")]
    Query {
        /// What was malformed.
        reason: String,
    },

    /// An input record or value failed to parse.
    #[error("malformed input: {reason}")]
    Parse {
        /// What was malformed.
        reason: String,
    },
}

/// Parameters of one Path ORAM instance, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OramConfig {
    /// Tree height H; the tree has `2^H - 1` buckets and `2^(H-1)` leaves.
    pub height: TreeHeight,
    /// Blocks per bucket (the parameter Z from the Path ORAM literature).
    pub bucket_size: usize,
    /// Payload width W of every block, in bytes.
    pub block_size: usize,
    /// Maximum number of requests accepted by a single `multi_access` call.
    pub batch_limit: usize,
}

/// The default bucket capacity Z.
pub const DEFAULT_BUCKET_SIZE: usize = 3;
/// The default block payload width W, sized for containers of 1000 16-attribute tuples.
pub const DEFAULT_BLOCK_SIZE: usize = 140_800;
/// The default `multi_access` batch limit.
pub const DEFAULT_BATCH_LIMIT: usize = 10;

impl OramConfig {
    /// Returns a configuration with the given height and the default
    /// Z / W / batch-limit constants.
    pub fn with_height(height: TreeHeight) -> Result<Self, OramError> {
        let config = Self {
            height,
            bucket_size: DEFAULT_BUCKET_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            batch_limit: DEFAULT_BATCH_LIMIT,
        };
        config.validate()?;
        Ok(config)
    }

    /// Derives the tree dimensions needed to store `tuples` lineitem tuples,
    /// packed 1000 to a container, one container per block.
    pub fn for_tuple_count(tuples: usize) -> Result<Self, OramError> {
        let blocks = tuples / container::MAX_TUPLES_PER_CONTAINER + 1;
        let buckets = blocks / DEFAULT_BUCKET_SIZE + 1;
        let height = (buckets as u64).next_power_of_two().ilog2().max(1);
        Self::with_height(height)
    }

    /// Checks the internal consistency of this configuration.
    pub fn validate(&self) -> Result<(), OramError> {
        if self.height < 1 || self.height > MAXIMUM_TREE_HEIGHT {
            return Err(OramError::Configuration {
                reason: format!(
                    "tree height {} out of range [1, {}]",
                    self.height, MAXIMUM_TREE_HEIGHT
                ),
            });
        }
        if self.bucket_size == 0 {
            return Err(OramError::Configuration {
                reason: "bucket size Z must be positive".to_string(),
            });
        }
        if self.block_size <= container::LENGTH_PREFIX_BYTES {
            return Err(OramError::Configuration {
                reason: format!(
                    "block size {} leaves no room for a container body",
                    self.block_size
                ),
            });
        }
        if self.batch_limit == 0 {
            return Err(OramError::Configuration {
                reason: "batch limit must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Number of buckets in the tree: `2^H - 1`.
    pub fn bucket_count(&self) -> u64 {
        (1u64 << self.height) - 1
    }

    /// Number of leaves: `2^(H-1)`.
    pub fn leaf_count(&self) -> u64 {
        1u64 << (self.height - 1)
    }

    /// Number of bucket slots the storage adapter must provide: `2^H - 1 + Z`.
    pub fn storage_slots(&self) -> u64 {
        self.bucket_count() + self.bucket_size as u64
    }

    /// Number of entries in the position map: one leaf per addressable block id.
    pub fn position_map_entries(&self) -> u64 {
        (1u64 << self.height) * self.bucket_size as u64 + self.bucket_size as u64
    }

    /// Stash capacity bound `S = 3 * H * Z`.
    pub fn stash_capacity(&self) -> usize {
        3 * self.height as usize * self.bucket_size
    }
}
