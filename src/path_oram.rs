// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of Path ORAM (Stefanov et al.) with bucket-level
//! integrity tags.
//!
//! The core owns its collaborators exclusively: the untrusted storage
//! adapter, the flat position map, the bounded stash, the MAC table, and a
//! write-back cache of buckets staged between accesses. Operations are
//! strictly serialized through `&mut self`; one instance per replica may run
//! on its own thread.

use crate::{
    bucket::{Block, Bucket},
    container::{self, Container},
    integrity::{KeyMaterial, MacTable},
    position_map::PositionMap,
    stash::Stash,
    storage::StorageAdapter,
    tree, BlockId, BucketId, Leaf, OramConfig, OramError,
};
use log::{debug, info};
use rand::{CryptoRng, Rng, RngCore};
use std::collections::{BTreeSet, HashMap};

/// A Path ORAM instance over storage adapter `S`.
pub struct PathOram<S: StorageAdapter, R: RngCore + CryptoRng> {
    config: OramConfig,
    storage: S,
    position_map: PositionMap,
    stash: Stash,
    mac_table: MacTable,
    cache: HashMap<BucketId, Bucket>,
    access_counts: HashMap<BlockId, u64>,
    used_blocks: BTreeSet<BlockId>,
    rng: R,
}

impl<S: StorageAdapter, R: RngCore + CryptoRng> PathOram<S, R> {
    /// Creates a fresh ORAM: fills every storage slot with dummies, draws a
    /// uniform position map, and tags every bucket before returning, so the
    /// first user access already verifies.
    pub fn new(
        config: OramConfig,
        mut storage: S,
        key: KeyMaterial,
        mut rng: R,
    ) -> Result<Self, OramError> {
        config.validate()?;
        Self::check_adapter(&config, &storage)?;

        storage.fill_with_zeroes()?;
        let position_map =
            PositionMap::random(config.position_map_entries(), config.height, &mut rng);
        let stash = Stash::new(config.stash_capacity(), config.block_size);

        let mut oram = Self {
            config,
            storage,
            position_map,
            stash,
            mac_table: MacTable::new(key),
            cache: HashMap::new(),
            access_counts: HashMap::new(),
            used_blocks: BTreeSet::new(),
            rng,
        };
        oram.compute_and_store_all_bucket_macs()?;
        Ok(oram)
    }

    /// Reassembles an ORAM from restored components. The MAC table must have
    /// left initialization mode (it belongs to a populated tree).
    pub fn from_parts(
        config: OramConfig,
        storage: S,
        position_map: PositionMap,
        stash: Stash,
        mac_table: MacTable,
        used_blocks: BTreeSet<BlockId>,
        rng: R,
    ) -> Result<Self, OramError> {
        config.validate()?;
        Self::check_adapter(&config, &storage)?;
        if mac_table.is_initializing() {
            return Err(OramError::Configuration {
                reason: "restored MAC table is still in initialization mode".to_string(),
            });
        }
        if position_map.len() < config.position_map_entries() {
            return Err(OramError::Configuration {
                reason: format!(
                    "position map holds {} entries, configuration needs {}",
                    position_map.len(),
                    config.position_map_entries()
                ),
            });
        }
        Ok(Self {
            config,
            storage,
            position_map,
            stash,
            mac_table,
            cache: HashMap::new(),
            access_counts: HashMap::new(),
            used_blocks,
            rng,
        })
    }

    fn check_adapter(config: &OramConfig, storage: &S) -> Result<(), OramError> {
        if storage.capacity() < config.storage_slots() {
            return Err(OramError::Configuration {
                reason: format!(
                    "storage holds {} slots, configuration needs {}",
                    storage.capacity(),
                    config.storage_slots()
                ),
            });
        }
        if storage.block_size() != config.block_size
            || storage.bucket_size() != config.bucket_size
        {
            return Err(OramError::Configuration {
                reason: "storage adapter W/Z disagree with the ORAM configuration".to_string(),
            });
        }
        Ok(())
    }

    /// This instance's configuration.
    pub fn config(&self) -> &OramConfig {
        &self.config
    }

    /// The block ids that have been written, in ascending order.
    pub fn used_block_ids(&self) -> &BTreeSet<BlockId> {
        &self.used_blocks
    }

    /// Marks restored block ids as used (backup restore path).
    pub fn mark_used(&mut self, blocks: impl IntoIterator<Item = BlockId>) {
        self.used_blocks.extend(blocks);
    }

    /// How many times `block` has been accessed.
    pub fn access_count(&self, block: BlockId) -> u64 {
        self.access_counts.get(&block).copied().unwrap_or(0)
    }

    /// Number of blocks currently in the stash.
    pub fn stash_occupancy(&self) -> usize {
        self.stash.len()
    }

    /// The current position map (the leaf image is inspected by load tests).
    pub fn position_map(&self) -> &PositionMap {
        &self.position_map
    }

    /// Read-only view of the stash.
    pub fn stash(&self) -> &Stash {
        &self.stash
    }

    /// The MAC table, for persistence.
    pub fn mac_table(&self) -> &MacTable {
        &self.mac_table
    }

    /// Mutable access to the storage adapter (backup bookkeeping, tests).
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Obliviously reads `block`, returning its payload (empty if the block
    /// was never written).
    pub fn get(&mut self, block: BlockId) -> Result<Vec<u8>, OramError> {
        let response = self.access(true, block, &[])?;
        self.sync_cache()?;
        Ok(response)
    }

    /// Obliviously writes `data` to `block`.
    pub fn put(&mut self, block: BlockId, data: &[u8]) -> Result<(), OramError> {
        self.access(false, block, data)?;
        self.sync_cache()?;
        self.used_blocks.insert(block);
        Ok(())
    }

    /// Serves a batch of requests: `(block, None)` reads, `(block,
    /// Some(data))` writes. The union of paths is prefetched into the
    /// write-back cache, each request runs the access protocol against the
    /// cache, and one sync uploads the result.
    pub fn multi_access(
        &mut self,
        requests: &[(BlockId, Option<Vec<u8>>)],
    ) -> Result<Vec<Vec<u8>>, OramError> {
        if requests.len() > self.config.batch_limit {
            return Err(OramError::BatchTooLarge {
                requested: requests.len(),
                limit: self.config.batch_limit,
            });
        }

        // Populate the cache with every requested path before touching the stash.
        let mut locations = Vec::new();
        for (block, _) in requests {
            let leaf = self.position_map.get(*block)?;
            locations.extend(tree::path_for_leaf(self.config.height, leaf));
        }
        self.fetch_into_cache(&locations)?;

        let mut responses = Vec::with_capacity(requests.len());
        for (block, data) in requests {
            let response = match data {
                Some(data) => {
                    let response = self.access(false, *block, data)?;
                    self.used_blocks.insert(*block);
                    response
                }
                None => self.access(true, *block, &[])?,
            };
            responses.push(response);
        }

        self.sync_cache()?;
        Ok(responses)
    }

    /// Serializes `container` and writes it to `block`.
    pub fn put_container(
        &mut self,
        block: BlockId,
        container: &Container,
    ) -> Result<(), OramError> {
        let payload = container::encode(container, self.config.block_size, &mut self.rng)?;
        self.put(block, &payload)
    }

    /// Reads and deserializes the container at `block` (empty container if
    /// the block was never written).
    pub fn get_container(&mut self, block: BlockId) -> Result<Container, OramError> {
        let payload = self.get(block)?;
        if payload.is_empty() {
            return Ok(Container::new());
        }
        container::decode(&payload, block)
    }

    /// The Path ORAM access protocol: remap, read path into the stash,
    /// update, write path back greedily.
    fn access(&mut self, read: bool, block: BlockId, data: &[u8]) -> Result<Vec<u8>, OramError> {
        let previous = self.position_map.get(block)?;
        let new_leaf = tree::random_leaf(self.config.height, &mut self.rng);
        self.position_map.set(block, new_leaf)?;
        *self.access_counts.entry(block).or_insert(0) += 1;
        debug!("access block {block}: leaf {previous} -> {new_leaf}");

        self.read_path(previous, true)?;

        if !read {
            self.stash.update(block, data.to_vec())?;
        }
        let response = self
            .stash
            .get(block)
            .map(|payload| payload.to_vec())
            .unwrap_or_default();

        self.write_path(previous)?;
        Ok(response)
    }

    /// Loads every bucket on the root-to-`leaf` path into the cache,
    /// verifying tags, and (optionally) moves their live blocks to the stash.
    fn read_path(&mut self, leaf: Leaf, into_stash: bool) -> Result<(), OramError> {
        let path = tree::path_for_leaf(self.config.height, leaf);
        self.fetch_into_cache(&path)?;

        if into_stash {
            for bucket_id in path {
                let bucket = self
                    .cache
                    .get(&bucket_id)
                    .ok_or(OramError::MacMissing { bucket: bucket_id })?;
                self.mac_table.verify(bucket_id, bucket)?;
                for block in bucket.real_blocks() {
                    self.stash.add(block.id, block.payload.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Batch-fetches cache misses from storage, verifying each fetched bucket.
    fn fetch_into_cache(&mut self, locations: &[BucketId]) -> Result<(), OramError> {
        let mut missing: Vec<BucketId> = locations
            .iter()
            .copied()
            .filter(|loc| !self.cache.contains_key(loc))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            return Ok(());
        }

        let buckets = self.storage.read_buckets(&missing)?;
        for (location, bucket) in missing.into_iter().zip(buckets) {
            self.mac_table.verify(location, &bucket)?;
            self.cache.insert(location, bucket);
        }
        Ok(())
    }

    /// Greedily evicts the stash into the path of `leaf`, leaf level first,
    /// retagging and staging each rebuilt bucket.
    fn write_path(&mut self, leaf: Leaf) -> Result<(), OramError> {
        let mut remaining = self.stash.get_all(&mut self.rng);
        let mut placed = Vec::new();

        for level in (0..self.config.height).rev() {
            let mut to_insert = Vec::with_capacity(self.config.bucket_size);
            let mut kept = Vec::with_capacity(remaining.len());
            for (block, payload) in remaining {
                let position = self.position_map.get(block)?;
                if to_insert.len() < self.config.bucket_size
                    && tree::can_include(self.config.height, position, leaf, level)
                {
                    to_insert.push((block, payload));
                } else {
                    kept.push((block, payload));
                }
            }
            remaining = kept;

            let bucket_id = tree::bucket_for_level_leaf(self.config.height, level, leaf);
            let mut blocks = Vec::with_capacity(self.config.bucket_size);
            for _ in 0..self.config.bucket_size {
                match to_insert.pop() {
                    Some((block, payload)) => {
                        placed.push(block);
                        blocks.push(Block::new(block, payload));
                    }
                    None => blocks.push(Block::dummy(self.config.block_size, &mut self.rng)),
                }
            }
            let bucket = Bucket { blocks };

            self.mac_table.compute_and_store(bucket_id, &bucket)?;
            self.mac_table.verify(bucket_id, &bucket)?;
            self.cache.insert(bucket_id, bucket);
        }

        for block in placed {
            self.stash.delete(block);
        }
        Ok(())
    }

    /// Flushes the whole write-back cache to storage and clears it. A hard
    /// durability barrier: nothing staged is visible to storage before this.
    pub fn sync_cache(&mut self) -> Result<(), OramError> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let requests: Vec<(BucketId, Bucket)> = self.cache.drain().collect();
        debug!("sync {} staged buckets", requests.len());
        self.storage.write_buckets(&requests)?;
        Ok(())
    }

    /// Distributes `records` across the tree, bypassing the stash: shuffle,
    /// pack into buckets of Z, write each bucket to an evenly-spaced tree
    /// location, and point every record's position at a leaf under its
    /// bucket.
    pub fn bulk_load(&mut self, mut records: Vec<(BlockId, Vec<u8>)>) -> Result<(), OramError> {
        if records.is_empty() {
            return Ok(());
        }
        let z = self.config.bucket_size;
        let bucket_count = records.len().div_ceil(z) as u64;
        if bucket_count > self.config.bucket_count() {
            return Err(OramError::CapacityExceeded {
                reason: format!(
                    "bulk load of {} records needs {bucket_count} buckets, tree has {}",
                    records.len(),
                    self.config.bucket_count()
                ),
            });
        }

        // A bulk load without the shuffle would leak the original record order.
        for i in (1..records.len()).rev() {
            records.swap(i, self.rng.gen_range(0..=i));
        }

        // Buckets go to evenly spaced leaf positions while they fit there,
        // which keeps the position-map image uniform over leaves; larger
        // loads spill across the whole tree.
        let leaf_count = self.config.leaf_count();
        let tree_buckets = self.config.bucket_count();
        let location_of = move |iteration: u64| -> BucketId {
            if bucket_count <= leaf_count {
                leaf_count + iteration * leaf_count / bucket_count
            } else {
                let step = tree_buckets as f64 / bucket_count as f64;
                ((1.0 + iteration as f64 * step).floor() as u64).min(tree_buckets)
            }
        };

        let mut requests = Vec::with_capacity(bucket_count as usize);
        for (iteration, chunk) in records.chunks(z).enumerate() {
            let location = location_of(iteration as u64);
            let (from, to) = tree::leaves_for_location(self.config.height, location)?;

            let mut blocks = Vec::with_capacity(z);
            for (block, payload) in chunk {
                self.position_map.set(*block, self.rng.gen_range(from..=to))?;
                self.used_blocks.insert(*block);
                let mut payload = payload.clone();
                payload.resize(self.config.block_size, 0);
                blocks.push(Block::new(*block, payload));
            }
            while blocks.len() < z {
                blocks.push(Block::dummy(self.config.block_size, &mut self.rng));
            }
            let bucket = Bucket { blocks };
            self.mac_table.compute_and_store(location, &bucket)?;
            requests.push((location, bucket));
        }

        info!(
            "bulk load: {} records into {} buckets",
            records.len(),
            requests.len()
        );
        self.storage.write_buckets(&requests)?;
        Ok(())
    }

    /// Tags every bucket in the tree, level by level through the cache, then
    /// leaves initialization mode. Runs exactly once, inside construction.
    fn compute_and_store_all_bucket_macs(&mut self) -> Result<(), OramError> {
        info!(
            "initial MAC pass over {} buckets",
            self.config.bucket_count()
        );
        for level in 0..self.config.height {
            let locations: Vec<BucketId> = tree::buckets_at_level(level).collect();
            self.fetch_into_cache(&locations)?;
            for location in locations {
                let bucket = self
                    .cache
                    .get(&location)
                    .ok_or(OramError::MacMissing { bucket: location })?
                    .clone();
                self.mac_table.compute_and_store(location, &bucket)?;
            }
            self.sync_cache()?;
        }
        self.mac_table.finish_initialization();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::KEY_SIZE;
    use rand::{rngs::StdRng, SeedableRng};

    fn small_config() -> OramConfig {
        OramConfig {
            height: 4,
            bucket_size: 3,
            block_size: 64,
            batch_limit: 10,
        }
    }

    fn build_oram(
        config: OramConfig,
        seed: u64,
    ) -> PathOram<InMemoryStorage, StdRng> {
        let storage = InMemoryStorage::new(
            config.storage_slots(),
            config.block_size,
            config.bucket_size,
        );
        PathOram::new(
            config,
            storage,
            KeyMaterial::from_bytes([0x33; KEY_SIZE]),
            StdRng::seed_from_u64(seed),
        )
        .unwrap()
    }

    fn assert_path_invariant(oram: &mut PathOram<InMemoryStorage, StdRng>, block: BlockId) {
        // The block lives in the stash or on the path to its mapped leaf.
        if oram.stash.exists(block) {
            return;
        }
        let leaf = oram.position_map.get(block).unwrap();
        let path = tree::path_for_leaf(oram.config.height, leaf);
        let found = path.into_iter().any(|bucket_id| {
            let bucket = oram.storage.read_bucket(bucket_id).unwrap();
            let has_block = bucket.real_blocks().any(|b| b.id == block);
            has_block
        });
        assert!(found, "block {block} violates the path invariant");
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut oram = build_oram(small_config(), 0);
        let data = vec![0xC4u8; 24];
        oram.put(7, &data).unwrap();
        let read = oram.get(7).unwrap();
        assert_eq!(&read[..24], &data[..]);
        // The remainder is stash padding, not garbage from another block.
        assert!(read[24..].iter().all(|&b| b == 0));
        assert_eq!(oram.access_count(7), 2);
        assert!(oram.used_block_ids().contains(&7));
    }

    #[test]
    fn absent_blocks_read_empty() {
        let mut oram = build_oram(small_config(), 1);
        assert!(oram.get(11).unwrap().is_empty());
    }

    #[test]
    fn overwrites_return_the_latest_value() {
        let mut oram = build_oram(small_config(), 2);
        oram.put(3, &[1u8; 8]).unwrap();
        oram.put(3, &[2u8; 8]).unwrap();
        assert_eq!(&oram.get(3).unwrap()[..8], &[2u8; 8]);
    }

    #[test]
    fn random_workload_against_mirror() {
        let config = small_config();
        let mut oram = build_oram(config, 3);
        let mut rng = StdRng::seed_from_u64(99);
        let mut mirror: HashMap<BlockId, Vec<u8>> = HashMap::new();
        let universe = 24u64;

        for _ in 0..300 {
            let block = rng.gen_range(0..universe);
            if rng.gen_bool(0.5) {
                let mut data = vec![0u8; 32];
                rng.fill(&mut data[..]);
                oram.put(block, &data).unwrap();
                mirror.insert(block, data);
            } else {
                let read = oram.get(block).unwrap();
                match mirror.get(&block) {
                    Some(expected) => assert_eq!(&read[..32], &expected[..]),
                    None => assert!(read.is_empty()),
                }
            }
            assert!(oram.stash_occupancy() <= config.stash_capacity());
        }

        for (&block, expected) in &mirror {
            assert_eq!(&oram.get(block).unwrap()[..32], &expected[..]);
            assert_path_invariant(&mut oram, block);
        }
    }

    #[test]
    fn multi_access_serves_batches() {
        let mut oram = build_oram(small_config(), 4);
        oram.put(1, &[0xA1; 8]).unwrap();
        oram.put(2, &[0xA2; 8]).unwrap();

        let responses = oram
            .multi_access(&[
                (1, None),
                (2, Some(vec![0xB2; 8])),
                (5, None),
            ])
            .unwrap();
        assert_eq!(&responses[0][..8], &[0xA1; 8]);
        // A write returns the post-update payload.
        assert_eq!(&responses[1][..8], &[0xB2; 8]);
        assert!(responses[2].is_empty());
        assert_eq!(&oram.get(2).unwrap()[..8], &[0xB2; 8]);
    }

    #[test]
    fn multi_access_enforces_the_batch_limit() {
        let mut config = small_config();
        config.batch_limit = 2;
        let mut oram = build_oram(config, 5);
        let requests: Vec<(BlockId, Option<Vec<u8>>)> =
            (0..3).map(|b| (b as BlockId, None)).collect();
        assert!(matches!(
            oram.multi_access(&requests),
            Err(OramError::BatchTooLarge {
                requested: 3,
                limit: 2
            })
        ));
    }

    #[test]
    fn container_round_trip() {
        let config = OramConfig {
            height: 3,
            bucket_size: 3,
            block_size: 8 + 128 * 4,
            batch_limit: 10,
        };
        let mut oram = build_oram(config, 6);
        let container: Container = vec![[7i64; 16], [-3i64; 16]];
        oram.put_container(0, &container).unwrap();
        assert_eq!(oram.get_container(0).unwrap(), container);
        assert!(oram.get_container(1).unwrap().is_empty());
    }

    #[test]
    fn tampered_bucket_is_detected() {
        let mut oram = build_oram(small_config(), 7);
        oram.put(9, &[5u8; 16]).unwrap();

        // Flip one payload byte in the root bucket, which every path reads.
        let mut bucket = oram.storage.read_bucket(1).unwrap();
        bucket.blocks[0].payload[0] ^= 0x80;
        oram.storage.write_bucket(1, &bucket).unwrap();

        assert!(matches!(
            oram.get(9),
            Err(OramError::Integrity { bucket: 1 })
        ));
    }

    #[test]
    fn bulk_load_rejects_oversized_input_and_serves_the_rest() {
        let config = small_config();
        let mut oram = build_oram(config, 8);

        let too_many: Vec<(BlockId, Vec<u8>)> = (0..config.bucket_count() * 3 + 3)
            .map(|b| (b, vec![b as u8; 16]))
            .collect();
        assert!(matches!(
            oram.bulk_load(too_many),
            Err(OramError::CapacityExceeded { .. })
        ));

        let records: Vec<(BlockId, Vec<u8>)> = (0..12u64).map(|b| (b, vec![b as u8; 16])).collect();
        oram.bulk_load(records).unwrap();
        for block in 0..12u64 {
            let read = oram.get(block).unwrap();
            assert_eq!(&read[..16], &vec![block as u8; 16][..]);
        }
    }

    #[test]
    fn storage_failures_propagate_unchanged() {
        use crate::storage::FaultInjectingStorage;

        let config = small_config();
        let build = |seed: u64| {
            PathOram::new(
                config,
                FaultInjectingStorage::new(InMemoryStorage::new(
                    config.storage_slots(),
                    config.block_size,
                    config.bucket_size,
                )),
                KeyMaterial::from_bytes([0x33; KEY_SIZE]),
                StdRng::seed_from_u64(seed),
            )
            .unwrap()
        };

        // Every path reads the root, so a faulted root surfaces as an I/O
        // error from the access itself. The instance is undefined afterwards
        // (the remap already happened) and would be reloaded from backup.
        let mut oram = build(9);
        oram.put(4, &[7u8; 8]).unwrap();
        oram.storage_mut().fail_reads_of(1);
        assert!(matches!(oram.get(4), Err(OramError::Io(_))));

        // A write fault fails the sync that follows the access.
        let mut oram = build(10);
        oram.storage_mut().fail_writes_of(1);
        assert!(matches!(oram.put(5, &[8u8; 8]), Err(OramError::Io(_))));
    }

    #[test]
    fn adapter_mismatch_is_a_configuration_error() {
        let config = small_config();
        let storage = InMemoryStorage::new(2, config.block_size, config.bucket_size);
        assert!(matches!(
            PathOram::new(
                config,
                storage,
                KeyMaterial::from_bytes([0; KEY_SIZE]),
                StdRng::seed_from_u64(0)
            ),
            Err(OramError::Configuration { .. })
        ));
    }
}
