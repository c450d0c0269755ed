// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM stash: a bounded overflow buffer for blocks that did not fit
//! into their target bucket on write-back.

use crate::{utils, BlockId, OramError, NIL};
use log::warn;
use rand::{seq::SliceRandom, CryptoRng, RngCore};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Block ids above this are treated as corrupt when loading a persisted stash.
const PLAUSIBLE_ID_LIMIT: BlockId = 1_000_000_000_000;

/// A bounded `BlockId -> payload` map. Exceeding the capacity bound
/// `S = 3 * H * Z` is a configuration error, not a recoverable failure.
///
/// All payloads share one width; [`Stash::add`] and [`Stash::update`] pad or
/// truncate input to preserve that invariant.
pub struct Stash {
    entries: HashMap<BlockId, Vec<u8>>,
    capacity: usize,
    block_size: usize,
}

impl Stash {
    /// Creates an empty stash bounded at `capacity` entries of `block_size` bytes.
    pub fn new(capacity: usize, block_size: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            block_size,
        }
    }

    /// Number of blocks currently stashed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stash is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `block` is present.
    pub fn exists(&self, block: BlockId) -> bool {
        self.entries.contains_key(&block)
    }

    fn fit(&self, mut payload: Vec<u8>) -> Vec<u8> {
        payload.resize(self.block_size, 0);
        payload
    }

    fn check_overflow(&self, block: BlockId) -> Result<(), OramError> {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&block) {
            return Err(OramError::CapacityExceeded {
                reason: format!("stash overflow inserting block {block} (capacity {})", self.capacity),
            });
        }
        Ok(())
    }

    /// Inserts `block` if absent. Ids that cannot belong to a live block are
    /// dropped with a warning.
    pub fn add(&mut self, block: BlockId, payload: Vec<u8>) -> Result<(), OramError> {
        if block == NIL || block > PLAUSIBLE_ID_LIMIT {
            warn!("stash: dropping implausible block id {block}");
            return Ok(());
        }
        self.check_overflow(block)?;
        let payload = self.fit(payload);
        self.entries.entry(block).or_insert(payload);
        Ok(())
    }

    /// Inserts or overwrites `block`.
    pub fn update(&mut self, block: BlockId, payload: Vec<u8>) -> Result<(), OramError> {
        self.check_overflow(block)?;
        let payload = self.fit(payload);
        self.entries.insert(block, payload);
        Ok(())
    }

    /// The payload of `block`, if stashed.
    pub fn get(&self, block: BlockId) -> Option<&[u8]> {
        self.entries.get(&block).map(Vec::as_slice)
    }

    /// Removes `block`.
    pub fn delete(&mut self, block: BlockId) {
        self.entries.remove(&block);
    }

    /// All stashed blocks in shuffled order, so eviction order does not leak
    /// insertion order.
    pub fn get_all<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Vec<(BlockId, Vec<u8>)> {
        let mut all: Vec<(BlockId, Vec<u8>)> = self
            .entries
            .iter()
            .map(|(id, payload)| (*id, payload.clone()))
            .collect();
        all.shuffle(rng);
        all
    }

    /// Persists the stash as concatenated `block_id(8) || payload(W)` records.
    pub fn store_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), OramError> {
        let mut writer = BufWriter::new(File::create(path)?);
        for (block, payload) in &self.entries {
            utils::write_u64_le(&mut writer, *block)?;
            writer.write_all(payload)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Loads records written by [`Stash::store_to_file`]. Records with
    /// implausible block ids are skipped with a warning; a trailing partial
    /// record marks the file as corrupt.
    pub fn load_from_file<P: AsRef<Path>>(
        path: P,
        capacity: usize,
        block_size: usize,
    ) -> Result<Self, OramError> {
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        let record_size = (8 + block_size) as u64;
        if size % record_size != 0 {
            warn!(
                "stash file {:?} size {size} is not a multiple of record size {record_size}; trailing record ignored",
                path.as_ref()
            );
        }
        let mut stash = Self::new(capacity, block_size);
        let mut reader = BufReader::new(file);
        for _ in 0..size / record_size {
            let block = utils::read_u64_le(&mut reader)?;
            let mut payload = vec![0u8; block_size];
            reader.read_exact(&mut payload)?;
            stash.add(block, payload)?;
        }
        Ok(stash)
    }
}
