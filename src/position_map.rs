// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A flat, in-memory position map from block id to assigned leaf.

use crate::{utils, BlockId, Leaf, OramError, TreeHeight};
use log::debug;
use rand::{CryptoRng, RngCore};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Maps every addressable [`BlockId`] to the leaf its path currently hangs
/// from. Entries start at uniformly random leaves so untouched blocks are
/// indistinguishable from live ones.
pub struct PositionMap {
    leaves: Vec<Leaf>,
}

impl PositionMap {
    /// Creates a map of `entries` leaves drawn uniformly from `[0, 2^(height-1))`.
    pub fn random<R: RngCore + CryptoRng>(
        entries: u64,
        height: TreeHeight,
        rng: &mut R,
    ) -> Self {
        let leaves = (0..entries)
            .map(|_| crate::tree::random_leaf(height, rng))
            .collect();
        Self { leaves }
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// The leaf currently assigned to `block`.
    pub fn get(&self, block: BlockId) -> Result<Leaf, OramError> {
        self.leaves
            .get(block as usize)
            .copied()
            .ok_or(OramError::AddressExceedsCapacity {
                address: block,
                capacity: self.len(),
            })
    }

    /// Reassigns `block` to `leaf`.
    pub fn set(&mut self, block: BlockId, leaf: Leaf) -> Result<(), OramError> {
        let capacity = self.len();
        let slot = self
            .leaves
            .get_mut(block as usize)
            .ok_or(OramError::AddressExceedsCapacity {
                address: block,
                capacity,
            })?;
        *slot = leaf;
        Ok(())
    }

    /// Persists the map as packed little-endian 8-byte leaves indexed by block id.
    pub fn store_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), OramError> {
        let mut writer = BufWriter::new(File::create(&path)?);
        for leaf in &self.leaves {
            utils::write_u64_le(&mut writer, *leaf)?;
        }
        writer.flush()?;
        debug!("stored {} position map entries to {:?}", self.len(), path.as_ref());
        Ok(())
    }

    /// Loads a map previously written by [`PositionMap::store_to_file`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, OramError> {
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size % 8 != 0 {
            return Err(OramError::Configuration {
                reason: format!(
                    "position map file {:?} has size {size}, not a multiple of 8",
                    path.as_ref()
                ),
            });
        }
        let mut reader = BufReader::new(file);
        let mut leaves = Vec::with_capacity((size / 8) as usize);
        let mut buf = [0u8; 8];
        while reader.read_exact(&mut buf).is_ok() {
            leaves.push(u64::from_le_bytes(buf));
        }
        debug!("loaded {} position map entries from {:?}", leaves.len(), path.as_ref());
        Ok(Self { leaves })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn entries_start_uniform_within_leaf_range() {
        let mut rng = StdRng::seed_from_u64(0);
        let map = PositionMap::random(512, 5, &mut rng);
        assert_eq!(map.len(), 512);
        for block in 0..512 {
            assert!(map.get(block).unwrap() < 16);
        }
    }

    #[test]
    fn set_then_get() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut map = PositionMap::random(16, 4, &mut rng);
        map.set(3, 7).unwrap();
        assert_eq!(map.get(3).unwrap(), 7);
        assert!(map.get(16).is_err());
        assert!(map.set(16, 0).is_err());
    }

    #[test]
    fn file_round_trip() {
        let mut rng = StdRng::seed_from_u64(1);
        let map = PositionMap::random(64, 6, &mut rng);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position-map.bin");
        map.store_to_file(&path).unwrap();
        let reloaded = PositionMap::load_from_file(&path).unwrap();
        assert_eq!(reloaded.len(), 64);
        for block in 0..64 {
            assert_eq!(map.get(block).unwrap(), reloaded.get(block).unwrap());
        }
    }
}
