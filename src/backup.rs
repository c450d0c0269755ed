// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The per-replica backup directory: file layout, used-block-id persistence,
//! and full save/restore of an ORAM instance.
//!
//! The directory is a single-writer resource; concurrent writers corrupt it.
//! Layout per replica `i`:
//!
//! - `storage_server_{i}.bin` — the [`crate::FileStorage`] file (AEAD records).
//! - `position-map_server_{i}.bin` — packed little-endian leaves.
//! - `stash_server_{i}.bin` — `block_id(8) || payload(W)` records.
//! - `mac_map_server_{i}.bin` — count, then `bucket_id(8) || tag_len(8) || tag`.
//! - `used_block_ids_server_{i}.bin` — count, then block ids.
//! - `key_server_{i}.bin` — the raw 32-byte key.
//! - `common_secret_share_size.txt` — decimal tuple count, shared by all replicas.

use crate::integrity::{KeyMaterial, MacTable};
use crate::path_oram::PathOram;
use crate::position_map::PositionMap;
use crate::stash::Stash;
use crate::storage::{FileStorage, StorageAdapter};
use crate::{utils, BlockId, OramConfig, OramError};
use log::info;
use rand::{CryptoRng, RngCore};
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Path bookkeeping for one backup directory.
#[derive(Debug, Clone)]
pub struct BackupDir {
    root: PathBuf,
}

impl BackupDir {
    /// Opens (creating if needed) the backup directory at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, OramError> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// The directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `storage_server_{replica}.bin`.
    pub fn storage_file(&self, replica: usize) -> PathBuf {
        self.root.join(format!("storage_server_{replica}.bin"))
    }

    /// `position-map_server_{replica}.bin`.
    pub fn position_map_file(&self, replica: usize) -> PathBuf {
        self.root.join(format!("position-map_server_{replica}.bin"))
    }

    /// `stash_server_{replica}.bin`.
    pub fn stash_file(&self, replica: usize) -> PathBuf {
        self.root.join(format!("stash_server_{replica}.bin"))
    }

    /// `mac_map_server_{replica}.bin`.
    pub fn mac_map_file(&self, replica: usize) -> PathBuf {
        self.root.join(format!("mac_map_server_{replica}.bin"))
    }

    /// `used_block_ids_server_{replica}.bin`.
    pub fn used_block_ids_file(&self, replica: usize) -> PathBuf {
        self.root.join(format!("used_block_ids_server_{replica}.bin"))
    }

    /// `key_server_{replica}.bin`.
    pub fn key_file(&self, replica: usize) -> PathBuf {
        self.root.join(format!("key_server_{replica}.bin"))
    }

    /// `common_secret_share_size.txt`.
    pub fn tuple_count_file(&self) -> PathBuf {
        self.root.join("common_secret_share_size.txt")
    }

    /// Records the ingested tuple count, from which tree dimensions are
    /// rederived on restart.
    pub fn write_tuple_count(&self, tuples: usize) -> Result<(), OramError> {
        fs::write(self.tuple_count_file(), format!("{tuples}\n"))?;
        Ok(())
    }

    /// Reads the recorded tuple count.
    pub fn read_tuple_count(&self) -> Result<usize, OramError> {
        let text = fs::read_to_string(self.tuple_count_file())?;
        text.trim().parse().map_err(|_| OramError::Parse {
            reason: format!("bad tuple count {text:?}"),
        })
    }

    /// Reads the slot-count header of one replica's storage file, from which
    /// the tree height is rederived on restore.
    pub fn read_storage_slots(&self, replica: usize) -> Result<u64, OramError> {
        let mut file = fs::File::open(self.storage_file(replica))?;
        utils::read_u64_be(&mut file)
            .map_err(OramError::from)
    }
}

/// Persists a used-block-id set as count(8) then ids(8 each), little-endian.
pub fn save_used_block_ids<P: AsRef<Path>>(
    path: P,
    blocks: &BTreeSet<BlockId>,
) -> Result<(), OramError> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    utils::write_u64_le(&mut writer, blocks.len() as u64)?;
    for block in blocks {
        utils::write_u64_le(&mut writer, *block)?;
    }
    writer.flush()?;
    Ok(())
}

/// Loads a set written by [`save_used_block_ids`].
pub fn load_used_block_ids<P: AsRef<Path>>(path: P) -> Result<BTreeSet<BlockId>, OramError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let count = utils::read_u64_le(&mut reader)?;
    let mut blocks = BTreeSet::new();
    for _ in 0..count {
        blocks.insert(utils::read_u64_le(&mut reader)?);
    }
    Ok(blocks)
}

/// Writes one replica's client-side state (position map, stash, MAC table,
/// used block ids) into `dir`. The storage file is already on disk when the
/// ORAM runs over [`FileStorage`]; the key is written at creation time.
pub fn backup_replica<S, R>(
    oram: &PathOram<S, R>,
    dir: &BackupDir,
    replica: usize,
) -> Result<(), OramError>
where
    S: StorageAdapter,
    R: RngCore + CryptoRng,
{
    oram.position_map()
        .store_to_file(dir.position_map_file(replica))?;
    oram.stash().store_to_file(dir.stash_file(replica))?;
    oram.mac_table().save(dir.mac_map_file(replica))?;
    save_used_block_ids(dir.used_block_ids_file(replica), oram.used_block_ids())?;
    info!("replica {replica}: backup written to {:?}", dir.root());
    Ok(())
}

/// Rebuilds one replica's ORAM from `dir`, reopening its storage file in
/// place.
pub fn restore_replica<R>(
    dir: &BackupDir,
    replica: usize,
    config: OramConfig,
    rng: R,
) -> Result<PathOram<FileStorage, R>, OramError>
where
    R: RngCore + CryptoRng,
{
    let key = KeyMaterial::load(dir.key_file(replica))?;
    let storage = FileStorage::new(
        dir.storage_file(replica),
        config.storage_slots(),
        config.block_size,
        config.bucket_size,
        key.as_bytes(),
        false,
    )?;
    let position_map = PositionMap::load_from_file(dir.position_map_file(replica))?;
    let stash = Stash::load_from_file(
        dir.stash_file(replica),
        config.stash_capacity(),
        config.block_size,
    )?;
    let mac_table = MacTable::load(dir.mac_map_file(replica), key)?;
    let used_blocks = load_used_block_ids(dir.used_block_ids_file(replica))?;
    info!(
        "replica {replica}: restored {} used blocks from {:?}",
        used_blocks.len(),
        dir.root()
    );
    PathOram::from_parts(
        config,
        storage,
        position_map,
        stash,
        mac_table,
        used_blocks,
        rng,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_block_ids_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("used.bin");
        let blocks: BTreeSet<BlockId> = [0u64, 3, 9, 200].into_iter().collect();
        save_used_block_ids(&path, &blocks).unwrap();
        assert_eq!(load_used_block_ids(&path).unwrap(), blocks);
    }

    #[test]
    fn tuple_count_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = BackupDir::new(tmp.path().join("backup")).unwrap();
        dir.write_tuple_count(6001).unwrap();
        assert_eq!(dir.read_tuple_count().unwrap(), 6001);
    }

    #[test]
    fn layout_names_follow_the_replica_index() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = BackupDir::new(tmp.path()).unwrap();
        assert!(dir
            .storage_file(2)
            .ends_with("storage_server_2.bin"));
        assert!(dir
            .position_map_file(0)
            .ends_with("position-map_server_0.bin"));
        assert!(dir.key_file(5).ends_with("key_server_5.bin"));
    }
}
