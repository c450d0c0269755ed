// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Bucket-level authenticated integrity: key material and the MAC table.
//!
//! Every stored bucket has an out-of-band HMAC-SHA-256 tag over its Z
//! payloads concatenated in stored order. Verification is skipped only during
//! the initial zeroing phase, which ends before any user access.

use crate::{bucket::Bucket, utils, BucketId, OramError, KEY_SIZE};
use hmac::{Hmac, Mac};
use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Width of an HMAC-SHA-256 tag in bytes.
pub const TAG_SIZE: usize = 32;

/// The single 32-byte symmetric key protecting one replica's ORAM: it keys
/// both the bucket MACs and the storage adapter's AEAD.
#[derive(Clone)]
pub struct KeyMaterial {
    key: [u8; KEY_SIZE],
}

impl KeyMaterial {
    /// Generates a fresh key from the operating system RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Wraps an existing raw key.
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Writes the raw key to `path`. The file is secured by filesystem
    /// permissions only.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), OramError> {
        let mut file = File::create(path)?;
        file.write_all(&self.key)?;
        Ok(())
    }

    /// Reads a raw 32-byte key from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, OramError> {
        let mut file = File::open(&path).map_err(|e| OramError::Key {
            reason: format!("cannot open key file {:?}: {e}", path.as_ref()),
        })?;
        let mut key = [0u8; KEY_SIZE];
        file.read_exact(&mut key).map_err(|_| OramError::Key {
            reason: format!("key file {:?} is shorter than {KEY_SIZE} bytes", path.as_ref()),
        })?;
        Ok(Self { key })
    }

    /// Loads the key at `path`, generating and persisting one if absent.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self, OramError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let material = Self::generate();
            material.save(path)?;
            Ok(material)
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key bytes.
        write!(f, "KeyMaterial(..)")
    }
}

/// The `BucketId -> tag` table backing bucket integrity verification.
pub struct MacTable {
    key: KeyMaterial,
    tags: HashMap<BucketId, [u8; TAG_SIZE]>,
    is_initializing: bool,
}

impl MacTable {
    /// Creates an empty table in initialization mode: verification passes
    /// until [`MacTable::finish_initialization`] is called.
    pub fn new(key: KeyMaterial) -> Self {
        Self {
            key,
            tags: HashMap::new(),
            is_initializing: true,
        }
    }

    /// Leaves initialization mode; every subsequent read must verify.
    pub fn finish_initialization(&mut self) {
        self.is_initializing = false;
    }

    /// Whether the table is still in the initial zeroing phase.
    pub fn is_initializing(&self) -> bool {
        self.is_initializing
    }

    /// Number of tagged buckets.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether no bucket has been tagged yet.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    fn tag_of(&self, bucket: &Bucket) -> Result<[u8; TAG_SIZE], OramError> {
        let mut mac =
            HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|_| OramError::Key {
                reason: "HMAC rejected key".to_string(),
            })?;
        mac.update(&bucket.concatenated_payloads());
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }

    /// Computes and records the tag of `bucket` under `bucket_id`.
    pub fn compute_and_store(
        &mut self,
        bucket_id: BucketId,
        bucket: &Bucket,
    ) -> Result<(), OramError> {
        let tag = self.tag_of(bucket)?;
        debug!("bucket {bucket_id} tagged {}", hex::encode(&tag[..8]));
        self.tags.insert(bucket_id, tag);
        Ok(())
    }

    /// Recomputes the tag of `bucket` and compares it, in constant time,
    /// against the recorded one. Passes unconditionally while initializing.
    pub fn verify(&self, bucket_id: BucketId, bucket: &Bucket) -> Result<(), OramError> {
        if self.is_initializing {
            return Ok(());
        }
        let stored = self
            .tags
            .get(&bucket_id)
            .ok_or(OramError::MacMissing { bucket: bucket_id })?;
        let computed = self.tag_of(bucket)?;
        if bool::from(computed.as_slice().ct_eq(stored.as_slice())) {
            Ok(())
        } else {
            warn!(
                "bucket {bucket_id} tag mismatch: stored {}, computed {}",
                hex::encode(&stored[..8]),
                hex::encode(&computed[..8])
            );
            Err(OramError::Integrity { bucket: bucket_id })
        }
    }

    /// Persists the table: count(8) then `bucket_id(8) || tag_len(8) || tag`
    /// records.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), OramError> {
        let mut writer = BufWriter::new(File::create(path)?);
        utils::write_u64_le(&mut writer, self.tags.len() as u64)?;
        for (bucket_id, tag) in &self.tags {
            utils::write_u64_le(&mut writer, *bucket_id)?;
            utils::write_u64_le(&mut writer, tag.len() as u64)?;
            writer.write_all(tag)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Loads a table written by [`MacTable::save`]. The table comes back out
    /// of initialization mode: it belongs to a populated ORAM.
    pub fn load<P: AsRef<Path>>(path: P, key: KeyMaterial) -> Result<Self, OramError> {
        let mut reader = BufReader::new(File::open(&path)?);
        let count = utils::read_u64_le(&mut reader)?;
        let mut tags = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let bucket_id = utils::read_u64_le(&mut reader)?;
            let tag_len = utils::read_u64_le(&mut reader)?;
            if tag_len as usize != TAG_SIZE {
                return Err(OramError::Key {
                    reason: format!(
                        "MAC table {:?} holds a {tag_len}-byte tag for bucket {bucket_id}",
                        path.as_ref()
                    ),
                });
            }
            let mut tag = [0u8; TAG_SIZE];
            reader.read_exact(&mut tag)?;
            tags.insert(bucket_id, tag);
        }
        debug!("loaded {} bucket tags from {:?}", tags.len(), path.as_ref());
        Ok(Self {
            key,
            tags,
            is_initializing: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Block;

    fn bucket_of(bytes: u8) -> Bucket {
        Bucket {
            blocks: vec![
                Block::new(1, vec![bytes; 8]),
                Block::new(2, vec![bytes.wrapping_add(1); 8]),
            ],
        }
    }

    #[test]
    fn verify_accepts_stored_bucket_and_rejects_mutation() {
        let mut table = MacTable::new(KeyMaterial::from_bytes([7u8; KEY_SIZE]));
        let bucket = bucket_of(0x10);
        table.compute_and_store(5, &bucket).unwrap();
        table.finish_initialization();
        table.verify(5, &bucket).unwrap();

        let mut tampered = bucket.clone();
        tampered.blocks[1].payload[3] ^= 1;
        assert!(matches!(
            table.verify(5, &tampered),
            Err(OramError::Integrity { bucket: 5 })
        ));
    }

    #[test]
    fn verification_is_skipped_only_during_initialization() {
        let mut table = MacTable::new(KeyMaterial::from_bytes([7u8; KEY_SIZE]));
        let bucket = bucket_of(0x20);
        // Nothing stored yet, but the zeroing phase must be able to read.
        table.verify(1, &bucket).unwrap();
        table.finish_initialization();
        assert!(matches!(
            table.verify(1, &bucket),
            Err(OramError::MacMissing { bucket: 1 })
        ));
    }

    #[test]
    fn tags_depend_on_the_key() {
        let mut a = MacTable::new(KeyMaterial::from_bytes([1u8; KEY_SIZE]));
        let mut b = MacTable::new(KeyMaterial::from_bytes([2u8; KEY_SIZE]));
        let bucket = bucket_of(0x30);
        a.compute_and_store(1, &bucket).unwrap();
        b.compute_and_store(1, &bucket).unwrap();
        a.finish_initialization();
        b.finish_initialization();
        assert!(a.verify(1, &bucket).is_ok());
        assert_ne!(a.tags.get(&1), b.tags.get(&1));
    }

    #[test]
    fn save_and_load_round_trip() {
        let key = KeyMaterial::from_bytes([9u8; KEY_SIZE]);
        let mut table = MacTable::new(key.clone());
        let bucket = bucket_of(0x40);
        table.compute_and_store(3, &bucket).unwrap();
        table.compute_and_store(11, &bucket_of(0x41)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mac_map.bin");
        table.save(&path).unwrap();

        let loaded = MacTable::load(&path, key).unwrap();
        assert!(!loaded.is_initializing());
        assert_eq!(loaded.len(), 2);
        loaded.verify(3, &bucket).unwrap();
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.bin");
        let first = KeyMaterial::load_or_generate(&path).unwrap();
        let second = KeyMaterial::load_or_generate(&path).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert!(KeyMaterial::load(dir.path().join("missing.bin")).is_err());
    }

    #[test]
    fn distinct_generated_keys() {
        assert_ne!(
            KeyMaterial::generate().as_bytes(),
            KeyMaterial::generate().as_bytes()
        );
    }
}
