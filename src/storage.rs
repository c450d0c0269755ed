// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Bucket-granular storage adapters with encryption at rest.
//!
//! An adapter owns the untrusted bytes. It knows nothing about MACs, the
//! stash, or the Path ORAM invariant; it only promises that a block id and
//! payload round-trip exactly. A remote key-value backend would implement
//! [`StorageAdapter`] the same way [`FileStorage`] does; only the two local
//! variants ship here.

use crate::{
    bucket::{Block, Bucket},
    BucketId, OramError, KEY_SIZE, NIL,
};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use log::debug;
use rand::RngCore;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// AES-256-GCM nonce width in bytes.
const NONCE_BYTES: usize = 12;
/// AES-256-GCM authentication tag width in bytes.
const TAG_BYTES: usize = 16;
/// Bytes of block-id prefix inside each encrypted record.
const ID_BYTES: usize = 8;

/// Block-addressable, encrypted-at-rest persistence of buckets.
///
/// `read_buckets` / `write_buckets` are the batch entry points used by the
/// ORAM core; backends without native batching inherit the default loop over
/// the single-bucket primitives.
pub trait StorageAdapter {
    /// Number of bucket slots this adapter holds.
    fn capacity(&self) -> u64;

    /// Payload width W of each block.
    fn block_size(&self) -> usize;

    /// Number of blocks Z per bucket.
    fn bucket_size(&self) -> usize;

    /// Reads one bucket.
    fn read_bucket(&mut self, location: BucketId) -> Result<Bucket, OramError>;

    /// Writes one bucket. Atomic with respect to a single call.
    fn write_bucket(&mut self, location: BucketId, bucket: &Bucket) -> Result<(), OramError>;

    /// Whether this backend batches reads/writes natively.
    fn supports_batching(&self) -> bool {
        false
    }

    /// Reads the given buckets, order preserved.
    fn read_buckets(&mut self, locations: &[BucketId]) -> Result<Vec<Bucket>, OramError> {
        locations.iter().map(|&loc| self.read_bucket(loc)).collect()
    }

    /// Writes the given buckets.
    fn write_buckets(&mut self, requests: &[(BucketId, Bucket)]) -> Result<(), OramError> {
        for (location, bucket) in requests {
            self.write_bucket(*location, bucket)?;
        }
        Ok(())
    }

    /// Initializes every slot with a bucket of NIL-id blocks carrying random
    /// payloads, indistinguishable from live data.
    fn fill_with_zeroes(&mut self) -> Result<(), OramError> {
        let mut rng = OsRng;
        for location in 0..self.capacity() {
            let mut blocks = Vec::with_capacity(self.bucket_size());
            for _ in 0..self.bucket_size() {
                let mut payload = vec![0u8; self.block_size()];
                rng.fill_bytes(&mut payload);
                blocks.push(Block::new(NIL, payload));
            }
            self.write_bucket(location, &Bucket { blocks })?;
        }
        debug!("filled {} bucket slots with dummies", self.capacity());
        Ok(())
    }
}

fn check_bucket_shape(
    bucket: &Bucket,
    bucket_size: usize,
    block_size: usize,
) -> Result<(), OramError> {
    if bucket.blocks.len() != bucket_size {
        return Err(OramError::Configuration {
            reason: format!(
                "bucket holds {} blocks, adapter expects {}",
                bucket.blocks.len(),
                bucket_size
            ),
        });
    }
    for block in &bucket.blocks {
        if block.payload.len() != block_size {
            return Err(OramError::Configuration {
                reason: format!(
                    "block {} payload is {} bytes, adapter expects {}",
                    block.id,
                    block.payload.len(),
                    block_size
                ),
            });
        }
    }
    Ok(())
}

/// A trusted-memory adapter storing buckets in a `Vec`. Plaintext; for tests
/// and for deployments where the adapter itself runs inside the trust
/// boundary.
pub struct InMemoryStorage {
    buckets: Vec<Option<Bucket>>,
    block_size: usize,
    bucket_size: usize,
}

impl InMemoryStorage {
    /// Creates an adapter with `capacity` empty slots.
    pub fn new(capacity: u64, block_size: usize, bucket_size: usize) -> Self {
        Self {
            buckets: vec![None; capacity as usize],
            block_size,
            bucket_size,
        }
    }
}

impl StorageAdapter for InMemoryStorage {
    fn capacity(&self) -> u64 {
        self.buckets.len() as u64
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn read_bucket(&mut self, location: BucketId) -> Result<Bucket, OramError> {
        let slot = self
            .buckets
            .get(location as usize)
            .ok_or(OramError::AddressExceedsCapacity {
                address: location,
                capacity: self.capacity(),
            })?;
        slot.clone().ok_or(OramError::Configuration {
            reason: format!("bucket slot {location} read before initialization"),
        })
    }

    fn write_bucket(&mut self, location: BucketId, bucket: &Bucket) -> Result<(), OramError> {
        check_bucket_shape(bucket, self.bucket_size, self.block_size)?;
        let capacity = self.capacity();
        let slot =
            self.buckets
                .get_mut(location as usize)
                .ok_or(OramError::AddressExceedsCapacity {
                    address: location,
                    capacity,
                })?;
        *slot = Some(bucket.clone());
        Ok(())
    }
}

/// A file-backed adapter encrypting every block record with AES-256-GCM.
///
/// Layout: an 8-byte big-endian slot count header, then `capacity` slots of
/// Z records each. A record is `nonce(12) || ciphertext` where the ciphertext
/// authenticates `block_id(8) || payload(W)`; the record stride is therefore
/// `W + 36`. A fresh nonce is sampled for every record written.
pub struct FileStorage {
    file: File,
    capacity: u64,
    block_size: usize,
    bucket_size: usize,
    cipher: Aes256Gcm,
}

impl FileStorage {
    /// Opens (or creates, when `truncate` is true) the backing file.
    ///
    /// When creating, the header is written and the file is sized for
    /// `capacity` slots; when reopening, the stored slot count must match.
    pub fn new<P: AsRef<Path>>(
        path: P,
        capacity: u64,
        block_size: usize,
        bucket_size: usize,
        key: &[u8; KEY_SIZE],
        truncate: bool,
    ) -> Result<Self, OramError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&path)?;

        if truncate {
            crate::utils::write_u64_be(&mut file, capacity)?;
        } else {
            file.seek(SeekFrom::Start(0))?;
            let stored = crate::utils::read_u64_be(&mut file)?;
            if stored != capacity {
                return Err(OramError::Configuration {
                    reason: format!(
                        "storage file holds {stored} slots, expected {capacity}"
                    ),
                });
            }
        }

        debug!(
            "file storage at {:?}: {} slots, Z = {}, W = {}",
            path.as_ref(),
            capacity,
            bucket_size,
            block_size
        );
        Ok(Self {
            file,
            capacity,
            block_size,
            bucket_size,
            cipher,
        })
    }

    fn record_stride(&self) -> u64 {
        (NONCE_BYTES + ID_BYTES + self.block_size + TAG_BYTES) as u64
    }

    fn slot_offset(&self, location: BucketId) -> Result<u64, OramError> {
        if location >= self.capacity {
            return Err(OramError::AddressExceedsCapacity {
                address: location,
                capacity: self.capacity,
            });
        }
        Ok(8 + location * self.record_stride() * self.bucket_size as u64)
    }

    fn seal_block(&self, block: &Block) -> Result<Vec<u8>, OramError> {
        let mut plaintext = Vec::with_capacity(ID_BYTES + self.block_size);
        plaintext.extend_from_slice(&block.id.to_le_bytes());
        plaintext.extend_from_slice(&block.payload);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| OramError::Key {
                reason: "AEAD encryption failed".to_string(),
            })?;
        let mut record = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        record.extend_from_slice(nonce.as_slice());
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    fn open_block(&self, location: BucketId, record: &[u8]) -> Result<Block, OramError> {
        let (nonce, ciphertext) = record.split_at(NONCE_BYTES);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| OramError::Integrity { bucket: location })?;
        if plaintext.len() != ID_BYTES + self.block_size {
            return Err(OramError::Integrity { bucket: location });
        }
        let mut id_bytes = [0u8; ID_BYTES];
        id_bytes.copy_from_slice(&plaintext[..ID_BYTES]);
        Ok(Block::new(
            u64::from_le_bytes(id_bytes),
            plaintext[ID_BYTES..].to_vec(),
        ))
    }
}

impl StorageAdapter for FileStorage {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn supports_batching(&self) -> bool {
        true
    }

    fn read_bucket(&mut self, location: BucketId) -> Result<Bucket, OramError> {
        let offset = self.slot_offset(location)?;
        self.file.seek(SeekFrom::Start(offset))?;
        let stride = self.record_stride() as usize;
        let mut raw = vec![0u8; stride * self.bucket_size];
        self.file.read_exact(&mut raw)?;
        let blocks = raw
            .chunks_exact(stride)
            .map(|record| self.open_block(location, record))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Bucket { blocks })
    }

    fn write_bucket(&mut self, location: BucketId, bucket: &Bucket) -> Result<(), OramError> {
        check_bucket_shape(bucket, self.bucket_size, self.block_size)?;
        let offset = self.slot_offset(location)?;
        let mut raw = Vec::with_capacity(self.record_stride() as usize * self.bucket_size);
        for block in &bucket.blocks {
            raw.extend_from_slice(&self.seal_block(block)?);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&raw)?;
        Ok(())
    }

    fn write_buckets(&mut self, requests: &[(BucketId, Bucket)]) -> Result<(), OramError> {
        for (location, bucket) in requests {
            self.write_bucket(*location, bucket)?;
        }
        self.file.flush()?;
        Ok(())
    }
}

/// An adapter wrapper that fails reads or writes of chosen locations with an
/// I/O error, for exercising error propagation in tests.
pub struct FaultInjectingStorage<S> {
    inner: S,
    failing_reads: std::collections::HashSet<BucketId>,
    failing_writes: std::collections::HashSet<BucketId>,
}

impl<S: StorageAdapter> FaultInjectingStorage<S> {
    /// Wraps `inner` with no faults scheduled.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing_reads: std::collections::HashSet::new(),
            failing_writes: std::collections::HashSet::new(),
        }
    }

    /// Makes every read of `location` fail until cleared.
    pub fn fail_reads_of(&mut self, location: BucketId) {
        self.failing_reads.insert(location);
    }

    /// Makes every write of `location` fail until cleared.
    pub fn fail_writes_of(&mut self, location: BucketId) {
        self.failing_writes.insert(location);
    }

    /// Clears all scheduled faults.
    pub fn clear_faults(&mut self) {
        self.failing_reads.clear();
        self.failing_writes.clear();
    }

    fn injected_error(location: BucketId) -> OramError {
        OramError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected fault at bucket {location}"),
        ))
    }
}

impl<S: StorageAdapter> StorageAdapter for FaultInjectingStorage<S> {
    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn bucket_size(&self) -> usize {
        self.inner.bucket_size()
    }

    fn read_bucket(&mut self, location: BucketId) -> Result<Bucket, OramError> {
        if self.failing_reads.contains(&location) {
            return Err(Self::injected_error(location));
        }
        self.inner.read_bucket(location)
    }

    fn write_bucket(&mut self, location: BucketId, bucket: &Bucket) -> Result<(), OramError> {
        if self.failing_writes.contains(&location) {
            return Err(Self::injected_error(location));
        }
        self.inner.write_bucket(location, bucket)
    }
}

/// An adapter wrapper counting reads and writes, for tests and benches.
pub struct CountingStorage<S> {
    inner: S,
    read_count: u64,
    write_count: u64,
}

impl<S: StorageAdapter> CountingStorage<S> {
    /// Wraps `inner`, starting both counters at zero.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_count: 0,
            write_count: 0,
        }
    }

    /// The total number of bucket reads so far.
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    /// The total number of bucket writes so far.
    pub fn write_count(&self) -> u64 {
        self.write_count
    }
}

impl<S: StorageAdapter> StorageAdapter for CountingStorage<S> {
    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn bucket_size(&self) -> usize {
        self.inner.bucket_size()
    }

    fn supports_batching(&self) -> bool {
        self.inner.supports_batching()
    }

    fn read_bucket(&mut self, location: BucketId) -> Result<Bucket, OramError> {
        self.read_count += 1;
        self.inner.read_bucket(location)
    }

    fn write_bucket(&mut self, location: BucketId, bucket: &Bucket) -> Result<(), OramError> {
        self.write_count += 1;
        self.inner.write_bucket(location, bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn sample_bucket(rng: &mut StdRng, z: usize, w: usize) -> Bucket {
        let blocks = (0..z)
            .map(|i| {
                let mut payload = vec![0u8; w];
                rng.fill(&mut payload[..]);
                Block::new(i as u64 * 7, payload)
            })
            .collect();
        Bucket { blocks }
    }

    #[test]
    fn in_memory_round_trip() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut storage = InMemoryStorage::new(8, 32, 3);
        let bucket = sample_bucket(&mut rng, 3, 32);
        storage.write_bucket(5, &bucket).unwrap();
        assert_eq!(storage.read_bucket(5).unwrap(), bucket);
        assert!(storage.read_bucket(9).is_err());
    }

    #[test]
    fn in_memory_rejects_misshapen_buckets() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut storage = InMemoryStorage::new(4, 32, 3);
        let short = sample_bucket(&mut rng, 2, 32);
        assert!(matches!(
            storage.write_bucket(0, &short),
            Err(OramError::Configuration { .. })
        ));
        let wide = sample_bucket(&mut rng, 3, 64);
        assert!(storage.write_bucket(0, &wide).is_err());
    }

    #[test]
    fn file_storage_round_trips_through_aead() {
        let mut rng = StdRng::seed_from_u64(1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.bin");
        let key = [0x42u8; KEY_SIZE];

        let bucket = sample_bucket(&mut rng, 3, 64);
        {
            let mut storage = FileStorage::new(&path, 8, 64, 3, &key, true).unwrap();
            storage.fill_with_zeroes().unwrap();
            storage.write_bucket(3, &bucket).unwrap();
        }
        let mut reopened = FileStorage::new(&path, 8, 64, 3, &key, false).unwrap();
        assert_eq!(reopened.read_bucket(3).unwrap(), bucket);
        // Untouched slots decode as full-width dummies.
        let dummy = reopened.read_bucket(0).unwrap();
        assert!(dummy.blocks.iter().all(|b| b.is_dummy() && b.payload.len() == 64));
    }

    #[test]
    fn file_storage_wrong_key_fails_closed() {
        let mut rng = StdRng::seed_from_u64(2);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.bin");
        let bucket = sample_bucket(&mut rng, 3, 32);
        {
            let mut storage =
                FileStorage::new(&path, 4, 32, 3, &[0x11; KEY_SIZE], true).unwrap();
            storage.write_bucket(0, &bucket).unwrap();
        }
        let mut wrong = FileStorage::new(&path, 4, 32, 3, &[0x22; KEY_SIZE], false).unwrap();
        assert!(matches!(
            wrong.read_bucket(0),
            Err(OramError::Integrity { bucket: 0 })
        ));
    }

    #[test]
    fn file_storage_detects_slot_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.bin");
        let key = [0u8; KEY_SIZE];
        drop(FileStorage::new(&path, 8, 32, 3, &key, true).unwrap());
        assert!(FileStorage::new(&path, 16, 32, 3, &key, false).is_err());
    }

    #[test]
    fn counting_storage_counts() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut storage = CountingStorage::new(InMemoryStorage::new(4, 16, 3));
        let bucket = sample_bucket(&mut rng, 3, 16);
        storage.write_bucket(1, &bucket).unwrap();
        storage.read_bucket(1).unwrap();
        storage.read_bucket(1).unwrap();
        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.read_count(), 2);
    }
}
