// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Block and bucket structures for Path ORAM.

use crate::{BlockId, NIL};
use rand::{CryptoRng, RngCore};

/// A `(BlockId, payload)` record of fixed payload width W.
///
/// A block whose id is [`NIL`] is a dummy: its payload is W random bytes,
/// indistinguishable from live data at rest.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    /// The logical identity of this block, or [`NIL`] for a dummy.
    pub id: BlockId,
    /// W bytes of plaintext payload.
    pub payload: Vec<u8>,
}

impl Block {
    /// Creates a block with the given id and payload.
    pub fn new(id: BlockId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Creates a dummy block carrying `width` uniformly random bytes.
    pub fn dummy<R: RngCore + CryptoRng>(width: usize, rng: &mut R) -> Self {
        let mut payload = vec![0u8; width];
        rng.fill_bytes(&mut payload);
        Self { id: NIL, payload }
    }

    /// Whether this block is a dummy.
    pub fn is_dummy(&self) -> bool {
        self.id == NIL
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dummy() {
            write!(f, "Block::Dummy({} bytes)", self.payload.len())
        } else {
            f.debug_struct("Block")
                .field("id", &self.id)
                .field("payload_len", &self.payload.len())
                .finish()
        }
    }
}

/// An ordered sequence of exactly Z blocks, stored at one tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    /// The Z blocks of this bucket, in stored order.
    pub blocks: Vec<Block>,
}

impl Bucket {
    /// Creates a bucket of `bucket_size` dummy blocks of width `block_size`.
    pub fn dummies<R: RngCore + CryptoRng>(
        bucket_size: usize,
        block_size: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            blocks: (0..bucket_size).map(|_| Block::dummy(block_size, rng)).collect(),
        }
    }

    /// The payloads of all Z blocks concatenated in stored order, as MAC input.
    pub fn concatenated_payloads(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.blocks.iter().map(|b| b.payload.len()).sum());
        for block in &self.blocks {
            out.extend_from_slice(&block.payload);
        }
        out
    }

    /// The non-dummy blocks of this bucket.
    pub fn real_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| !b.is_dummy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn dummy_blocks_carry_full_width_random_payloads() {
        let mut rng = StdRng::seed_from_u64(0);
        let a = Block::dummy(64, &mut rng);
        let b = Block::dummy(64, &mut rng);
        assert!(a.is_dummy());
        assert_eq!(a.payload.len(), 64);
        // Two dummies should not share a payload.
        assert_ne!(a.payload, b.payload);
    }

    #[test]
    fn bucket_shape_and_mac_input() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut bucket = Bucket::dummies(3, 16, &mut rng);
        bucket.blocks[1] = Block::new(7, vec![0xAB; 16]);
        assert_eq!(bucket.blocks.len(), 3);
        assert_eq!(bucket.real_blocks().count(), 1);
        let concatenated = bucket.concatenated_payloads();
        assert_eq!(concatenated.len(), 48);
        assert_eq!(&concatenated[16..32], &[0xAB; 16]);
    }
}
