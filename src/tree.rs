// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Pure coordinate arithmetic on the complete binary tree of buckets.
//!
//! Buckets are identified by their 1-based level-order index: the root is
//! bucket 1, the children of bucket `b` are `2b` and `2b + 1`. Leaves are
//! addressed separately as values in `[0, 2^(H-1))`; the leaf bucket of leaf
//! `l` is `l + 2^(H-1)`.

use crate::{BucketId, Leaf, OramError, TreeHeight};
use rand::{CryptoRng, Rng, RngCore};
use static_assertions::const_assert_eq;

const_assert_eq!(std::mem::size_of::<BucketId>(), 8);

/// Maps a (level, leaf) path coordinate to its bucket id.
///
/// Level 0 is the root; level `H - 1` holds the leaf buckets.
pub(crate) fn bucket_for_level_leaf(height: TreeHeight, level: TreeHeight, leaf: Leaf) -> BucketId {
    (leaf + (1u64 << (height - 1))) >> (height - 1 - level)
}

/// Whether two paths share the same bucket at `level`.
pub(crate) fn can_include(
    height: TreeHeight,
    path_leaf: Leaf,
    block_position: Leaf,
    level: TreeHeight,
) -> bool {
    bucket_for_level_leaf(height, level, path_leaf)
        == bucket_for_level_leaf(height, level, block_position)
}

/// The bucket ids on the root-to-leaf path, root first.
pub(crate) fn path_for_leaf(height: TreeHeight, leaf: Leaf) -> Vec<BucketId> {
    (0..height)
        .map(|level| bucket_for_level_leaf(height, level, leaf))
        .collect()
}

/// The inclusive leaf range `[from, to]` whose paths pass through `location`.
///
/// Used by bulk load to pick a position consistent with a directly-written
/// bucket.
pub(crate) fn leaves_for_location(
    height: TreeHeight,
    location: BucketId,
) -> Result<(Leaf, Leaf), OramError> {
    if location == 0 || location >= 1u64 << height {
        return Err(OramError::Configuration {
            reason: format!("bucket location {location} outside tree of height {height}"),
        });
    }
    let level = location.ilog2();
    let to_leaves = height - level - 1;
    let first_leaf_bucket = 1u64 << (height - 1);
    let from = (location << to_leaves) - first_leaf_bucket;
    let to = ((location + 1) << to_leaves) - 1 - first_leaf_bucket;
    Ok((from, to))
}

/// Samples a leaf uniformly from `[0, 2^(H-1))`.
pub(crate) fn random_leaf<R: RngCore + CryptoRng>(height: TreeHeight, rng: &mut R) -> Leaf {
    rng.gen_range(0..1u64 << (height - 1))
}

/// The bucket ids at `level`, in increasing order.
pub(crate) fn buckets_at_level(level: TreeHeight) -> std::ops::Range<BucketId> {
    (1u64 << level)..(1u64 << (level + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn root_is_bucket_one() {
        for height in 1..8 {
            for leaf in 0..(1u64 << (height - 1)) {
                assert_eq!(bucket_for_level_leaf(height, 0, leaf), 1);
            }
        }
    }

    #[test]
    fn leaf_level_maps_to_leaf_buckets() {
        let height = 5;
        for leaf in 0..16 {
            assert_eq!(bucket_for_level_leaf(height, height - 1, leaf), leaf + 16);
        }
    }

    #[test]
    fn path_is_a_chain_of_parents() {
        let height = 6;
        let path = path_for_leaf(height, 13);
        assert_eq!(path.len(), height as usize);
        for pair in path.windows(2) {
            assert_eq!(pair[1] / 2, pair[0]);
        }
    }

    #[test]
    fn can_include_is_reflexive_and_respects_subtrees() {
        let height = 4;
        for leaf in 0..8u64 {
            for level in 0..height {
                assert!(can_include(height, leaf, leaf, level));
            }
        }
        // Leaves 0 and 1 share the level-2 bucket in a height-4 tree, leaves 0 and 4 do not.
        assert!(can_include(height, 0, 1, 2));
        assert!(!can_include(height, 0, 4, 2));
        // Everything shares the root.
        assert!(can_include(height, 0, 7, 0));
    }

    #[test]
    fn leaves_for_location_inverts_bucket_for_level_leaf() {
        let height = 5;
        for level in 0..height {
            for location in buckets_at_level(level) {
                let (from, to) = leaves_for_location(height, location).unwrap();
                for leaf in from..=to {
                    assert_eq!(bucket_for_level_leaf(height, level, leaf), location);
                }
            }
        }
    }

    #[test]
    fn leaves_for_location_rejects_out_of_tree_buckets() {
        assert!(leaves_for_location(4, 0).is_err());
        assert!(leaves_for_location(4, 16).is_err());
    }

    #[test]
    fn random_leaf_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1000 {
            assert!(random_leaf(6, &mut rng) < 32);
        }
    }
}
