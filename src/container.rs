// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The container codec: a variable-length batch of 16-wide integer tuples
//! serialized into one fixed-width ORAM block.
//!
//! Wire form: an 8-byte little-endian length prefix `L`, then `L` bytes of
//! tuples in row-major little-endian `i64`, then random padding up to the
//! block width. The prefix lets the decoder discard the padding.

use crate::{BlockId, OramError};
use rand::{CryptoRng, RngCore};
use static_assertions::const_assert_eq;

/// Number of attributes per tuple.
pub const TUPLE_WIDTH: usize = 16;
/// Clients pack at most this many tuples into one container.
pub const MAX_TUPLES_PER_CONTAINER: usize = 1000;
/// Width of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 8;

/// Encoded width of one tuple in bytes.
pub const TUPLE_BYTES: usize = TUPLE_WIDTH * std::mem::size_of::<i64>();

const_assert_eq!(TUPLE_BYTES, 128);

/// A batch of 16-attribute share tuples, one container per used block.
pub type Container = Vec<[i64; TUPLE_WIDTH]>;

/// Serializes `container` into a payload of exactly `block_size` bytes.
///
/// Fails with `CapacityExceeded` when the body does not fit in
/// `block_size - 8`.
pub fn encode<R: RngCore + CryptoRng>(
    container: &Container,
    block_size: usize,
    rng: &mut R,
) -> Result<Vec<u8>, OramError> {
    let body_len = container.len() * TUPLE_BYTES;
    if LENGTH_PREFIX_BYTES + body_len > block_size {
        return Err(OramError::CapacityExceeded {
            reason: format!(
                "container of {} tuples ({body_len} bytes) overflows block size {block_size}",
                container.len()
            ),
        });
    }

    let mut payload = Vec::with_capacity(block_size);
    payload.extend_from_slice(&(body_len as u64).to_le_bytes());
    for tuple in container {
        for value in tuple {
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }

    let mut padding = vec![0u8; block_size - payload.len()];
    rng.fill_bytes(&mut padding);
    payload.extend_from_slice(&padding);
    Ok(payload)
}

/// Deserializes the container stored in `payload`, ignoring trailing padding.
///
/// `block` only labels the error when the length prefix is inconsistent.
pub fn decode(payload: &[u8], block: BlockId) -> Result<Container, OramError> {
    if payload.len() < LENGTH_PREFIX_BYTES {
        return Err(OramError::Corrupt {
            block,
            reason: format!("payload of {} bytes has no length prefix", payload.len()),
        });
    }
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    prefix.copy_from_slice(&payload[..LENGTH_PREFIX_BYTES]);
    let body_len = u64::from_le_bytes(prefix) as usize;

    if body_len > payload.len() - LENGTH_PREFIX_BYTES {
        return Err(OramError::Corrupt {
            block,
            reason: format!(
                "length prefix {body_len} exceeds available {} bytes",
                payload.len() - LENGTH_PREFIX_BYTES
            ),
        });
    }
    if body_len % TUPLE_BYTES != 0 {
        return Err(OramError::Corrupt {
            block,
            reason: format!("body length {body_len} is not a multiple of {TUPLE_BYTES}"),
        });
    }

    let body = &payload[LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + body_len];
    let mut container = Container::with_capacity(body_len / TUPLE_BYTES);
    for row in body.chunks_exact(TUPLE_BYTES) {
        let mut tuple = [0i64; TUPLE_WIDTH];
        for (value, bytes) in tuple.iter_mut().zip(row.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(bytes);
            *value = i64::from_le_bytes(word);
        }
        container.push(tuple);
    }
    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn sample_container(rng: &mut StdRng, tuples: usize) -> Container {
        (0..tuples)
            .map(|_| {
                let mut tuple = [0i64; TUPLE_WIDTH];
                for value in tuple.iter_mut() {
                    *value = rng.gen_range(-1_000_000_000..1_000_000_000);
                }
                tuple
            })
            .collect()
    }

    #[test]
    fn round_trip_discards_padding() {
        let mut rng = StdRng::seed_from_u64(0);
        let container = sample_container(&mut rng, 25);
        let payload = encode(&container, 8 + 128 * 30, &mut rng).unwrap();
        assert_eq!(payload.len(), 8 + 128 * 30);
        assert_eq!(decode(&payload, 0).unwrap(), container);
    }

    #[test]
    fn empty_container_round_trips() {
        let mut rng = StdRng::seed_from_u64(1);
        let payload = encode(&Container::new(), 64, &mut rng).unwrap();
        assert!(decode(&payload, 0).unwrap().is_empty());
    }

    #[test]
    fn overflow_is_rejected() {
        let mut rng = StdRng::seed_from_u64(2);
        let container = sample_container(&mut rng, 2);
        assert!(matches!(
            encode(&container, 8 + 128, &mut rng),
            Err(OramError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn corrupt_prefixes_are_detected() {
        let mut rng = StdRng::seed_from_u64(3);
        let container = sample_container(&mut rng, 2);
        let mut payload = encode(&container, 8 + 128 * 4, &mut rng).unwrap();

        // Prefix beyond the payload.
        payload[..8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            decode(&payload, 9),
            Err(OramError::Corrupt { block: 9, .. })
        ));

        // Prefix not a multiple of the tuple width.
        payload[..8].copy_from_slice(&100u64.to_le_bytes());
        assert!(decode(&payload, 9).is_err());

        // Truncated payload.
        assert!(decode(&payload[..4], 9).is_err());
    }
}
