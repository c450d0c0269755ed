// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Shamir secret sharing over the prime field GF(9 999 999 967).
//!
//! Every attribute is shared with a degree-`k-1` polynomial whose constant
//! term is the secret. The non-constant coefficients are not sampled fresh per
//! tuple: they are derived from a keyed PRF of (attribute, coefficient index,
//! secret), so two tuples that agree on an attribute produce identical share
//! vectors at every replica. That determinism is what makes share-domain
//! equality predicates sound; it also means secrecy against fewer than `k`
//! replicas is computational (PRF) rather than information-theoretic.

use crate::{OramError, KEY_SIZE};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The field modulus: prime, larger than 2^33 so base-256-packed strings
/// survive reduction with usable equality semantics.
pub const MODULUS: i64 = 9_999_999_967;

/// Default number of replicas n.
pub const DEFAULT_SHARE_COUNT: usize = 6;
/// Default reconstruction threshold k.
pub const DEFAULT_THRESHOLD: usize = 3;

/// One share: the evaluation point `x` in `[1, n]` and the polynomial value
/// `y` in `[0, MODULUS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Share {
    /// Evaluation point; replica `i` holds `x = i`.
    pub x: i64,
    /// Share value in the field.
    pub y: i64,
}

/// Reduces `value` into the canonical range `[0, MODULUS)`.
pub fn field_normalize(value: i64) -> i64 {
    ((value % MODULUS) + MODULUS) % MODULUS
}

/// Field addition. Clients use this to accumulate share-domain sums.
pub fn field_add(a: i64, b: i64) -> i64 {
    ((a as i128 + b as i128).rem_euclid(MODULUS as i128)) as i64
}

/// Field subtraction.
pub fn field_sub(a: i64, b: i64) -> i64 {
    ((a as i128 - b as i128).rem_euclid(MODULUS as i128)) as i64
}

/// Field multiplication.
pub fn field_mul(a: i64, b: i64) -> i64 {
    ((a as i128 * b as i128).rem_euclid(MODULUS as i128)) as i64
}

/// Modular inverse by Fermat's little theorem; `value` must be nonzero mod p.
pub fn field_inv(value: i64) -> Result<i64, OramError> {
    let value = field_normalize(value);
    if value == 0 {
        return Err(OramError::Query {
            reason: "field inversion of zero (duplicate share points?)".to_string(),
        });
    }
    let mut base = value as i128;
    let mut exponent = MODULUS - 2;
    let mut result: i128 = 1;
    let modulus = MODULUS as i128;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }
    Ok(result as i64)
}

/// A `(k, n)` sharing scheme with PRF-derived coefficients.
#[derive(Clone)]
pub struct ShareScheme {
    share_count: usize,
    threshold: usize,
    key: [u8; KEY_SIZE],
}

impl ShareScheme {
    /// Creates a scheme issuing `share_count` shares reconstructable from any
    /// `threshold` of them, with coefficients keyed by `key`.
    pub fn new(
        share_count: usize,
        threshold: usize,
        key: [u8; KEY_SIZE],
    ) -> Result<Self, OramError> {
        if threshold < 2 || threshold > share_count {
            return Err(OramError::Configuration {
                reason: format!("invalid sharing parameters (k, n) = ({threshold}, {share_count})"),
            });
        }
        if share_count as i64 >= MODULUS {
            return Err(OramError::Configuration {
                reason: format!("share count {share_count} too large for the field"),
            });
        }
        Ok(Self {
            share_count,
            threshold,
            key,
        })
    }

    /// The default `(3, 6)` scheme under `key`.
    pub fn with_default_parameters(key: [u8; KEY_SIZE]) -> Self {
        Self {
            share_count: DEFAULT_SHARE_COUNT,
            threshold: DEFAULT_THRESHOLD,
            key,
        }
    }

    /// Number of shares n.
    pub fn share_count(&self) -> usize {
        self.share_count
    }

    /// Reconstruction threshold k.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The PRF-derived coefficient `a_index` for `attribute` and `secret`,
    /// in `[1, MODULUS)`.
    fn coefficient(&self, attribute: usize, index: usize, secret: i64) -> Result<i64, OramError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| OramError::Key {
            reason: "HMAC rejected share key".to_string(),
        })?;
        mac.update(&(attribute as u64).to_le_bytes());
        mac.update(&(index as u64).to_le_bytes());
        mac.update(&secret.to_le_bytes());
        let digest = mac.finalize().into_bytes();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        Ok(1 + (u64::from_le_bytes(word) % (MODULUS as u64 - 1)) as i64)
    }

    /// Splits `secret` (reduced into the field) into n shares for `attribute`.
    pub fn split(&self, attribute: usize, secret: i64) -> Result<Vec<Share>, OramError> {
        let secret = field_normalize(secret);
        let mut coefficients = Vec::with_capacity(self.threshold);
        coefficients.push(secret);
        for index in 1..self.threshold {
            coefficients.push(self.coefficient(attribute, index, secret)?);
        }

        let mut shares = Vec::with_capacity(self.share_count);
        for x in 1..=self.share_count as i64 {
            // Horner evaluation, highest degree first.
            let mut y = 0i64;
            for coefficient in coefficients.iter().rev() {
                y = field_add(field_mul(y, x), *coefficient);
            }
            shares.push(Share { x, y });
        }
        Ok(shares)
    }
}

impl std::fmt::Debug for ShareScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The PRF key stays out of debug output.
        f.debug_struct("ShareScheme")
            .field("share_count", &self.share_count)
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// Lagrange interpolation of the sharing polynomial at `x = 0`.
///
/// Any `threshold` shares with pairwise distinct points reconstruct the
/// secret exactly for normalized values in `[0, MODULUS)`.
pub fn interpolate_at_zero(shares: &[Share]) -> Result<i64, OramError> {
    if shares.is_empty() {
        return Err(OramError::Query {
            reason: "no shares to interpolate".to_string(),
        });
    }
    let mut secret = 0i64;
    for (i, share_i) in shares.iter().enumerate() {
        let mut numerator = 1i64;
        let mut denominator = 1i64;
        for (j, share_j) in shares.iter().enumerate() {
            if i == j {
                continue;
            }
            numerator = field_mul(numerator, field_normalize(-share_j.x));
            denominator = field_mul(denominator, field_sub(share_i.x, share_j.x));
        }
        let lagrange = field_mul(numerator, field_inv(denominator)?);
        secret = field_add(secret, field_mul(share_i.y, lagrange));
    }
    Ok(secret)
}
