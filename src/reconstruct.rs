// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Trusted-client reconstruction: Lagrange interpolation of replica shares
//! back into typed attribute values and aggregates.
//!
//! Nothing in this module runs on a server; it consumes per-replica query
//! outputs (or share files) and the implicit X-coordinates `1..=n`.

use crate::lineitem::{format_decimal_centi, Attribute};
use crate::shamir::{interpolate_at_zero, Share, MODULUS};
use crate::OramError;
use chrono::NaiveDate;

/// A reconstructed attribute value in its native type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    /// Integer-keyed attributes.
    Integer(i64),
    /// Fixed-point attributes, in centi-units.
    Decimal(i64),
    /// Single-character flags.
    Flag(char),
    /// Civil dates.
    Date(NaiveDate),
    /// Short ASCII strings. Only exact for packings below the field modulus.
    Text(String),
}

impl std::fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodedValue::Integer(v) => write!(f, "{v}"),
            DecodedValue::Decimal(centi) => write!(f, "{}", format_decimal_centi(*centi)),
            DecodedValue::Flag(c) => write!(f, "{c}"),
            DecodedValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            DecodedValue::Text(s) => write!(f, "{s}"),
        }
    }
}

fn unpack_string(mut value: i64) -> Result<String, OramError> {
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push((value % 256) as u8);
        value /= 256;
    }
    bytes.reverse();
    String::from_utf8(bytes).map_err(|_| OramError::Parse {
        reason: "reconstructed string is not UTF-8 (packing wrapped the modulus?)".to_string(),
    })
}

/// Interprets a reconstructed normalized integer as `attribute`'s native type.
pub fn decode(attribute: Attribute, secret: i64) -> Result<DecodedValue, OramError> {
    match attribute {
        Attribute::OrderKey
        | Attribute::PartKey
        | Attribute::SuppKey
        | Attribute::LineNumber
        | Attribute::Quantity => Ok(DecodedValue::Integer(secret)),
        Attribute::ExtendedPrice | Attribute::Discount | Attribute::Tax => {
            Ok(DecodedValue::Decimal(secret))
        }
        Attribute::ReturnFlag | Attribute::LineStatus => {
            let code = u32::try_from(secret).ok().and_then(char::from_u32);
            match code {
                Some(c) if c.is_ascii() => Ok(DecodedValue::Flag(c)),
                _ => Err(OramError::Parse {
                    reason: format!("flag code {secret} is not ASCII"),
                }),
            }
        }
        Attribute::ShipDate | Attribute::CommitDate | Attribute::ReceiptDate => {
            let timestamp = chrono::DateTime::from_timestamp(secret, 0).ok_or(
                OramError::Parse {
                    reason: format!("timestamp {secret} out of range"),
                },
            )?;
            Ok(DecodedValue::Date(timestamp.date_naive()))
        }
        Attribute::ShipInstruct | Attribute::ShipMode | Attribute::Comment => {
            Ok(DecodedValue::Text(unpack_string(secret)?))
        }
    }
}

/// Reconstructs one attribute from at least `k` distinct replica shares.
pub fn reconstruct_attribute(
    attribute: Attribute,
    shares: &[Share],
) -> Result<DecodedValue, OramError> {
    decode(attribute, interpolate_at_zero(shares)?)
}

/// Reconstructs an additive aggregate from per-replica partial sums.
///
/// Each input share is `(x = replica, y = sum of that replica's matching
/// share values mod p)`; because sharing is linear, these are shares of the
/// plaintext aggregate. Exact only while the plaintext aggregate stays in
/// `[0, MODULUS)`.
pub fn reconstruct_aggregate(partial_sums: &[Share]) -> Result<i64, OramError> {
    interpolate_at_zero(partial_sums)
}

/// Upper bound on exactly-reconstructable aggregates.
pub const AGGREGATE_LIMIT: i64 = MODULUS;
