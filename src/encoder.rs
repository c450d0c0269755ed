// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The share encoder: typed `lineitem` tuples to per-replica share vectors.
//!
//! Each attribute is first normalized to an integer (the table in the module
//! functions below), then split with the crate's deterministic Shamir scheme.
//! Replica `i` receives the 16 Y-coordinates evaluated at `x = i`.

use crate::container::TUPLE_WIDTH;
use crate::lineitem::{Attribute, LineItem, ATTRIBUTES};
use crate::shamir::{field_add, field_mul, field_normalize, ShareScheme};
use crate::OramError;
use chrono::NaiveTime;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Packs an ASCII string base-256 big-endian, folding into the field.
///
/// Values longer than four bytes wrap around the modulus: the packing stays
/// deterministic (and therefore equality-comparable) but is not invertible.
pub fn pack_string(value: &str) -> i64 {
    let mut acc = 0i64;
    for byte in value.bytes() {
        acc = field_add(field_mul(acc, 256), byte as i64);
    }
    acc
}

/// The normalized integer form of one attribute of `item`.
pub fn normalize(item: &LineItem, attribute: Attribute) -> i64 {
    let raw = match attribute {
        Attribute::OrderKey => item.order_key,
        Attribute::PartKey => item.part_key,
        Attribute::SuppKey => item.supp_key,
        Attribute::LineNumber => item.line_number,
        Attribute::Quantity => item.quantity,
        Attribute::ExtendedPrice => item.extended_price,
        Attribute::Discount => item.discount,
        Attribute::Tax => item.tax,
        Attribute::ReturnFlag => item.return_flag as i64,
        Attribute::LineStatus => item.line_status as i64,
        Attribute::ShipDate => date_to_timestamp(item.ship_date),
        Attribute::CommitDate => date_to_timestamp(item.commit_date),
        Attribute::ReceiptDate => date_to_timestamp(item.receipt_date),
        Attribute::ShipInstruct => return pack_string(&item.ship_instruct),
        Attribute::ShipMode => return pack_string(&item.ship_mode),
        Attribute::Comment => return pack_string(&item.comment),
    };
    field_normalize(raw)
}

/// Midnight-UTC Unix timestamp of a civil date.
pub fn date_to_timestamp(date: chrono::NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Normalizes a plaintext condition literal exactly the way the matching
/// tuple attribute is normalized, so the resulting shares collide.
pub fn normalize_literal(attribute: Attribute, literal: &str) -> Result<i64, OramError> {
    let literal = literal.trim();
    let raw = match attribute {
        Attribute::OrderKey
        | Attribute::PartKey
        | Attribute::SuppKey
        | Attribute::LineNumber
        | Attribute::Quantity => literal.parse().map_err(|_| OramError::Parse {
            reason: format!("bad integer literal {literal:?}"),
        })?,
        Attribute::ExtendedPrice | Attribute::Discount | Attribute::Tax => {
            crate::lineitem::parse_decimal_centi(literal)?
        }
        Attribute::ReturnFlag | Attribute::LineStatus => {
            let mut chars = literal.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() => c as i64,
                _ => {
                    return Err(OramError::Parse {
                        reason: format!("bad flag literal {literal:?}"),
                    })
                }
            }
        }
        Attribute::ShipDate | Attribute::CommitDate | Attribute::ReceiptDate => {
            let date = chrono::NaiveDate::parse_from_str(literal, "%Y-%m-%d").map_err(|_| {
                OramError::Parse {
                    reason: format!("bad date literal {literal:?}"),
                }
            })?;
            date_to_timestamp(date)
        }
        Attribute::ShipInstruct | Attribute::ShipMode | Attribute::Comment => {
            return Ok(pack_string(literal))
        }
    };
    Ok(field_normalize(raw))
}

/// Turns typed tuples into per-replica share vectors.
#[derive(Debug, Clone)]
pub struct ShareEncoder {
    scheme: ShareScheme,
}

impl ShareEncoder {
    /// Creates an encoder over `scheme`.
    pub fn new(scheme: ShareScheme) -> Self {
        Self { scheme }
    }

    /// The underlying sharing scheme.
    pub fn scheme(&self) -> &ShareScheme {
        &self.scheme
    }

    /// Encodes `item` into one 16-wide share vector per replica.
    ///
    /// `result[j][a]` is the Y-coordinate held by replica `j + 1` for
    /// attribute `a`.
    pub fn encode(&self, item: &LineItem) -> Result<Vec<[i64; TUPLE_WIDTH]>, OramError> {
        let mut rows = vec![[0i64; TUPLE_WIDTH]; self.scheme.share_count()];
        for attribute in ATTRIBUTES {
            let secret = normalize(item, attribute);
            let shares = self.scheme.split(attribute.index(), secret)?;
            for (row, share) in rows.iter_mut().zip(&shares) {
                row[attribute.index()] = share.y;
            }
        }
        Ok(rows)
    }

    /// The Y-coordinate replica `replica` (1-based) would hold for
    /// `attribute = value`; this is how filter conditions are translated
    /// into the share domain.
    pub fn share_for_condition(
        &self,
        attribute: Attribute,
        secret: i64,
        replica: usize,
    ) -> Result<i64, OramError> {
        let shares = self.scheme.split(attribute.index(), field_normalize(secret))?;
        shares
            .get(replica.wrapping_sub(1))
            .map(|s| s.y)
            .ok_or(OramError::Configuration {
                reason: format!(
                    "replica {replica} out of range 1..={}",
                    self.scheme.share_count()
                ),
            })
    }
}

/// The path of replica `replica`'s share file under `dir`.
pub fn share_file_path<P: AsRef<Path>>(dir: P, replica: usize) -> PathBuf {
    dir.as_ref().join(format!("server_{replica}.txt"))
}

/// Writes one replica's tuples as lines of 16 pipe-separated Y-values.
pub fn write_share_file<P: AsRef<Path>>(
    dir: P,
    replica: usize,
    rows: &[[i64; TUPLE_WIDTH]],
) -> Result<(), OramError> {
    fs::create_dir_all(&dir)?;
    let mut file = fs::File::create(share_file_path(&dir, replica))?;
    for row in rows {
        let line: Vec<String> = row.iter().map(i64::to_string).collect();
        writeln!(file, "{}", line.join("|"))?;
    }
    Ok(())
}

/// Reads a share file written by [`write_share_file`].
pub fn read_share_file<P: AsRef<Path>>(
    dir: P,
    replica: usize,
) -> Result<Vec<[i64; TUPLE_WIDTH]>, OramError> {
    let file = fs::File::open(share_file_path(&dir, replica))?;
    let mut rows = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut row = [0i64; TUPLE_WIDTH];
        let mut fields = 0;
        for (slot, token) in row.iter_mut().zip(line.split('|')) {
            *slot = token.trim().parse().map_err(|_| OramError::Parse {
                reason: format!("bad share value {token:?}"),
            })?;
            fields += 1;
        }
        if fields != TUPLE_WIDTH {
            return Err(OramError::Parse {
                reason: format!("share line has {fields} values, expected {TUPLE_WIDTH}"),
            });
        }
        rows.push(row);
    }
    Ok(rows)
}
