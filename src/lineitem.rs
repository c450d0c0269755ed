// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The TPC-H `lineitem` tuple model and its pipe-separated text format.
//!
//! Monetary attributes are held in exact centi-units (hundredths), parsed
//! from their textual form without a float round-trip.

use crate::OramError;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::hash::Hash;
use std::io::BufRead;
use std::str::FromStr;

/// The sixteen `lineitem` attributes, in their authoritative wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
#[allow(missing_docs)]
pub enum Attribute {
    OrderKey = 0,
    PartKey = 1,
    SuppKey = 2,
    LineNumber = 3,
    Quantity = 4,
    ExtendedPrice = 5,
    Discount = 6,
    Tax = 7,
    ReturnFlag = 8,
    LineStatus = 9,
    ShipDate = 10,
    CommitDate = 11,
    ReceiptDate = 12,
    ShipInstruct = 13,
    ShipMode = 14,
    Comment = 15,
}

/// All attributes in wire order.
pub const ATTRIBUTES: [Attribute; 16] = [
    Attribute::OrderKey,
    Attribute::PartKey,
    Attribute::SuppKey,
    Attribute::LineNumber,
    Attribute::Quantity,
    Attribute::ExtendedPrice,
    Attribute::Discount,
    Attribute::Tax,
    Attribute::ReturnFlag,
    Attribute::LineStatus,
    Attribute::ShipDate,
    Attribute::CommitDate,
    Attribute::ReceiptDate,
    Attribute::ShipInstruct,
    Attribute::ShipMode,
    Attribute::Comment,
];

impl Attribute {
    /// The tuple index of this attribute.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The attribute at tuple index `index`.
    pub fn from_index(index: usize) -> Result<Self, OramError> {
        ATTRIBUTES
            .get(index)
            .copied()
            .ok_or(OramError::Query {
                reason: format!("attribute index {index} out of range"),
            })
    }

    /// The query-file name of this attribute.
    pub fn name(self) -> &'static str {
        match self {
            Attribute::OrderKey => "ORDERKEY",
            Attribute::PartKey => "PARTKEY",
            Attribute::SuppKey => "SUPPKEY",
            Attribute::LineNumber => "LINENUMBER",
            Attribute::Quantity => "QUANTITY",
            Attribute::ExtendedPrice => "EXTENDEDPRICE",
            Attribute::Discount => "DISCOUNT",
            Attribute::Tax => "TAX",
            Attribute::ReturnFlag => "RETURNFLAG",
            Attribute::LineStatus => "LINESTATUS",
            Attribute::ShipDate => "SHIPDATE",
            Attribute::CommitDate => "COMMITDATE",
            Attribute::ReceiptDate => "RECEIPTDATE",
            Attribute::ShipInstruct => "SHIPINSTRUCT",
            Attribute::ShipMode => "SHIPMODE",
            Attribute::Comment => "COMMENT",
        }
    }
}

impl FromStr for Attribute {
    type Err = OramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ATTRIBUTES
            .iter()
            .find(|a| a.name() == s)
            .copied()
            .ok_or(OramError::Query {
                reason: format!("unknown attribute {s:?}"),
            })
    }
}

/// One TPC-H `lineitem` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    /// `L_ORDERKEY`.
    pub order_key: i64,
    /// `L_PARTKEY`.
    pub part_key: i64,
    /// `L_SUPPKEY`.
    pub supp_key: i64,
    /// `L_LINENUMBER`.
    pub line_number: i64,
    /// `L_QUANTITY`.
    pub quantity: i64,
    /// `L_EXTENDEDPRICE` in centi-units.
    pub extended_price: i64,
    /// `L_DISCOUNT` in centi-units.
    pub discount: i64,
    /// `L_TAX` in centi-units.
    pub tax: i64,
    /// `L_RETURNFLAG`, a single ASCII character.
    pub return_flag: char,
    /// `L_LINESTATUS`, a single ASCII character.
    pub line_status: char,
    /// `L_SHIPDATE`.
    pub ship_date: NaiveDate,
    /// `L_COMMITDATE`.
    pub commit_date: NaiveDate,
    /// `L_RECEIPTDATE`.
    pub receipt_date: NaiveDate,
    /// `L_SHIPINSTRUCT`.
    pub ship_instruct: String,
    /// `L_SHIPMODE`.
    pub ship_mode: String,
    /// `L_COMMENT`.
    pub comment: String,
}

fn parse_error(field: &str, token: &str) -> OramError {
    OramError::Parse {
        reason: format!("bad {field} value {token:?}"),
    }
}

fn parse_int(field: &str, token: &str) -> Result<i64, OramError> {
    token.trim().parse().map_err(|_| parse_error(field, token))
}

fn parse_flag(field: &str, token: &str) -> Result<char, OramError> {
    let mut chars = token.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c),
        _ => Err(parse_error(field, token)),
    }
}

fn parse_date(field: &str, token: &str) -> Result<NaiveDate, OramError> {
    NaiveDate::parse_from_str(token.trim(), "%Y-%m-%d").map_err(|_| parse_error(field, token))
}

/// Parses a decimal literal into exact centi-units.
///
/// Up to two fractional digits are exact; further digits round half-to-even.
pub fn parse_decimal_centi(token: &str) -> Result<i64, OramError> {
    let token = token.trim();
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(parse_error("decimal", token));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(parse_error("decimal", token));
    }

    let whole: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| parse_error("decimal", token))?
    };
    let mut frac_digits = frac_part.chars();
    let tenths = frac_digits.next().map_or(0, |c| c as i64 - '0' as i64);
    let hundredths = frac_digits.next().map_or(0, |c| c as i64 - '0' as i64);
    let mut centi = whole * 100 + tenths * 10 + hundredths;

    // Round half-to-even on the remaining digits.
    let rest: String = frac_digits.collect();
    if !rest.is_empty() {
        let first = rest.as_bytes()[0] - b'0';
        let tail_nonzero = rest.as_bytes()[1..].iter().any(|&d| d != b'0');
        let round_up = match first.cmp(&5) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => tail_nonzero || centi % 2 == 1,
        };
        if round_up {
            centi += 1;
        }
    }

    Ok(if negative { -centi } else { centi })
}

/// Renders centi-units back to their decimal text form.
pub fn format_decimal_centi(centi: i64) -> String {
    let sign = if centi < 0 { "-" } else { "" };
    let magnitude = centi.unsigned_abs();
    format!("{sign}{}.{:02}", magnitude / 100, magnitude % 100)
}

impl LineItem {
    /// Parses one pipe-separated `lineitem` row.
    pub fn parse(line: &str) -> Result<Self, OramError> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 16 {
            return Err(OramError::Parse {
                reason: format!("expected 16 pipe-separated fields, found {}", fields.len()),
            });
        }
        Ok(Self {
            order_key: parse_int("ORDERKEY", fields[0])?,
            part_key: parse_int("PARTKEY", fields[1])?,
            supp_key: parse_int("SUPPKEY", fields[2])?,
            line_number: parse_int("LINENUMBER", fields[3])?,
            quantity: parse_int("QUANTITY", fields[4])?,
            extended_price: parse_decimal_centi(fields[5])?,
            discount: parse_decimal_centi(fields[6])?,
            tax: parse_decimal_centi(fields[7])?,
            return_flag: parse_flag("RETURNFLAG", fields[8])?,
            line_status: parse_flag("LINESTATUS", fields[9])?,
            ship_date: parse_date("SHIPDATE", fields[10])?,
            commit_date: parse_date("COMMITDATE", fields[11])?,
            receipt_date: parse_date("RECEIPTDATE", fields[12])?,
            ship_instruct: fields[13].trim().to_string(),
            ship_mode: fields[14].trim().to_string(),
            comment: fields[15].trim().to_string(),
        })
    }

    /// Parses every non-empty line of `reader` as a `lineitem` row.
    pub fn parse_all<R: BufRead>(reader: R) -> Result<Vec<Self>, OramError> {
        let mut items = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            items.push(Self::parse(&line)?);
        }
        Ok(items)
    }
}

impl std::fmt::Display for LineItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.order_key,
            self.part_key,
            self.supp_key,
            self.line_number,
            self.quantity,
            format_decimal_centi(self.extended_price),
            format_decimal_centi(self.discount),
            format_decimal_centi(self.tax),
            self.return_flag,
            self.line_status,
            self.ship_date.format("%Y-%m-%d"),
            self.commit_date.format("%Y-%m-%d"),
            self.receipt_date.format("%Y-%m-%d"),
            self.ship_instruct,
            self.ship_mode,
            self.comment,
        )
    }
}

/// Assigns each distinct value a 1-based index in first-seen order.
pub fn index_unique_values<T, I>(values: I) -> HashMap<T, usize>
where
    T: Eq + Hash,
    I: IntoIterator<Item = T>,
{
    let mut map = HashMap::new();
    let mut counter = 1;
    for value in values {
        map.entry(value).or_insert_with(|| {
            let index = counter;
            counter += 1;
            index
        });
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ROW: &str = crate::test_utils::SAMPLE_ROW;

    #[test]
    fn parses_the_canonical_row() {
        let item = LineItem::parse(SAMPLE_ROW).unwrap();
        assert_eq!(item.order_key, 1);
        assert_eq!(item.part_key, 155_190);
        assert_eq!(item.quantity, 17);
        assert_eq!(item.extended_price, 2_116_823);
        assert_eq!(item.discount, 4);
        assert_eq!(item.tax, 2);
        assert_eq!(item.return_flag, 'N');
        assert_eq!(item.line_status, 'O');
        assert_eq!(
            item.ship_date,
            NaiveDate::from_ymd_opt(1996, 3, 13).unwrap()
        );
        assert_eq!(item.ship_mode, "TRUCK");
    }

    #[test]
    fn display_round_trips() {
        let item = LineItem::parse(SAMPLE_ROW).unwrap();
        assert_eq!(LineItem::parse(&item.to_string()).unwrap(), item);
    }

    #[test]
    fn decimal_parsing_is_exact() {
        assert_eq!(parse_decimal_centi("21168.23").unwrap(), 2_116_823);
        assert_eq!(parse_decimal_centi("0.04").unwrap(), 4);
        assert_eq!(parse_decimal_centi("17").unwrap(), 1700);
        assert_eq!(parse_decimal_centi("3.5").unwrap(), 350);
        assert_eq!(parse_decimal_centi("-2.50").unwrap(), -250);
    }

    #[test]
    fn decimal_parsing_rounds_half_even() {
        assert_eq!(parse_decimal_centi("1.005").unwrap(), 100);
        assert_eq!(parse_decimal_centi("1.015").unwrap(), 102);
        assert_eq!(parse_decimal_centi("1.0051").unwrap(), 101);
        assert_eq!(parse_decimal_centi("1.0049").unwrap(), 100);
        assert!(parse_decimal_centi("abc").is_err());
        assert!(parse_decimal_centi("1.2.3").is_err());
    }

    #[test]
    fn attribute_names_match_indices() {
        for (index, attribute) in ATTRIBUTES.iter().enumerate() {
            assert_eq!(attribute.index(), index);
            assert_eq!(Attribute::from_index(index).unwrap(), *attribute);
            assert_eq!(attribute.name().parse::<Attribute>().unwrap(), *attribute);
        }
        assert!("SHIPPINGDATE".parse::<Attribute>().is_err());
        assert!(Attribute::from_index(16).is_err());
    }

    #[test]
    fn unique_value_indexing_preserves_first_seen_order() {
        let map = index_unique_values(["N", "O", "N", "R", "O"]);
        assert_eq!(map["N"], 1);
        assert_eq!(map["O"], 2);
        assert_eq!(map["R"], 3);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn parse_all_skips_blank_lines() {
        let input = format!("{SAMPLE_ROW}\n\n{SAMPLE_ROW}\n");
        let items = LineItem::parse_all(input.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
    }
}
