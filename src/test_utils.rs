// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common utilities for tests and benchmarks of the ORAM engine.

#![allow(clippy::needless_range_loop)]

use crate::integrity::KeyMaterial;
use crate::lineitem::LineItem;
use crate::path_oram::PathOram;
use crate::storage::InMemoryStorage;
use crate::{BlockId, OramConfig, KEY_SIZE};
use chrono::{Days, NaiveDate};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Once;

/// The canonical TPC-H lineitem row used across tests.
pub const SAMPLE_ROW: &str = "1|155190|7706|1|17|21168.23|0.04|0.02|N|O|1996-03-13|1996-02-12|1996-03-22|DELIVER IN PERSON|TRUCK|egular courts above the";

static LOGGER: Once = Once::new();

/// Installs a terminal logger once per process so test failures come with
/// protocol context.
pub fn init_test_logging() {
    LOGGER.call_once(|| {
        let _ = simplelog::SimpleLogger::init(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
        );
    });
}

/// An in-memory ORAM with a fixed key, for unit tests and benches.
pub fn test_oram(config: OramConfig, seed: u64) -> PathOram<InMemoryStorage, StdRng> {
    let storage = InMemoryStorage::new(
        config.storage_slots(),
        config.block_size,
        config.bucket_size,
    );
    PathOram::new(
        config,
        storage,
        KeyMaterial::from_bytes([0x13; KEY_SIZE]),
        StdRng::seed_from_u64(seed),
    )
    .expect("test ORAM construction")
}

/// Runs a random read/write workload against a mirror map, asserting that
/// every read returns the mirrored value and that the stash stays within its
/// bound.
pub fn random_workload<S, R>(
    oram: &mut PathOram<S, R>,
    universe: BlockId,
    operations: usize,
    seed: u64,
) where
    S: crate::storage::StorageAdapter,
    R: rand::RngCore + rand::CryptoRng,
{
    let payload_width = 32.min(oram.config().block_size);
    let stash_bound = oram.config().stash_capacity();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut mirror: HashMap<BlockId, Vec<u8>> = HashMap::new();

    for _ in 0..operations {
        let block = rng.gen_range(0..universe);
        if rng.gen_bool(0.5) {
            let mut data = vec![0u8; payload_width];
            rng.fill(&mut data[..]);
            oram.put(block, &data).expect("workload put");
            mirror.insert(block, data);
        } else {
            let read = oram.get(block).expect("workload get");
            match mirror.get(&block) {
                Some(expected) => assert_eq!(&read[..payload_width], &expected[..]),
                None => assert!(read.is_empty()),
            }
        }
        assert!(
            oram.stash_occupancy() <= stash_bound,
            "stash occupancy {} exceeds bound {stash_bound}",
            oram.stash_occupancy()
        );
    }

    for (&block, expected) in &mirror {
        let read = oram.get(block).expect("workload verification get");
        assert_eq!(&read[..payload_width], &expected[..], "{block}");
    }
}

const RETURN_FLAGS: [char; 3] = ['N', 'R', 'A'];
const LINE_STATUSES: [char; 2] = ['O', 'F'];
const SHIP_INSTRUCTS: [&str; 4] = [
    "DELIVER IN PERSON",
    "COLLECT COD",
    "NONE",
    "TAKE BACK RETURN",
];
const SHIP_MODES: [&str; 7] = ["TRUCK", "MAIL", "SHIP", "AIR", "RAIL", "REG AIR", "FOB"];

/// Deterministically generates `count` plausible lineitem rows.
pub fn sample_lineitems(count: usize) -> Vec<LineItem> {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let epoch = NaiveDate::from_ymd_opt(1995, 1, 1).expect("valid date");
    (0..count)
        .map(|i| {
            let quantity = rng.gen_range(1..=50i64);
            let unit_price_centi = rng.gen_range(90_000..=105_000i64);
            let ship = epoch + Days::new(rng.gen_range(0..700));
            LineItem {
                order_key: i as i64 + 1,
                part_key: rng.gen_range(1..=200_000),
                supp_key: rng.gen_range(1..=10_000),
                line_number: (i as i64 % 7) + 1,
                quantity,
                extended_price: quantity * unit_price_centi,
                discount: rng.gen_range(0..=10),
                tax: rng.gen_range(0..=8),
                return_flag: RETURN_FLAGS[rng.gen_range(0..RETURN_FLAGS.len())],
                line_status: LINE_STATUSES[rng.gen_range(0..LINE_STATUSES.len())],
                ship_date: ship,
                commit_date: ship + Days::new(rng.gen_range(1..60)),
                receipt_date: ship + Days::new(rng.gen_range(1..30)),
                ship_instruct: SHIP_INSTRUCTS[rng.gen_range(0..SHIP_INSTRUCTS.len())].to_string(),
                ship_mode: SHIP_MODES[rng.gen_range(0..SHIP_MODES.len())].to_string(),
                comment: format!("generated row {i}"),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rows_parse_back_from_display() {
        for item in sample_lineitems(20) {
            assert_eq!(LineItem::parse(&item.to_string()).unwrap(), item);
        }
    }

    #[test]
    fn sample_generation_is_deterministic() {
        assert_eq!(sample_lineitems(10), sample_lineitems(10));
    }
}
