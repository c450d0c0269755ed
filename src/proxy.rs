// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The trusted proxy: the single client-side owner of one ORAM per replica.
//!
//! Ingest encodes typed tuples into per-replica share vectors, groups them
//! into containers of at most 1000 tuples, and writes container `c` to block
//! id `c` on every replica. Queries resolve a query file into one plan per
//! replica and stream that replica's ORAM. All replica state round-trips
//! through a [`BackupDir`].

use crate::backup::{backup_replica, restore_replica, BackupDir};
use crate::container::{Container, MAX_TUPLES_PER_CONTAINER};
use crate::encoder::{write_share_file, ShareEncoder};
use crate::integrity::KeyMaterial;
use crate::lineitem::LineItem;
use crate::path_oram::PathOram;
use crate::query::{evaluate, QueryFile, QueryOutcome, QueryPlan};
use crate::shamir::ShareScheme;
use crate::storage::FileStorage;
use crate::{BlockId, OramConfig, OramError, KEY_SIZE};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::io::BufWriter;
use std::path::Path;

/// The client-side owner composing the share encoder and the replica ORAMs.
pub struct TrustedProxy {
    config: OramConfig,
    encoder: ShareEncoder,
    replicas: Vec<PathOram<FileStorage, StdRng>>,
    dir: BackupDir,
    next_block: BlockId,
    tuples_ingested: usize,
}

impl TrustedProxy {
    /// Creates a fresh proxy with one empty ORAM per replica under
    /// `backup_root`, sized for `expected_tuples` tuples.
    pub fn create<P: AsRef<Path>>(
        backup_root: P,
        share_key: [u8; KEY_SIZE],
        expected_tuples: usize,
    ) -> Result<Self, OramError> {
        let config = OramConfig::for_tuple_count(expected_tuples)?;
        let dir = BackupDir::new(backup_root)?;
        let encoder = ShareEncoder::new(ShareScheme::with_default_parameters(share_key));

        let mut replicas = Vec::with_capacity(encoder.scheme().share_count());
        for replica in 1..=encoder.scheme().share_count() {
            let key = KeyMaterial::load_or_generate(dir.key_file(replica))?;
            let storage = FileStorage::new(
                dir.storage_file(replica),
                config.storage_slots(),
                config.block_size,
                config.bucket_size,
                key.as_bytes(),
                true,
            )?;
            replicas.push(PathOram::new(
                config,
                storage,
                key,
                StdRng::from_entropy(),
            )?);
        }

        info!(
            "proxy: {} replicas initialized, tree height {}",
            replicas.len(),
            config.height
        );
        Ok(Self {
            config,
            encoder,
            replicas,
            dir,
            next_block: 0,
            tuples_ingested: 0,
        })
    }

    /// Reassembles a proxy from a backup directory written by
    /// [`TrustedProxy::backup`]. The share key is client-side state and is
    /// supplied again by the caller.
    pub fn restore<P: AsRef<Path>>(
        backup_root: P,
        share_key: [u8; KEY_SIZE],
    ) -> Result<Self, OramError> {
        let dir = BackupDir::new(backup_root)?;
        let tuples = dir.read_tuple_count()?;
        // The storage header is authoritative for the tree dimensions; the
        // tuple count alone cannot recover them when ingest ran in batches
        // smaller than the container packing bound.
        let slots = dir.read_storage_slots(1)?;
        let bucket_count = slots.saturating_sub(crate::DEFAULT_BUCKET_SIZE as u64) + 1;
        if !bucket_count.is_power_of_two() {
            return Err(OramError::Configuration {
                reason: format!("storage header reports {slots} slots, not a valid tree size"),
            });
        }
        let config = OramConfig::with_height(bucket_count.ilog2())?;
        let encoder = ShareEncoder::new(ShareScheme::with_default_parameters(share_key));

        let mut replicas = Vec::with_capacity(encoder.scheme().share_count());
        let mut next_block = 0;
        for replica in 1..=encoder.scheme().share_count() {
            let oram = restore_replica(&dir, replica, config, StdRng::from_entropy())?;
            if let Some(last) = oram.used_block_ids().iter().next_back() {
                next_block = next_block.max(last + 1);
            }
            replicas.push(oram);
        }

        Ok(Self {
            config,
            encoder,
            replicas,
            dir,
            next_block,
            tuples_ingested: tuples,
        })
    }

    /// This proxy's ORAM configuration.
    pub fn config(&self) -> &OramConfig {
        &self.config
    }

    /// The share encoder (query files are built against its scheme).
    pub fn encoder(&self) -> &ShareEncoder {
        &self.encoder
    }

    /// Number of replicas.
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Number of tuples ingested so far.
    pub fn tuples_ingested(&self) -> usize {
        self.tuples_ingested
    }

    /// Mutable access to one replica's ORAM (1-based), for direct inspection.
    pub fn replica_mut(&mut self, replica: usize) -> Result<&mut PathOram<FileStorage, StdRng>, OramError> {
        let count = self.replicas.len();
        self.replicas
            .get_mut(replica.wrapping_sub(1))
            .ok_or(OramError::Configuration {
                reason: format!("replica {replica} out of range 1..={count}"),
            })
    }

    /// Encodes and stores `items` on every replica. Each call packs its
    /// items into fresh containers; containers are not merged across calls.
    pub fn ingest(&mut self, items: &[LineItem]) -> Result<(), OramError> {
        for chunk in items.chunks(MAX_TUPLES_PER_CONTAINER) {
            let mut containers: Vec<Container> =
                vec![Container::with_capacity(chunk.len()); self.replicas.len()];
            for item in chunk {
                let rows = self.encoder.encode(item)?;
                for (container, row) in containers.iter_mut().zip(rows) {
                    container.push(row);
                }
            }

            let block = self.next_block;
            for (oram, container) in self.replicas.iter_mut().zip(&containers) {
                oram.put_container(block, container)?;
            }
            self.next_block += 1;
        }

        self.tuples_ingested += items.len();
        self.dir.write_tuple_count(self.tuples_ingested)?;
        info!(
            "ingested {} tuples ({} total) into {} containers",
            items.len(),
            self.tuples_ingested,
            items.len().div_ceil(MAX_TUPLES_PER_CONTAINER)
        );
        Ok(())
    }

    /// Re-encodes `items` and writes one share file per replica under
    /// `shares_dir`. The encoder is deterministic, so the files match what
    /// was ingested.
    pub fn export_share_files<P: AsRef<Path>>(
        &self,
        shares_dir: P,
        items: &[LineItem],
    ) -> Result<(), OramError> {
        let mut per_replica = vec![Vec::with_capacity(items.len()); self.replicas.len()];
        for item in items {
            let rows = self.encoder.encode(item)?;
            for (out, row) in per_replica.iter_mut().zip(rows) {
                out.push(row);
            }
        }
        for (index, rows) in per_replica.iter().enumerate() {
            write_share_file(&shares_dir, index + 1, rows)?;
        }
        Ok(())
    }

    /// Evaluates `file` on one replica, streaming matching tuples to `sink`.
    pub fn query<W: std::io::Write>(
        &mut self,
        file: &QueryFile,
        replica: usize,
        sink: &mut W,
    ) -> Result<QueryOutcome, OramError> {
        let plan = QueryPlan::for_replica(file, replica)?;
        let oram = self.replica_mut(replica)?;
        evaluate(oram, &plan, sink)
    }

    /// Evaluates `file` on every replica, writing `server_{i}.txt` result
    /// files under `result_dir`. Outcomes come back in replica order.
    pub fn query_to_files<P: AsRef<Path>>(
        &mut self,
        file: &QueryFile,
        result_dir: P,
    ) -> Result<Vec<QueryOutcome>, OramError> {
        fs::create_dir_all(&result_dir)?;
        let mut outcomes = Vec::with_capacity(self.replicas.len());
        for replica in 1..=self.replicas.len() {
            let path = result_dir
                .as_ref()
                .join(format!("server_{replica}.txt"));
            let mut sink = BufWriter::new(fs::File::create(path)?);
            outcomes.push(self.query(file, replica, &mut sink)?);
        }
        Ok(outcomes)
    }

    /// Writes every replica's client-side state into the backup directory.
    pub fn backup(&mut self) -> Result<(), OramError> {
        for replica in 1..=self.replicas.len() {
            backup_replica(&self.replicas[replica - 1], &self.dir, replica)?;
        }
        self.dir.write_tuple_count(self.tuples_ingested)?;
        Ok(())
    }
}
