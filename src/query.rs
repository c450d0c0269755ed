// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Aggregate query plans and their share-domain evaluation.
//!
//! A query file carries the plaintext-free form of a query: the aggregate,
//! the selected attribute, and per-filter equality conditions already
//! translated into one share per replica (`shareID.id_j` is the Y-coordinate
//! replica `j + 1` compares against). Evaluation streams every used block out
//! of the ORAM and never reconstructs a secret.

use crate::container::TUPLE_WIDTH;
use crate::encoder::ShareEncoder;
use crate::lineitem::Attribute;
use crate::path_oram::PathOram;
use crate::storage::StorageAdapter;
use crate::{BlockId, OramError};
use log::{debug, error, info};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;

/// The aggregate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateOp {
    /// The query-file name of this operator.
    pub fn name(self) -> &'static str {
        match self {
            AggregateOp::Count => "COUNT",
            AggregateOp::Sum => "SUM",
            AggregateOp::Avg => "AVG",
            AggregateOp::Min => "MIN",
            AggregateOp::Max => "MAX",
        }
    }

    /// Whether evaluation emits the matching tuples for client-side
    /// reconstruction (everything except COUNT).
    pub fn emits_tuples(self) -> bool {
        !matches!(self, AggregateOp::Count)
    }
}

impl FromStr for AggregateOp {
    type Err = OramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COUNT" => Ok(AggregateOp::Count),
            "SUM" => Ok(AggregateOp::Sum),
            "AVG" => Ok(AggregateOp::Avg),
            "MIN" => Ok(AggregateOp::Min),
            "MAX" => Ok(AggregateOp::Max),
            other => Err(OramError::Query {
                reason: format!("unknown aggregate {other:?}"),
            }),
        }
    }
}

/// How multiple filters combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Junction {
    And,
    Or,
}

impl FromStr for Junction {
    type Err = OramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AND" => Ok(Junction::And),
            "OR" => Ok(Junction::Or),
            other => Err(OramError::Query {
                reason: format!("unknown where clause {other:?}"),
            }),
        }
    }
}

/// One `select` entry of a query file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectClause {
    /// Aggregate name: COUNT, SUM, AVG, MIN, or MAX.
    pub query_type: String,
    /// The selected attribute's name.
    pub attribute: String,
    /// Free-form output variable label.
    pub variable: String,
}

/// One `filters` entry of a query file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterClause {
    /// The filtered attribute's name.
    pub attribute: String,
    /// The plaintext condition literal, retained for display only.
    pub condition: String,
    /// AND or OR.
    #[serde(rename = "whereClause")]
    pub where_clause: String,
    /// Per-replica share of the condition: key `id_j` belongs to replica `j + 1`.
    #[serde(rename = "shareID")]
    pub share_id: BTreeMap<String, i64>,
}

/// The JSON query file of §external-interfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFile {
    /// Exactly one aggregate per query.
    pub select: Vec<SelectClause>,
    /// Zero or more equality filters.
    pub filters: Vec<FilterClause>,
}

impl QueryFile {
    /// Parses a query file from JSON text.
    pub fn from_json(text: &str) -> Result<Self, OramError> {
        serde_json::from_str(text).map_err(|e| OramError::Query {
            reason: format!("query file does not parse: {e}"),
        })
    }

    /// Serializes this query file to pretty JSON.
    pub fn to_json(&self) -> Result<String, OramError> {
        serde_json::to_string_pretty(self).map_err(|e| OramError::Query {
            reason: format!("query file does not serialize: {e}"),
        })
    }

    /// Builds a query file at the trusted client: each filter condition is
    /// normalized and split into one share per replica with `encoder`.
    pub fn build(
        op: AggregateOp,
        select: Attribute,
        junction: Junction,
        filters: &[(Attribute, &str)],
        encoder: &ShareEncoder,
    ) -> Result<Self, OramError> {
        let mut filter_clauses = Vec::with_capacity(filters.len());
        for (attribute, literal) in filters {
            let secret = crate::encoder::normalize_literal(*attribute, literal)?;
            let mut share_id = BTreeMap::new();
            for replica in 1..=encoder.scheme().share_count() {
                share_id.insert(
                    format!("id_{}", replica - 1),
                    encoder.share_for_condition(*attribute, secret, replica)?,
                );
            }
            filter_clauses.push(FilterClause {
                attribute: attribute.name().to_string(),
                condition: literal.to_string(),
                where_clause: match junction {
                    Junction::And => "AND".to_string(),
                    Junction::Or => "OR".to_string(),
                },
                share_id,
            });
        }
        Ok(Self {
            select: vec![SelectClause {
                query_type: op.name().to_string(),
                attribute: select.name().to_string(),
                variable: select.name().to_lowercase(),
            }],
            filters: filter_clauses,
        })
    }
}

/// A query resolved against one replica: conditions are that replica's shares.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// The aggregate to compute.
    pub op: AggregateOp,
    /// The attribute the aggregate ranges over.
    pub select: Attribute,
    /// `(attribute, condition-share)` equality tests.
    pub filters: Vec<(Attribute, i64)>,
    /// How the filters combine.
    pub junction: Junction,
}

impl QueryPlan {
    /// Resolves `file` for `replica` (1-based).
    pub fn for_replica(file: &QueryFile, replica: usize) -> Result<Self, OramError> {
        let select_clause = file.select.first().ok_or(OramError::Query {
            reason: "query file has no select clause".to_string(),
        })?;
        let op = select_clause.query_type.parse()?;
        let select = select_clause.attribute.parse()?;

        let id_key = format!("id_{}", replica.wrapping_sub(1));
        let mut filters = Vec::with_capacity(file.filters.len());
        let mut junction = None;
        for clause in &file.filters {
            let attribute: Attribute = clause.attribute.parse()?;
            let share = clause.share_id.get(&id_key).ok_or(OramError::Query {
                reason: format!("filter on {} lacks {id_key}", clause.attribute),
            })?;
            filters.push((attribute, *share));

            let clause_junction: Junction = clause.where_clause.parse()?;
            match junction {
                None => junction = Some(clause_junction),
                Some(existing) if existing != clause_junction => {
                    return Err(OramError::Query {
                        reason: "filters disagree on the where clause".to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            op,
            select,
            filters,
            junction: junction.unwrap_or(Junction::And),
        })
    }

    /// Whether `tuple` satisfies the filter conjunction/disjunction.
    pub fn matches(&self, tuple: &[i64; TUPLE_WIDTH]) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        match self.junction {
            Junction::And => self
                .filters
                .iter()
                .all(|(attribute, share)| tuple[attribute.index()] == *share),
            Junction::Or => self
                .filters
                .iter()
                .any(|(attribute, share)| tuple[attribute.index()] == *share),
        }
    }
}

/// What one replica's evaluation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Number of tuples satisfying the predicate.
    pub matched: u64,
    /// Number of tuples streamed to the result sink.
    pub rows_written: u64,
}

/// Evaluates `plan` over every used block of `oram`, streaming matching
/// tuples (for tuple-emitting aggregates) to `sink` as lines of 16
/// pipe-separated share values.
///
/// A failure on any block halts the query; the offending block id is logged.
pub fn evaluate<S, R, W>(
    oram: &mut PathOram<S, R>,
    plan: &QueryPlan,
    sink: &mut W,
) -> Result<QueryOutcome, OramError>
where
    S: StorageAdapter,
    R: RngCore + CryptoRng,
    W: Write,
{
    let blocks: Vec<BlockId> = oram.used_block_ids().iter().copied().collect();
    info!(
        "evaluating {} over {} blocks with {} filters",
        plan.op.name(),
        blocks.len(),
        plan.filters.len()
    );

    let mut outcome = QueryOutcome {
        matched: 0,
        rows_written: 0,
    };
    for block in blocks {
        let container = match oram.get_container(block) {
            Ok(container) => container,
            Err(e) => {
                error!("query halted at block {block}: {e}");
                return Err(e);
            }
        };
        debug!("block {block}: {} tuples", container.len());

        for tuple in &container {
            if !plan.matches(tuple) {
                continue;
            }
            outcome.matched += 1;
            if plan.op.emits_tuples() {
                let line: Vec<String> = tuple.iter().map(i64::to_string).collect();
                writeln!(sink, "{}", line.join("|"))?;
                outcome.rows_written += 1;
            }
        }
    }
    sink.flush()?;
    Ok(outcome)
}
