// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Dense equi-join hash tables.
//!
//! A join hash table indexes the inner column of an equality predicate
//! `outer.col = inner.col`. Instead of hashing, the key itself is the bucket
//! offset relative to the smallest key of the inner column. This is only
//! possible if the inner column is a non-nullable integer with a bounded range,
//! and the inner table consists of a single fragment.
//!
//! `JoinHashTable::get_instance` checks these conditions before allocating any
//! memory. A predicate that fails a check, or a table that fails to build,
//! yields `Ok(None)`. The caller then falls back to another join
//! implementation.

use crate::analyzer::{BinOper, ColumnVar, OpType};
use crate::codegen::{CgenState, RuntimeFunction, Value};
use crate::error::{ErrorKind, Result};
use crate::executor::{Executor, JoinTableHandle};
use crate::expression_range::ExpressionRange;
use crate::runtime::FILL_OK;
use crate::storage::{BufferProvider, ChunkKey, MemoryLevel, QueryInfo};
use crate::strategy::{BuildStrategy, FillRequest, TableStorage};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;

/// A built dense hash table over the inner column of an equi-join.
pub struct JoinHashTable {
    col_var: ColumnVar,
    memory_level: MemoryLevel,
    col_range: ExpressionRange,
    bucket_count: usize,
    row_count: usize,
    strategy: Arc<dyn BuildStrategy>,
    storage: TableStorage,
    handle: JoinTableHandle,
}

/// An inner column that passed all eligibility checks.
struct Candidate {
    col_var: ColumnVar,
    col_range: ExpressionRange,
    bucket_count: usize,
}

/// A hash table that is built, but not yet registered.
struct Reified {
    storage: TableStorage,
    row_count: usize,
}

impl JoinHashTable {
    /// Builds a join hash table for `qual_bin_oper`, if possible.
    ///
    /// Returns `Ok(None)` if the predicate is not eligible for a dense hash
    /// join, or if the build failed. Returns an error on a configuration fault
    /// or an inconsistency in the storage layer.
    pub fn get_instance(
        qual_bin_oper: &BinOper,
        storage: &dyn BufferProvider,
        query_infos: &[QueryInfo],
        memory_level: MemoryLevel,
        executor: &Executor,
    ) -> Result<Option<Arc<JoinHashTable>>> {
        let candidate = match Self::validate(qual_bin_oper, query_infos, executor) {
            Some(candidate) => candidate,
            None => return Ok(None),
        };

        let strategy = executor.strategy_for(memory_level)?;
        let reified = match Self::reify(&candidate, storage, query_infos, strategy.as_ref()) {
            Ok(reified) => reified,
            Err(e) => {
                if let ErrorKind::BuildFailure(code) = *e.kind() {
                    warn!(
                        "Join hash table build on {} failed with error code {}",
                        memory_level, code
                    );
                    return Ok(None);
                }
                return Err(e);
            }
        };

        let Candidate {
            col_var,
            col_range,
            bucket_count,
        } = candidate;
        let table = executor.register_join_table(|handle| JoinHashTable {
            col_var,
            memory_level,
            col_range,
            bucket_count,
            row_count: reified.row_count,
            strategy,
            storage: reified.storage,
            handle,
        })?;

        info!(
            "Built join hash table {} on {} for keys [{}, {}] with {} buckets and {} rows",
            table.handle,
            table.memory_level,
            table.col_range.int_min,
            table.col_range.int_max,
            table.bucket_count,
            table.row_count
        );

        Ok(Some(table))
    }

    fn validate(
        qual_bin_oper: &BinOper,
        query_infos: &[QueryInfo],
        executor: &Executor,
    ) -> Option<Candidate> {
        if !executor.config().enable_dense_hash_join {
            debug!("Dense hash join is disabled");
            return None;
        }

        if qual_bin_oper.optype != OpType::Eq {
            debug!("Rejected {:?} predicate, only equality is supported", qual_bin_oper.optype);
            return None;
        }

        let lhs = qual_bin_oper.left_operand();
        let rhs = qual_bin_oper.right_operand();
        if lhs.type_info() != rhs.type_info() {
            debug!(
                "Rejected predicate with operand types {:?} and {:?}",
                lhs.type_info(),
                rhs.type_info()
            );
            return None;
        }

        let (lhs_col, rhs_col) = match (lhs.as_column_var(), rhs.as_column_var()) {
            (Some(l), Some(r)) => (l, r),
            _ => {
                debug!("Rejected predicate, both operands must be columns");
                return None;
            }
        };

        let inner = match (lhs_col.rte_idx, rhs_col.rte_idx) {
            (0, 1) => rhs_col,
            (1, 0) => lhs_col,
            (l, r) => {
                debug!("Rejected predicate over row ranges {} and {}", l, r);
                return None;
            }
        };

        if !inner.type_info.is_integer() {
            debug!(
                "Rejected inner column of type {:?}, only integers are supported",
                inner.type_info.sql_type
            );
            return None;
        }

        let col_range = executor.range_analyzer().range_of(inner, query_infos);
        if col_range.has_nulls {
            debug!("Rejected nullable inner column {}", inner.column_id);
            return None;
        }
        if col_range.is_empty() {
            debug!("Rejected inner column {} with an empty range", inner.column_id);
            return None;
        }

        let max_bucket_count = executor.config().max_bucket_count;
        let width = col_range.width();
        if width > max_bucket_count as u128 {
            debug!(
                "Rejected key range [{}, {}], exceeds {} buckets",
                col_range.int_min, col_range.int_max, max_bucket_count
            );
            return None;
        }

        Some(Candidate {
            col_var: inner.clone(),
            col_range,
            bucket_count: width as usize,
        })
    }

    fn reify(
        candidate: &Candidate,
        storage: &dyn BufferProvider,
        query_infos: &[QueryInfo],
        strategy: &dyn BuildStrategy,
    ) -> Result<Reified> {
        let col_var = &candidate.col_var;
        let memory_level = strategy.memory_level();

        let query_info = query_infos.get(col_var.rte_idx).ok_or_else(|| {
            ErrorKind::InvariantViolation(format!(
                "No query info for row range {}",
                col_var.rte_idx
            ))
        })?;
        // Multi-fragment inner tables aren't supported
        if query_info.fragments.len() != 1 {
            return Err(ErrorKind::BuildFailure(-1).into());
        }
        let fragment = &query_info.fragments[0];

        let chunk_meta = fragment
            .chunk_metadata
            .get(&col_var.column_id)
            .ok_or_else(|| {
                ErrorKind::InvariantViolation(format!(
                    "Fragment {} has no metadata for column {}",
                    fragment.fragment_id, col_var.column_id
                ))
            })?;

        let cd = storage
            .column_descriptor(col_var.table_id, col_var.column_id)
            .ok_or_else(|| {
                ErrorKind::InvariantViolation(format!(
                    "Column {} of table {} doesn't exist",
                    col_var.column_id, col_var.table_id
                ))
            })?;
        if cd.is_virtual {
            return Err(ErrorKind::InvariantViolation(format!(
                "Column {} of table {} is virtual",
                cd.column_id, cd.table_id
            ))
            .into());
        }

        let device_id = match memory_level {
            MemoryLevel::Host => 0,
            MemoryLevel::Device => fragment.device_ids[memory_level.index()],
        };
        let chunk_key = ChunkKey {
            db_id: storage.db_id(),
            table_id: col_var.table_id,
            column_id: col_var.column_id,
            fragment_id: fragment.fragment_id,
        };

        let buffer = storage
            .buffer_for(
                &cd,
                &chunk_key,
                memory_level,
                device_id,
                chunk_meta.num_bytes,
                chunk_meta.num_elements,
            )?
            .ok_or_else(|| {
                ErrorKind::InvariantViolation(format!("Chunk {:?} has no buffer", chunk_key))
            })?;
        if buffer.memory_level() != memory_level {
            return Err(ErrorKind::InvariantViolation(format!(
                "Chunk {:?} resides in {} memory, expected {} memory",
                chunk_key,
                buffer.memory_level(),
                memory_level
            ))
            .into());
        }

        let request = FillRequest {
            column: &buffer,
            row_count: chunk_meta.num_elements,
            value_size: col_var.type_info.size(),
            int_min: candidate.col_range.int_min,
            bucket_count: candidate.bucket_count,
            device_id,
        };
        let built = strategy.build(&request)?;
        if built.error_code != FILL_OK {
            return Err(ErrorKind::BuildFailure(built.error_code).into());
        }

        Ok(Reified {
            storage: built.storage,
            row_count: chunk_meta.num_elements,
        })
    }

    /// Emits the probe of `key` into the generated code.
    ///
    /// The returned value is the head row id of the matching inner rows, or
    /// `NO_MATCH`.
    pub fn codegen_slot(&self, key: Value, cgen: &mut CgenState) -> Value {
        let table = cgen.ll_int(i64::from(self.handle.0));
        let int_min = cgen.ll_int(self.col_range.int_min);
        let int_max = cgen.ll_int(self.col_range.int_max);

        cgen.emit_call(RuntimeFunction::HashJoinIdx, vec![table, key, int_min, int_max])
    }

    /// Returns the head row id for `key`, or `NO_MATCH`.
    pub fn probe(&self, key: i64) -> Result<i64> {
        self.probe_within(key, self.col_range.int_min, self.col_range.int_max)
    }

    pub(crate) fn probe_within(&self, key: i64, int_min: i64, int_max: i64) -> Result<i64> {
        self.strategy.probe(&self.storage, key, int_min, int_max)
    }

    /// Returns every inner row id whose key equals `key`.
    pub fn matches(&self, key: i64) -> Result<Vec<i64>> {
        self.strategy.matches(
            &self.storage,
            key,
            self.col_range.int_min,
            self.col_range.int_max,
        )
    }

    pub fn handle(&self) -> JoinTableHandle {
        self.handle
    }

    pub fn inner_col_var(&self) -> &ColumnVar {
        &self.col_var
    }

    pub fn memory_level(&self) -> MemoryLevel {
        self.memory_level
    }

    pub fn col_range(&self) -> ExpressionRange {
        self.col_range
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Memory occupied by the hash table.
    pub fn len_bytes(&self) -> usize {
        self.storage.len_bytes()
    }

    /// Copies the bucket array and the row chain into host memory.
    pub fn download(&self) -> Result<(Vec<i64>, Vec<i64>)> {
        self.storage.download()
    }
}

impl fmt::Debug for JoinHashTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHashTable")
            .field("handle", &self.handle)
            .field("col_var", &self.col_var)
            .field("memory_level", &self.memory_level)
            .field("col_range", &self.col_range)
            .field("bucket_count", &self.bucket_count)
            .field("row_count", &self.row_count)
            .finish()
    }
}
