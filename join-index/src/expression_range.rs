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

//! Value ranges of integer columns.

use crate::analyzer::ColumnVar;
use crate::storage::QueryInfo;

/// The observed integer range of an expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpressionRange {
    pub int_min: i64,
    pub int_max: i64,
    pub has_nulls: bool,
}

impl ExpressionRange {
    /// A range that contains no values.
    pub fn empty() -> Self {
        Self {
            int_min: 0,
            int_max: -1,
            has_nulls: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.int_min > self.int_max
    }

    /// Number of distinct integers in the range.
    pub fn width(&self) -> u128 {
        if self.is_empty() {
            0
        } else {
            (self.int_max as i128 - self.int_min as i128 + 1) as u128
        }
    }

    /// Smallest range that covers both ranges.
    pub fn union(&self, other: &Self) -> Self {
        let has_nulls = self.has_nulls || other.has_nulls;
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Self {
                has_nulls,
                ..Self::empty()
            },
            (true, false) => Self { has_nulls, ..*other },
            (false, true) => Self { has_nulls, ..*self },
            (false, false) => Self {
                int_min: self.int_min.min(other.int_min),
                int_max: self.int_max.max(other.int_max),
                has_nulls,
            },
        }
    }
}

/// Determines the value range of a column.
pub trait RangeAnalyzer: Send + Sync {
    /// Returns the range of `col` within the fragments scanned by the query.
    ///
    /// `query_infos` is indexed by row-range identifier.
    fn range_of(&self, col: &ColumnVar, query_infos: &[QueryInfo]) -> ExpressionRange;
}

/// Derives column ranges from fragment statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct FragmentStatsRange;

impl RangeAnalyzer for FragmentStatsRange {
    fn range_of(&self, col: &ColumnVar, query_infos: &[QueryInfo]) -> ExpressionRange {
        query_infos
            .get(col.rte_idx)
            .map(|info| {
                info.fragments
                    .iter()
                    .filter_map(|fragment| fragment.chunk_metadata.get(&col.column_id))
                    .map(|meta| ExpressionRange {
                        int_min: meta.stats.min,
                        int_max: meta.stats.max,
                        has_nulls: meta.stats.has_nulls,
                    })
                    .fold(ExpressionRange::empty(), |acc, range| acc.union(&range))
            })
            .unwrap_or_else(ExpressionRange::empty)
    }
}
