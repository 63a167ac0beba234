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

//! # Dense Equi-Join Hash Index
//!
//! `join-index` builds range-indexed hash tables for equi-joins in a query
//! engine that compiles queries into per-row code. For a predicate
//! `outer.col = inner.col` over a non-nullable integer column, the hash table
//! has one bucket per value in the column's range `[int_min, int_max]`. A key
//! is mapped to its bucket by subtracting `int_min`, thus probes need no hash
//! function and no collision handling.
//!
//! The subsystem consists of three parts:
//!
//! - An eligibility validator that decides whether a predicate can use a dense
//!   hash table. See `JoinHashTable::get_instance`.
//! - A builder that fills the table from the inner column, either sequentially
//!   in host memory or in parallel on a device. See the `strategy` module.
//! - A code emitter that inserts the probe call into the generated per-row
//!   code. See `JoinHashTable::codegen_slot`.
//!
//! # Enabling
//!
//! Dense hash joins are disabled by default. Set
//! `ExecutorConfig::enable_dense_hash_join` to allow them.
//!
//! # Devices
//!
//! Device builds run on the device backend configured in `ExecutorConfig`.
//! The `emulated` backend executes the device kernels on a CPU thread pool.
//! The `cuda` backend requires the `cuda` feature and a CUDA installation that
//! includes `nvcc`.

pub mod analyzer;
pub mod codegen;
pub mod device;
pub mod error;
pub mod executor;
pub mod expression_range;
pub mod join_hash_table;
pub mod runtime;
pub mod storage;
pub mod strategy;

pub use crate::executor::{Executor, ExecutorConfig, JoinTableHandle};
pub use crate::join_hash_table::JoinHashTable;
pub use crate::storage::MemoryLevel;
