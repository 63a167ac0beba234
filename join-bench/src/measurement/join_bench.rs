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

use crate::error::{ErrorKind, Result};
use crate::types::ArgInnerDistribution;
use datagen::relation::{DenseKeyRelation, KeyAttribute, ProbeKeyRelation};
use join_index::analyzer::{BinOper, ColumnVar, OpType, SqlType, TypeInfo};
use join_index::codegen::RowEvaluator;
use join_index::executor::{DeviceCapability, Executor, ExecutorConfig};
use join_index::runtime::NO_MATCH;
use join_index::storage::{ColumnValue, InMemoryStorage, MemoryLevel, QueryInfo};
use join_index::JoinHashTable;
use log::debug;
use std::time::{Duration, Instant};

const OUTER_TABLE: i32 = 1;
const INNER_TABLE: i32 = 2;
const KEY_COLUMN: i32 = 1;

pub struct JoinBench {
    pub memory_level: MemoryLevel,
    pub config: ExecutorConfig,
    pub capability: DeviceCapability,
    pub storage: InMemoryStorage,
    pub predicate: BinOper,
    pub query_infos: Vec<QueryInfo>,
    pub probe_keys: Vec<i64>,
    pub build_tuples: usize,
    pub key_bytes: usize,
}

#[derive(Debug, Default)]
pub struct JoinPoint {
    pub build_ns: Option<f64>,
    pub probe_ns: Option<f64>,
    pub hash_table_bytes: Option<usize>,
    pub probe_hits: Option<usize>,
}

pub struct JoinBenchBuilder {
    key_domain: usize,
    duplicates: usize,
    distribution: ArgInnerDistribution,
    outer_len: usize,
    hit_percent: u32,
    memory_level: MemoryLevel,
    config: ExecutorConfig,
}

impl Default for JoinBenchBuilder {
    fn default() -> JoinBenchBuilder {
        JoinBenchBuilder {
            key_domain: 1,
            duplicates: 1,
            distribution: ArgInnerDistribution::Duplicates,
            outer_len: 1,
            hit_percent: 100,
            memory_level: MemoryLevel::Host,
            config: ExecutorConfig {
                enable_dense_hash_join: true,
                ..ExecutorConfig::default()
            },
        }
    }
}

impl JoinBenchBuilder {
    pub fn key_domain(&mut self, key_domain: usize) -> &mut Self {
        self.key_domain = key_domain;
        self
    }

    pub fn duplicates(&mut self, duplicates: usize) -> &mut Self {
        self.duplicates = duplicates;
        self
    }

    pub fn distribution(&mut self, distribution: ArgInnerDistribution) -> &mut Self {
        self.distribution = distribution;
        self
    }

    pub fn outer_len(&mut self, outer_len: usize) -> &mut Self {
        self.outer_len = outer_len;
        self
    }

    pub fn hit_percent(&mut self, hit_percent: u32) -> &mut Self {
        self.hit_percent = hit_percent;
        self
    }

    pub fn memory_level(&mut self, memory_level: MemoryLevel) -> &mut Self {
        self.memory_level = memory_level;
        self
    }

    pub fn config(&mut self, config: ExecutorConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Generates the relations and loads them into storage.
    ///
    /// Returns the benchmark and the data generation time.
    pub fn build<T: KeyAttribute + ColumnValue>(&self) -> Result<(JoinBench, Duration)> {
        if self.key_domain == 0 {
            Err(ErrorKind::InvalidArgument(
                "Key domain must be at least 1".to_string(),
            ))?;
        }

        let type_info = match <T as ColumnValue>::BYTES {
            4 => TypeInfo::new(SqlType::Int, true),
            8 => TypeInfo::new(SqlType::BigInt, true),
            other => Err(ErrorKind::InvalidArgument(format!(
                "Unsupported key width of {} bytes",
                other
            )))?,
        };

        let capability = DeviceCapability::resolve(&self.config)?;

        let gen_timer = Instant::now();
        let domain = 1..=self.key_domain as i64;
        let inner_keys: Vec<T> = match self.distribution {
            ArgInnerDistribution::Unique => {
                let mut keys = vec![T::zero(); self.key_domain];
                DenseKeyRelation::gen_primary_key(&mut keys, 1)?;
                keys
            }
            ArgInnerDistribution::Duplicates => {
                DenseKeyRelation::gen_attr_with_duplicates(domain, self.duplicates)?
            }
            ArgInnerDistribution::Uniform => {
                let mut keys = vec![T::zero(); self.key_domain * self.duplicates];
                DenseKeyRelation::gen_attr_par(&mut keys, domain)?;
                keys
            }
        };
        let mut outer_keys = vec![T::zero(); self.outer_len];
        ProbeKeyRelation::gen_attr_with_misses(&mut outer_keys, &inner_keys, self.hit_percent)?;
        let gen_time = gen_timer.elapsed();

        let mut storage = InMemoryStorage::new(1);
        if let Some(backend) = capability.backend() {
            storage = storage.with_device(backend.clone());
        }
        storage.add_column(OUTER_TABLE, KEY_COLUMN, type_info, &[outer_keys.as_slice()])?;
        storage.add_column(INNER_TABLE, KEY_COLUMN, type_info, &[inner_keys.as_slice()])?;

        let predicate = BinOper::comparison(
            OpType::Eq,
            ColumnVar::new(OUTER_TABLE, KEY_COLUMN, 0, type_info).into(),
            ColumnVar::new(INNER_TABLE, KEY_COLUMN, 1, type_info).into(),
        );
        let query_infos = vec![
            storage.query_info(OUTER_TABLE),
            storage.query_info(INNER_TABLE),
        ];
        let probe_keys = outer_keys
            .iter()
            .filter_map(|key| key.to_i64())
            .collect();

        let bench = JoinBench {
            memory_level: self.memory_level,
            config: self.config.clone(),
            capability,
            storage,
            predicate,
            query_infos,
            probe_keys,
            build_tuples: inner_keys.len(),
            key_bytes: <T as ColumnValue>::BYTES,
        };

        Ok((bench, gen_time))
    }
}

impl JoinBench {
    /// Builds the hash table and probes every outer key through generated
    /// code.
    ///
    /// Each run uses a new executor, thus the table is dropped at the end of
    /// the run.
    pub fn run(&mut self) -> Result<JoinPoint> {
        let executor = Executor::with_capability(self.config.clone(), self.capability.clone());

        let build_timer = Instant::now();
        let table = JoinHashTable::get_instance(
            &self.predicate,
            &self.storage,
            &self.query_infos,
            self.memory_level,
            &executor,
        )?
        .ok_or_else(|| {
            ErrorKind::RuntimeError("Dense hash join is not applicable".to_string())
        })?;
        let build_time = build_timer.elapsed();

        let function = {
            let mut cgen = executor.cgen_state();
            let key = cgen.arg(0);
            let slot = table.codegen_slot(key, &mut cgen);
            cgen.finish(slot)
        };
        debug!("Generated probe:\n{}", function);

        let evaluator = RowEvaluator::new(&executor);
        let probe_timer = Instant::now();
        let hits = self
            .probe_keys
            .iter()
            .map(|&key| evaluator.run(&function, &[key]))
            .try_fold(0_usize, |hits, row| {
                row.map(|row| if row == NO_MATCH { hits } else { hits + 1 })
            })?;
        let probe_time = probe_timer.elapsed();

        Ok(JoinPoint {
            build_ns: Some(build_time.as_nanos() as f64),
            probe_ns: Some(probe_time.as_nanos() as f64),
            hash_table_bytes: Some(table.len_bytes()),
            probe_hits: Some(hits),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench(distribution: ArgInnerDistribution) -> Result<JoinBench> {
        let (bench, _) = JoinBenchBuilder::default()
            .key_domain(64)
            .duplicates(3)
            .distribution(distribution)
            .outer_len(500)
            .build::<i32>()?;
        Ok(bench)
    }

    #[test]
    fn unique_inner_keys_ignore_duplicates() -> Result<()> {
        let mut jb = bench(ArgInnerDistribution::Unique)?;
        assert_eq!(64, jb.build_tuples);

        let point = jb.run()?;
        assert_eq!(Some(500), point.probe_hits);
        Ok(())
    }

    #[test]
    fn duplicated_inner_keys() -> Result<()> {
        let mut jb = bench(ArgInnerDistribution::Duplicates)?;
        assert_eq!(64 * 3, jb.build_tuples);

        let point = jb.run()?;
        assert_eq!(Some(500), point.probe_hits);
        assert_eq!(Some((2 * 64 + 64 * 3) * 8), point.hash_table_bytes);
        Ok(())
    }

    #[test]
    fn uniform_inner_keys() -> Result<()> {
        let mut jb = bench(ArgInnerDistribution::Uniform)?;
        assert_eq!(64 * 3, jb.build_tuples);

        let point = jb.run()?;
        assert_eq!(Some(500), point.probe_hits);
        Ok(())
    }

    #[test]
    fn misses_are_counted() -> Result<()> {
        let (mut jb, _) = JoinBenchBuilder::default()
            .key_domain(16)
            .outer_len(100)
            .hit_percent(0)
            .build::<i64>()?;

        let point = jb.run()?;
        assert_eq!(Some(0), point.probe_hits);
        Ok(())
    }
}
