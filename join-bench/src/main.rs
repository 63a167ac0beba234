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

mod error;
mod measurement;
mod types;

use crate::error::Result;
use crate::measurement::data_point::DataPoint;
use crate::measurement::harness;
use crate::measurement::join_bench::{JoinBenchBuilder, JoinPoint};
use crate::types::*;

use datagen::relation::KeyAttribute;
use join_index::device::LaunchDims;
use join_index::executor::{DeviceBackendKind, ExecutorConfig};
use join_index::storage::ColumnValue;

use std::path::PathBuf;

use structopt::StructOpt;

fn main() -> Result<()> {
    env_logger::init();

    // Parse commandline arguments
    let cmd = CmdOpt::from_args();

    match cmd.key_bytes {
        ArgKeyBytes::Bytes4 => {
            let (jbc, dp) = args_to_bench::<i32>(&cmd)?;
            harness::measure("dense_hash_join", cmd.repeat, cmd.csv.clone(), dp, jbc)?;
        }
        ArgKeyBytes::Bytes8 => {
            let (jbc, dp) = args_to_bench::<i64>(&cmd)?;
            harness::measure("dense_hash_join", cmd.repeat, cmd.csv.clone(), dp, jbc)?;
        }
    }

    Ok(())
}

#[derive(StructOpt)]
#[structopt(
    name = "join-bench",
    about = "A benchmark for the dense equi-join hash table"
)]
struct CmdOpt {
    /// Number of times to repeat benchmark
    #[structopt(short = "r", long = "repeat", default_value = "30")]
    repeat: u32,

    /// Output filename for measurement CSV file
    #[structopt(long = "csv", parse(from_os_str))]
    csv: Option<PathBuf>,

    /// Memory level at which to build the hash table.
    #[structopt(
        long = "memory-level",
        default_value = "Host",
        possible_values = &ArgMemoryLevel::variants(),
        case_insensitive = true
    )]
    memory_level: ArgMemoryLevel,

    /// Device on which device-level hash tables are built.
    #[structopt(
        long = "device-backend",
        default_value = "Emulated",
        possible_values = &ArgDeviceBackend::variants(),
        case_insensitive = true
    )]
    device_backend: ArgDeviceBackend,

    /// Number of distinct keys in the inner relation
    #[structopt(long = "key-domain", default_value = "1048576")]
    key_domain: usize,

    /// Occurrences of each key in the inner relation
    #[structopt(long = "duplicates", default_value = "1")]
    duplicates: usize,

    /// Distribution of the inner relation keys.
    //   unique: each key of the domain occurs once
    //   duplicates: each key of the domain occurs `duplicates` times (default)
    //   uniform: `key_domain * duplicates` keys sampled uniformly from the domain
    #[structopt(
        long = "inner-distribution",
        default_value = "Duplicates",
        possible_values = &ArgInnerDistribution::variants(),
        case_insensitive = true
    )]
    inner_distribution: ArgInnerDistribution,

    /// Set the outer relation size (tuples)
    #[structopt(long = "outer-rel-tuples", default_value = "16777216")]
    outer_rel_tuples: usize,

    /// Percentage of outer tuples that find a join partner
    #[structopt(long = "hit-percent", default_value = "100")]
    hit_percent: u32,

    /// Set the key size (bytes)
    #[structopt(
        long = "key-bytes",
        default_value = "Bytes8",
        possible_values = &ArgKeyBytes::variants(),
        case_insensitive = true
    )]
    key_bytes: ArgKeyBytes,

    /// Grid size of device kernels
    #[structopt(long = "grid-size", default_value = "16")]
    grid_size: u32,

    /// Block size of device kernels
    #[structopt(long = "block-size", default_value = "1024")]
    block_size: u32,

    /// Worker threads of the emulated device; defaults to one per core
    #[structopt(short = "t", long = "threads")]
    threads: Option<usize>,
}

impl CmdOpt {
    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            enable_dense_hash_join: true,
            launch: LaunchDims {
                grid_size: self.grid_size,
                block_size: self.block_size,
            },
            device_backend: match self.memory_level {
                ArgMemoryLevel::Host => DeviceBackendKind::None,
                ArgMemoryLevel::Device => self.device_backend.into(),
            },
            emulated_threads: self.threads,
            ..ExecutorConfig::default()
        }
    }
}

fn args_to_bench<T: KeyAttribute + ColumnValue>(
    cmd: &CmdOpt,
) -> Result<(Box<dyn FnMut() -> Result<JoinPoint>>, DataPoint)> {
    let (mut jb, gen_time) = JoinBenchBuilder::default()
        .key_domain(cmd.key_domain)
        .duplicates(cmd.duplicates)
        .distribution(cmd.inner_distribution)
        .outer_len(cmd.outer_rel_tuples)
        .hit_percent(cmd.hit_percent)
        .memory_level(cmd.memory_level.into())
        .config(cmd.executor_config())
        .build::<T>()?;

    let dp = DataPoint::new()?
        .fill_from_cmd_options(cmd)
        .fill_from_join_bench(&jb)
        .set_init_time(gen_time);

    let jbc = Box::new(move || jb.run());

    Ok((jbc, dp))
}
