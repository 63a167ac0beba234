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

use super::join_bench::JoinBench;
use crate::error::{ErrorKind, Result};
use crate::types::*;
use crate::CmdOpt;
use serde_derive::Serialize;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DataPoint {
    pub hostname: String,
    pub memory_level: Option<ArgMemoryLevel>,
    pub device_backend: Option<ArgDeviceBackend>,
    pub key_bytes: Option<usize>,
    pub threads: Option<usize>,
    pub grid_size: Option<u32>,
    pub block_size: Option<u32>,
    pub key_domain: Option<usize>,
    pub duplicates: Option<usize>,
    pub inner_distribution: Option<ArgInnerDistribution>,
    pub hit_percent: Option<u32>,
    pub build_tuples: Option<usize>,
    pub build_bytes: Option<usize>,
    pub probe_tuples: Option<usize>,
    pub probe_bytes: Option<usize>,
    pub hash_table_bytes: Option<usize>,
    pub warm_up: Option<bool>,
    pub build_ns: Option<f64>,
    pub probe_ns: Option<f64>,
    pub probe_hits: Option<usize>,
    pub relation_gen_ns: Option<f64>,
}

impl DataPoint {
    pub fn new() -> Result<DataPoint> {
        let hostname = hostname::get()?
            .into_string()
            .map_err(|_| ErrorKind::RuntimeError("Couldn't get hostname".to_string()))?;

        let dp = DataPoint {
            hostname,
            ..DataPoint::default()
        };

        Ok(dp)
    }

    pub fn fill_from_cmd_options(&self, cmd: &CmdOpt) -> DataPoint {
        let uses_device = cmd.memory_level == ArgMemoryLevel::Device;

        DataPoint {
            memory_level: Some(cmd.memory_level),
            device_backend: if uses_device {
                Some(cmd.device_backend)
            } else {
                None
            },
            threads: if uses_device && cmd.device_backend == ArgDeviceBackend::Emulated {
                cmd.threads
            } else {
                None
            },
            grid_size: if uses_device {
                Some(cmd.grid_size)
            } else {
                None
            },
            block_size: if uses_device {
                Some(cmd.block_size)
            } else {
                None
            },
            key_domain: Some(cmd.key_domain),
            duplicates: if cmd.inner_distribution == ArgInnerDistribution::Unique {
                None
            } else {
                Some(cmd.duplicates)
            },
            inner_distribution: Some(cmd.inner_distribution),
            hit_percent: Some(cmd.hit_percent),
            ..self.clone()
        }
    }

    pub fn fill_from_join_bench(&self, jb: &JoinBench) -> DataPoint {
        DataPoint {
            key_bytes: Some(jb.key_bytes),
            build_tuples: Some(jb.build_tuples),
            build_bytes: Some(jb.build_tuples * jb.key_bytes),
            probe_tuples: Some(jb.probe_keys.len()),
            probe_bytes: Some(jb.probe_keys.len() * jb.key_bytes),
            ..self.clone()
        }
    }

    pub fn set_init_time(&self, data_gen: Duration) -> DataPoint {
        DataPoint {
            relation_gen_ns: Some(data_gen.as_nanos() as f64),
            ..self.clone()
        }
    }
}
