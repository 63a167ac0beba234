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

use super::data_point::DataPoint;
use super::join_bench::JoinPoint;
use crate::error::Result;
use error_chain::ensure;
use log::info;
use std::path::PathBuf;

/// Runs `func` once to warm up and then `repeat` times.
///
/// Only the warm-up data point carries the data generation time.
pub fn measure(
    name: &str,
    repeat: u32,
    out_file_name: Option<PathBuf>,
    template: DataPoint,
    mut func: Box<dyn FnMut() -> Result<JoinPoint>>,
) -> Result<()> {
    let measurements = (0..=repeat)
        .zip(std::iter::once(true).chain(std::iter::repeat(false)))
        .map(|(_, warm_up)| {
            func().map(|p| DataPoint {
                warm_up: Some(warm_up),
                relation_gen_ns: if warm_up {
                    template.relation_gen_ns
                } else {
                    None
                },
                hash_table_bytes: p.hash_table_bytes,
                build_ns: p.build_ns,
                probe_ns: p.probe_ns,
                probe_hits: p.probe_hits,
                ..template.clone()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let timed: Vec<_> = measurements.iter().filter(|dp| dp.warm_up == Some(false)).collect();
    if !timed.is_empty() {
        let mean = |f: fn(&DataPoint) -> Option<f64>| {
            timed.iter().filter_map(|dp| f(dp)).sum::<f64>() / timed.len() as f64
        };
        info!(
            "{}: mean build {:.0} ns, mean probe {:.0} ns over {} runs",
            name,
            mean(|dp| dp.build_ns),
            mean(|dp| dp.probe_ns),
            timed.len()
        );
    }

    if let Some(ofn) = out_file_name {
        let csv_file = std::fs::File::create(ofn)?;
        let mut csv = csv::Writer::from_writer(csv_file);
        ensure!(
            measurements
                .iter()
                .try_for_each(|row| csv.serialize(row))
                .is_ok(),
            "Couldn't write serialized measurements"
        );
        csv.flush()?;
    }

    Ok(())
}
