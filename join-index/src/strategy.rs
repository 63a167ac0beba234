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

//! Build strategies for host and device hash tables.
//!
//! Both strategies produce the same logical hash table: for every key in the
//! range, the bucket's row chain contains exactly the inner rows with that
//! key. The host strategy fills the table sequentially and links rows in
//! ascending order. The device strategy fills the table in parallel, thus the
//! order of rows within a chain is unspecified.

use crate::device::{DeviceAllocation, DeviceBackend, FillKernelArgs, LaunchDims};
use crate::error::{ErrorKind, Result};
use crate::runtime::{self, EMPTY_SLOT, NO_MATCH};
use crate::storage::{ColumnBuffer, MemoryLevel};
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

/// Input of a hash table build.
#[derive(Clone, Debug)]
pub struct FillRequest<'a> {
    pub column: &'a ColumnBuffer,
    pub row_count: usize,
    pub value_size: usize,
    pub int_min: i64,
    pub bucket_count: usize,
    pub device_id: i32,
}

/// Memory of a built hash table.
#[derive(Debug)]
pub enum TableStorage {
    Host {
        buckets: Vec<i64>,
        chain: Vec<i64>,
    },
    Device {
        buckets: DeviceAllocation,
        chain: DeviceAllocation,
    },
}

impl TableStorage {
    pub fn memory_level(&self) -> MemoryLevel {
        match self {
            TableStorage::Host { .. } => MemoryLevel::Host,
            TableStorage::Device { .. } => MemoryLevel::Device,
        }
    }

    /// Size of the bucket array and the row chain in bytes.
    pub fn len_bytes(&self) -> usize {
        match self {
            TableStorage::Host { buckets, chain } => {
                (buckets.len() + chain.len()) * size_of::<i64>()
            }
            TableStorage::Device { buckets, chain } => buckets.len_bytes() + chain.len_bytes(),
        }
    }

    /// Copies the bucket array and the row chain into host memory.
    pub fn download(&self) -> Result<(Vec<i64>, Vec<i64>)> {
        match self {
            TableStorage::Host { buckets, chain } => Ok((buckets.clone(), chain.clone())),
            TableStorage::Device { buckets, chain } => {
                Ok((buckets.to_host_words()?, chain.to_host_words()?))
            }
        }
    }
}

/// Result of a build.
///
/// A nonzero `error_code` signals that the fill routine rejected the input.
/// The storage must then be discarded.
#[derive(Debug)]
pub struct BuiltTable {
    pub storage: TableStorage,
    pub error_code: i32,
}

/// Builds and probes hash tables at one memory level.
pub trait BuildStrategy: Send + Sync + fmt::Debug {
    fn memory_level(&self) -> MemoryLevel;

    fn build(&self, request: &FillRequest<'_>) -> Result<BuiltTable>;

    /// Returns the head row id for `key`, or `NO_MATCH`.
    fn probe(&self, storage: &TableStorage, key: i64, int_min: i64, int_max: i64) -> Result<i64>;

    /// Returns all inner row ids for `key`.
    fn matches(
        &self,
        storage: &TableStorage,
        key: i64,
        int_min: i64,
        int_max: i64,
    ) -> Result<Vec<i64>>;
}

fn table_words(bucket_count: usize) -> Result<usize> {
    bucket_count.checked_mul(2).ok_or_else(|| {
        ErrorKind::IntegerOverflow("Failed to compute hash table size".to_string()).into()
    })
}

fn storage_mismatch(strategy: MemoryLevel, storage: &TableStorage) -> ErrorKind {
    ErrorKind::InvariantViolation(format!(
        "A {} strategy cannot access {} hash table memory",
        strategy,
        storage.memory_level()
    ))
}

/// Sequential fill in host memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostStrategy;

impl BuildStrategy for HostStrategy {
    fn memory_level(&self) -> MemoryLevel {
        MemoryLevel::Host
    }

    fn build(&self, request: &FillRequest<'_>) -> Result<BuiltTable> {
        let column = match request.column {
            ColumnBuffer::Host(data) => data,
            ColumnBuffer::Device(ptr) => Err(ErrorKind::InvariantViolation(format!(
                "Host build received device buffer {}",
                ptr
            )))?,
        };

        let mut buckets = vec![EMPTY_SLOT; table_words(request.bucket_count)?];
        let mut chain = vec![EMPTY_SLOT; request.row_count];

        let error_code = runtime::init_hash_join_buff(
            &mut buckets,
            &mut chain,
            request.bucket_count,
            column,
            request.row_count,
            request.value_size,
            request.int_min,
        );

        Ok(BuiltTable {
            storage: TableStorage::Host { buckets, chain },
            error_code,
        })
    }

    fn probe(&self, storage: &TableStorage, key: i64, int_min: i64, int_max: i64) -> Result<i64> {
        match storage {
            TableStorage::Host { buckets, .. } => {
                Ok(runtime::hash_join_idx(buckets, key, int_min, int_max))
            }
            _ => Err(storage_mismatch(self.memory_level(), storage).into()),
        }
    }

    fn matches(
        &self,
        storage: &TableStorage,
        key: i64,
        int_min: i64,
        int_max: i64,
    ) -> Result<Vec<i64>> {
        match storage {
            TableStorage::Host { buckets, chain } => {
                Ok(runtime::bucket_rows(buckets, chain, key, int_min, int_max).collect())
            }
            _ => Err(storage_mismatch(self.memory_level(), storage).into()),
        }
    }
}

/// Data-parallel fill in device memory.
pub struct DeviceStrategy {
    backend: Arc<dyn DeviceBackend>,
    launch_dims: LaunchDims,
}

impl DeviceStrategy {
    /// Creates a device strategy.
    ///
    /// `launch_dims` should be the dimensions of the query kernels that probe
    /// the table.
    pub fn new(backend: Arc<dyn DeviceBackend>, launch_dims: LaunchDims) -> Self {
        Self {
            backend,
            launch_dims,
        }
    }

    pub fn launch_dims(&self) -> LaunchDims {
        self.launch_dims
    }

    fn read_word(alloc: &DeviceAllocation, index: usize) -> Result<i64> {
        let mut word = [0_i64; 1];
        alloc.read_words(index, &mut word)?;
        Ok(word[0])
    }
}

impl fmt::Debug for DeviceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStrategy")
            .field("backend", &self.backend.name())
            .field("launch_dims", &self.launch_dims)
            .finish()
    }
}

impl BuildStrategy for DeviceStrategy {
    fn memory_level(&self) -> MemoryLevel {
        MemoryLevel::Device
    }

    fn build(&self, request: &FillRequest<'_>) -> Result<BuiltTable> {
        let column = match request.column {
            ColumnBuffer::Device(ptr) => *ptr,
            ColumnBuffer::Host(_) => Err(ErrorKind::InvariantViolation(
                "Device build received a host buffer".to_string(),
            ))?,
        };

        let buckets = DeviceAllocation::new_words(
            self.backend.clone(),
            table_words(request.bucket_count)?,
            request.device_id,
        )?;
        let chain = DeviceAllocation::new_words(
            self.backend.clone(),
            request.row_count.max(1),
            request.device_id,
        )?;
        let error_cell =
            DeviceAllocation::new(self.backend.clone(), size_of::<i32>(), request.device_id)?;
        error_cell.copy_from_host(&runtime::FILL_OK.to_le_bytes())?;

        let args = FillKernelArgs {
            buckets: buckets.as_device_ptr(),
            chain: chain.as_device_ptr(),
            error_code: error_cell.as_device_ptr(),
            bucket_count: request.bucket_count as u64,
            column,
            row_count: request.row_count as u64,
            value_size: request.value_size as u32,
            int_min: request.int_min,
        };
        self.backend
            .launch_fill(&args, self.launch_dims, request.device_id)?;

        let mut error_code = [0_u8; size_of::<i32>()];
        error_cell.copy_to_host(&mut error_code)?;

        Ok(BuiltTable {
            storage: TableStorage::Device { buckets, chain },
            error_code: i32::from_le_bytes(error_code),
        })
    }

    fn probe(&self, storage: &TableStorage, key: i64, int_min: i64, int_max: i64) -> Result<i64> {
        match storage {
            TableStorage::Device { buckets, .. } => {
                let words = buckets.len_bytes() / size_of::<i64>();
                let head = runtime::bucket_index(key, int_min, int_max)
                    .and_then(|bucket| bucket.checked_mul(2))
                    .filter(|&slot| slot < words);
                match head {
                    Some(slot) => Self::read_word(buckets, slot),
                    None => Ok(NO_MATCH),
                }
            }
            _ => Err(storage_mismatch(self.memory_level(), storage).into()),
        }
    }

    fn matches(
        &self,
        storage: &TableStorage,
        key: i64,
        int_min: i64,
        int_max: i64,
    ) -> Result<Vec<i64>> {
        let chain = match storage {
            TableStorage::Device { chain, .. } => chain,
            _ => Err(storage_mismatch(self.memory_level(), storage))?,
        };

        let mut rows = Vec::new();
        let mut next = self.probe(storage, key, int_min, int_max)?;
        while next != EMPTY_SLOT {
            rows.push(next);
            next = Self::read_word(chain, next as usize)?;
        }

        Ok(rows)
    }
}
