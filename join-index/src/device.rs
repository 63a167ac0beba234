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

//! Device memory management and data-parallel kernel launches.
//!
//! A device backend owns a device memory manager and can launch the hash table
//! fill kernel. Two backends exist:
//!
//! - `emulated::EmulatedDevice` keeps device memory in host word arrays and
//!   runs kernels on a rayon thread pool. It executes the same grid-stride
//!   algorithm with the same launch dimensions as the GPU kernel, and thus
//!   exercises the device code path on machines without a GPU.
//! - `cuda::CudaDevice` uses the CUDA driver API. It is only available with the
//!   `cuda` feature.

pub mod emulated;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::error::{ErrorKind, Result};
use serde_derive::{Deserialize, Serialize};
use std::convert::TryInto;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

/// An opaque address in device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Offsets the address by `bytes`.
    pub fn add(self, bytes: usize) -> Result<Self> {
        (bytes as u64)
            .checked_add(self.0)
            .map(DevicePtr)
            .ok_or_else(|| {
                ErrorKind::IntegerOverflow("Device pointer arithmetic overflowed".to_string())
                    .into()
            })
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Grid and block size of a kernel launch.
///
/// The hash table fill kernel uses the same launch dimensions as the query
/// kernels that later probe the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDims {
    pub grid_size: u32,
    pub block_size: u32,
}

impl LaunchDims {
    pub fn new(grid_size: u32, block_size: u32) -> Self {
        Self {
            grid_size,
            block_size,
        }
    }

    /// Total number of threads in the launch.
    pub fn threads(&self) -> usize {
        self.grid_size as usize * self.block_size as usize
    }
}

impl Default for LaunchDims {
    fn default() -> Self {
        Self {
            grid_size: 16,
            block_size: 1024,
        }
    }
}

/// Allocates device memory and copies data between host and device.
pub trait DeviceMemoryManager: Send + Sync {
    fn allocate(&self, bytes: usize, device_id: i32) -> Result<DevicePtr>;

    /// Releases an allocation. Must be called exactly once per allocation.
    fn free(&self, ptr: DevicePtr, device_id: i32);

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8], device_id: i32) -> Result<()>;

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr, device_id: i32) -> Result<()>;
}

/// Arguments of the hash table fill kernel.
///
/// `buckets` points to `2 * bucket_count` words, `chain` to `row_count` words,
/// and `error_code` to a single `i32`.
#[derive(Clone, Copy, Debug)]
pub struct FillKernelArgs {
    pub buckets: DevicePtr,
    pub chain: DevicePtr,
    pub error_code: DevicePtr,
    pub bucket_count: u64,
    pub column: DevicePtr,
    pub row_count: u64,
    pub value_size: u32,
    pub int_min: i64,
}

/// A device that can run the hash table fill kernel.
pub trait DeviceBackend: DeviceMemoryManager {
    fn name(&self) -> &'static str;

    /// Initializes and fills a hash table. Blocks until the kernel completes.
    fn launch_fill(&self, args: &FillKernelArgs, dims: LaunchDims, device_id: i32) -> Result<()>;
}

/// Device memory owned by a single object.
///
/// The memory is obtained from a shared device memory manager, but its
/// lifetime is bound to the `DeviceAllocation`. Dropping it releases the
/// memory exactly once.
pub struct DeviceAllocation {
    backend: Arc<dyn DeviceBackend>,
    ptr: DevicePtr,
    bytes: usize,
    device_id: i32,
}

impl DeviceAllocation {
    pub fn new(backend: Arc<dyn DeviceBackend>, bytes: usize, device_id: i32) -> Result<Self> {
        let ptr = backend.allocate(bytes, device_id)?;

        Ok(Self {
            backend,
            ptr,
            bytes,
            device_id,
        })
    }

    /// Allocates memory for `len` words.
    pub fn new_words(backend: Arc<dyn DeviceBackend>, len: usize, device_id: i32) -> Result<Self> {
        let bytes = len.checked_mul(size_of::<i64>()).ok_or_else(|| {
            ErrorKind::IntegerOverflow("Failed to compute allocation bytes".to_string())
        })?;
        Self::new(backend, bytes, device_id)
    }

    pub fn as_device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn copy_from_host(&self, src: &[u8]) -> Result<()> {
        if src.len() > self.bytes {
            Err(ErrorKind::InvalidArgument(
                "Copy source is larger than the allocation".to_string(),
            ))?;
        }
        self.backend.copy_to_device(self.ptr, src, self.device_id)
    }

    pub fn copy_to_host(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.bytes {
            Err(ErrorKind::InvalidArgument(
                "Copy destination is larger than the allocation".to_string(),
            ))?;
        }
        self.backend.copy_from_device(dst, self.ptr, self.device_id)
    }

    /// Reads `dst.len()` words starting at word `offset`.
    pub fn read_words(&self, offset: usize, dst: &mut [i64]) -> Result<()> {
        let word_bytes = size_of::<i64>();
        let end = offset
            .checked_add(dst.len())
            .and_then(|end| end.checked_mul(word_bytes))
            .ok_or_else(|| ErrorKind::IntegerOverflow("Failed to compute word range".to_string()))?;
        if end > self.bytes {
            Err(ErrorKind::InvalidArgument(
                "Word range exceeds the allocation".to_string(),
            ))?;
        }

        let mut bytes = vec![0_u8; dst.len() * word_bytes];
        self.backend
            .copy_from_device(&mut bytes, self.ptr.add(offset * word_bytes)?, self.device_id)?;
        bytes_to_words(&bytes, dst);

        Ok(())
    }

    /// Copies the whole allocation into a host vector of words.
    pub fn to_host_words(&self) -> Result<Vec<i64>> {
        let mut words = vec![0; self.bytes / size_of::<i64>()];
        self.read_words(0, &mut words)?;
        Ok(words)
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.backend.free(self.ptr, self.device_id);
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("backend", &self.backend.name())
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Encodes words as little-endian bytes.
pub fn words_to_bytes(words: &[i64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect()
}

/// Decodes little-endian bytes into `dst`. Trailing bytes are ignored.
pub fn bytes_to_words(bytes: &[u8], dst: &mut [i64]) {
    bytes
        .chunks_exact(size_of::<i64>())
        .zip(dst.iter_mut())
        .for_each(|(chunk, word)| {
            if let Ok(raw) = chunk.try_into() {
                *word = i64::from_le_bytes(raw);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::emulated::EmulatedDevice;
    use super::*;

    #[test]
    fn allocation_round_trips_words() -> Result<()> {
        let device = Arc::new(EmulatedDevice::new(Some(2))?);
        let alloc = DeviceAllocation::new_words(device.clone(), 4, 0)?;
        alloc.copy_from_host(&words_to_bytes(&[7, -1, 0, i64::min_value()]))?;

        let mut middle = [0; 2];
        alloc.read_words(1, &mut middle)?;
        assert_eq!([-1, 0], middle);
        assert_eq!(vec![7, -1, 0, i64::min_value()], alloc.to_host_words()?);
        Ok(())
    }

    #[test]
    fn drop_frees_exactly_once() -> Result<()> {
        let device = Arc::new(EmulatedDevice::new(Some(1))?);
        {
            let _a = DeviceAllocation::new(device.clone(), 12, 0)?;
            let _b = DeviceAllocation::new(device.clone(), 3, 0)?;
            assert_eq!(2, device.live_allocations());
        }
        assert_eq!(0, device.live_allocations());
        assert_eq!(0, device.double_frees());
        Ok(())
    }

    #[test]
    fn read_past_end_fails() -> Result<()> {
        let device = Arc::new(EmulatedDevice::new(Some(1))?);
        let alloc = DeviceAllocation::new_words(device, 2, 0)?;
        let mut dst = [0; 2];

        assert!(alloc.read_words(1, &mut dst).is_err());
        Ok(())
    }
}
