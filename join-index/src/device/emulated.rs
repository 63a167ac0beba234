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

//! A device backend that runs kernels on a CPU thread pool.
//!
//! Device memory is an array of atomic words per allocation, addressed through
//! synthetic device pointers. Host code can only reach it through the copy
//! functions, just like real device memory.
//!
//! Kernels are executed as `grid_size * block_size` logical threads that are
//! scheduled onto a rayon thread pool. Each logical thread processes rows in a
//! grid-stride loop, and concurrent updates use atomics, as on the GPU.

use super::{DeviceBackend, DeviceMemoryManager, DevicePtr, FillKernelArgs, LaunchDims};
use crate::error::{ErrorKind, Result};
use crate::runtime::{is_supported_width, EMPTY_SLOT, FILL_ERR_BAD_WIDTH, FILL_ERR_OUT_OF_RANGE};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const WORD_BYTES: usize = size_of::<u64>();

/// Allocations are placed at this granularity in the synthetic address space.
const ALLOCATION_ALIGNMENT: u64 = 256;

struct EmulatedBuffer {
    words: Box<[AtomicU64]>,
    bytes: usize,
}

impl EmulatedBuffer {
    fn new(bytes: usize) -> Self {
        let len = (bytes + WORD_BYTES - 1) / WORD_BYTES;
        let words = (0..len).map(|_| AtomicU64::new(0)).collect();
        Self { words, bytes }
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        let mut pos = offset;
        let mut src = src;

        // Unaligned head and tail are merged byte by byte
        while !src.is_empty() && (pos % WORD_BYTES != 0 || src.len() < WORD_BYTES) {
            self.write_byte(pos, src[0]);
            pos += 1;
            src = &src[1..];
        }

        let mut chunks = src.chunks_exact(WORD_BYTES);
        for chunk in &mut chunks {
            let mut raw = [0_u8; WORD_BYTES];
            raw.copy_from_slice(chunk);
            self.words[pos / WORD_BYTES].store(u64::from_le_bytes(raw), Ordering::Relaxed);
            pos += WORD_BYTES;
        }
        for &byte in chunks.remainder() {
            self.write_byte(pos, byte);
            pos += 1;
        }
    }

    fn write_byte(&self, pos: usize, byte: u8) {
        let shift = (pos % WORD_BYTES) * 8;
        let word = &self.words[pos / WORD_BYTES];
        word.fetch_and(!(0xff_u64 << shift), Ordering::Relaxed);
        word.fetch_or((byte as u64) << shift, Ordering::Relaxed);
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        dst.iter_mut().enumerate().for_each(|(i, byte)| {
            let pos = offset + i;
            let word = self.words[pos / WORD_BYTES].load(Ordering::Relaxed);
            *byte = (word >> ((pos % WORD_BYTES) * 8)) as u8;
        });
    }

    /// Loads a sign-extended key of `value_size` bytes at `row`.
    ///
    /// Keys never straddle a word, because `value_size` divides the word size
    /// and the column starts at an aligned address.
    fn load_key(&self, row: usize, value_size: usize) -> i64 {
        let pos = row * value_size;
        let word = self.words[pos / WORD_BYTES].load(Ordering::Relaxed);
        let shift = (pos % WORD_BYTES) * 8;
        let bits = value_size * 8;
        let raw = word >> shift;

        if bits == 64 {
            raw as i64
        } else {
            // Shift into the top bits, then arithmetic shift back to sign extend
            ((raw << (64 - bits)) as i64) >> (64 - bits)
        }
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        &self.words[index]
    }
}

/// Device backend that executes on a rayon thread pool.
pub struct EmulatedDevice {
    pool: ThreadPool,
    buffers: Mutex<BTreeMap<u64, Arc<EmulatedBuffer>>>,
    next_address: AtomicU64,
    double_frees: AtomicUsize,
}

impl EmulatedDevice {
    /// Creates a new emulated device.
    ///
    /// `threads` sets the number of worker threads; `None` uses one thread per
    /// CPU core.
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(threads) = threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;

        Ok(Self {
            pool,
            buffers: Mutex::new(BTreeMap::new()),
            next_address: AtomicU64::new(ALLOCATION_ALIGNMENT),
            double_frees: AtomicUsize::new(0),
        })
    }

    /// Number of allocations that have not been freed yet.
    pub fn live_allocations(&self) -> usize {
        self.buffers().len()
    }

    /// Number of `free` calls on addresses that were not allocated.
    pub fn double_frees(&self) -> usize {
        self.double_frees.load(Ordering::SeqCst)
    }

    fn buffers(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<EmulatedBuffer>>> {
        self.buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolves an address into its allocation and the byte offset within.
    fn resolve(&self, ptr: DevicePtr, len: usize) -> Result<(Arc<EmulatedBuffer>, usize)> {
        let buffers = self.buffers();
        let (base, buffer) = buffers.range(..=ptr.0).next_back().ok_or_else(|| {
            ErrorKind::DeviceError(format!("Address {} is not allocated", ptr))
        })?;

        let offset = (ptr.0 - base) as usize;
        if offset + len > buffer.bytes {
            Err(ErrorKind::DeviceError(format!(
                "Access of {} bytes at {} exceeds its allocation",
                len, ptr
            )))?;
        }

        Ok((buffer.clone(), offset))
    }

    fn check_device(device_id: i32) -> Result<()> {
        if device_id != 0 {
            Err(ErrorKind::InvalidArgument(format!(
                "Emulated device has no device {}",
                device_id
            )))?;
        }
        Ok(())
    }
}

impl DeviceMemoryManager for EmulatedDevice {
    fn allocate(&self, bytes: usize, device_id: i32) -> Result<DevicePtr> {
        Self::check_device(device_id)?;

        let footprint = ((bytes as u64 / ALLOCATION_ALIGNMENT) + 1) * ALLOCATION_ALIGNMENT;
        let address = self.next_address.fetch_add(footprint, Ordering::SeqCst);
        self.buffers()
            .insert(address, Arc::new(EmulatedBuffer::new(bytes)));

        Ok(DevicePtr(address))
    }

    fn free(&self, ptr: DevicePtr, _device_id: i32) {
        if self.buffers().remove(&ptr.0).is_none() {
            self.double_frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8], device_id: i32) -> Result<()> {
        Self::check_device(device_id)?;
        let (buffer, offset) = self.resolve(dst, src.len())?;
        buffer.write_bytes(offset, src);
        Ok(())
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr, device_id: i32) -> Result<()> {
        Self::check_device(device_id)?;
        let (buffer, offset) = self.resolve(src, dst.len())?;
        buffer.read_bytes(offset, dst);
        Ok(())
    }
}

impl DeviceBackend for EmulatedDevice {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn launch_fill(&self, args: &FillKernelArgs, dims: LaunchDims, device_id: i32) -> Result<()> {
        Self::check_device(device_id)?;
        if dims.threads() == 0 {
            Err(ErrorKind::InvalidArgument(
                "Grid and block size must be non-zero".to_string(),
            ))?;
        }

        let bucket_count = args.bucket_count as usize;
        let row_count = args.row_count as usize;
        let value_size = args.value_size as usize;

        let (buckets, _) = self.resolve(args.buckets, 2 * bucket_count * WORD_BYTES)?;
        let (chain, _) = self.resolve(args.chain, row_count * WORD_BYTES)?;
        let (error_code, _) = self.resolve(args.error_code, size_of::<i32>())?;

        let set_error = |code: i32| {
            let word = error_code.word(0);
            word.fetch_and(!0xffff_ffff_u64, Ordering::Relaxed);
            word.fetch_or(code as u32 as u64, Ordering::Relaxed);
        };

        if !is_supported_width(value_size) {
            set_error(FILL_ERR_BAD_WIDTH);
            return Ok(());
        }
        let (column, column_offset) = self.resolve(args.column, row_count * value_size)?;
        if column_offset % WORD_BYTES != 0 {
            Err(ErrorKind::DeviceError(
                "Key column must be word-aligned".to_string(),
            ))?;
        }

        let threads = dims.threads();
        self.pool.install(|| {
            // Kernel 1: initialize buckets and chain
            (0..threads).into_par_iter().for_each(|tid| {
                (tid..bucket_count).step_by(threads).for_each(|bucket| {
                    buckets
                        .word(2 * bucket)
                        .store(EMPTY_SLOT as u64, Ordering::Relaxed);
                    buckets.word(2 * bucket + 1).store(0, Ordering::Relaxed);
                });
                (tid..row_count).step_by(threads).for_each(|row| {
                    chain.word(row).store(EMPTY_SLOT as u64, Ordering::Relaxed);
                });
            });

            // Kernel 2: insert rows
            (0..threads).into_par_iter().for_each(|tid| {
                (tid..row_count).step_by(threads).for_each(|row| {
                    let key = column.load_key(row, value_size);
                    let bucket = match key.checked_sub(args.int_min) {
                        Some(offset) if offset >= 0 && (offset as u64) < args.bucket_count => {
                            offset as usize
                        }
                        _ => {
                            set_error(FILL_ERR_OUT_OF_RANGE);
                            return;
                        }
                    };

                    let prev_head = buckets
                        .word(2 * bucket)
                        .swap(row as u64, Ordering::AcqRel);
                    chain.word(row).store(prev_head, Ordering::Relaxed);
                    buckets.word(2 * bucket + 1).fetch_add(1, Ordering::Relaxed);
                });
            });
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_key_sign_extends() -> Result<()> {
        let device = EmulatedDevice::new(Some(1))?;
        let ptr = device.allocate(8, 0)?;
        device.copy_to_device(ptr, &[0xfe, 0xff, 0x05, 0x00, 0xff, 0xff, 0xff, 0xff], 0)?;

        let (buffer, _) = device.resolve(ptr, 8)?;
        assert_eq!(-2, buffer.load_key(0, 2));
        assert_eq!(5, buffer.load_key(1, 2));
        assert_eq!(-1, buffer.load_key(1, 4));
        assert_eq!(-2, buffer.load_key(0, 1));
        Ok(())
    }

    #[test]
    fn unaligned_copies() -> Result<()> {
        let device = EmulatedDevice::new(Some(1))?;
        let ptr = device.allocate(19, 0)?;
        let data: Vec<u8> = (1..=17).collect();
        device.copy_to_device(ptr.add(2)?, &data, 0)?;

        let mut out = vec![0_u8; 19];
        device.copy_from_device(&mut out, ptr, 0)?;
        assert_eq!(&[0, 0], &out[..2]);
        assert_eq!(data.as_slice(), &out[2..]);
        Ok(())
    }

    #[test]
    fn out_of_bounds_copy_fails() -> Result<()> {
        let device = EmulatedDevice::new(Some(1))?;
        let ptr = device.allocate(4, 0)?;

        assert!(device.copy_to_device(ptr, &[0; 5], 0).is_err());
        assert!(device.copy_to_device(DevicePtr(1), &[0], 0).is_err());
        Ok(())
    }

    #[test]
    fn unknown_device_is_rejected() -> Result<()> {
        let device = EmulatedDevice::new(Some(1))?;
        assert!(device.allocate(8, 1).is_err());
        Ok(())
    }
}
