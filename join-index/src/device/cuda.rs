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

//! CUDA device backend.
//!
//! Memory is managed through the CUDA driver API. The fill kernels are
//! compiled into a `fatbinary` module by the build script, and loaded once per
//! device when the backend is created.
//!
//! **Important:** The module is bound to the backend's CUDA context. Tests
//! should create a single backend instance and share it.

use super::{DeviceBackend, DeviceMemoryManager, DevicePtr, FillKernelArgs, LaunchDims};
use crate::error::{ErrorKind, Result, ToResult};
use crate::runtime::is_supported_width;
use cuda_driver_sys::{cuMemAlloc_v2, cuMemFree_v2, cuMemcpyDtoH_v2, cuMemcpyHtoD_v2, CUdeviceptr};
use log::{info, warn};
use rustacuda::context::{Context, ContextFlags, CurrentContext};
use rustacuda::device::Device;
use rustacuda::launch;
use rustacuda::module::Module;
use rustacuda::stream::{Stream, StreamFlags};
use rustacuda::CudaFlags;
use std::ffi::{c_void, CString};

/// A CUDA GPU.
pub struct CudaDevice {
    device_id: i32,
    // Must be dropped before the context
    module: Module,
    context: Context,
}

// SAFETY: The driver API is thread-safe. Every method makes the device's
// context current on the calling thread before it accesses the device.
unsafe impl Send for CudaDevice {}
unsafe impl Sync for CudaDevice {}

impl CudaDevice {
    /// Returns the first CUDA device, or `None` if the driver reports no
    /// devices.
    pub fn detect() -> Result<Option<Self>> {
        if let Err(e) = rustacuda::init(CudaFlags::empty()) {
            info!("CUDA driver is unavailable: {}", e);
            return Ok(None);
        }
        if Device::num_devices()? == 0 {
            return Ok(None);
        }

        Self::new(0).map(Some)
    }

    pub fn new(device_id: i32) -> Result<Self> {
        rustacuda::init(CudaFlags::empty())?;
        let device = Device::get_device(device_id as u32)?;
        let context =
            Context::create_and_push(ContextFlags::MAP_HOST | ContextFlags::SCHED_AUTO, device)?;

        let module_path = CString::new(env!("CUDAUTILS_PATH")).map_err(|_| {
            ErrorKind::ConfigurationFault(
                "Failed to load CUDA module, check your CUDAUTILS_PATH".to_string(),
            )
        })?;
        let module = Module::load_from_file(&module_path)?;

        info!("Using CUDA device {} ({})", device_id, device.name()?);

        Ok(Self {
            device_id,
            module,
            context,
        })
    }

    fn make_current(&self, device_id: i32) -> Result<()> {
        if device_id != self.device_id {
            Err(ErrorKind::InvalidArgument(format!(
                "Backend manages CUDA device {}, not {}",
                self.device_id, device_id
            )))?;
        }
        CurrentContext::set_current(&self.context)?;
        Ok(())
    }
}

macro_rules! impl_fill_kernel {
    ($Suffix:ident) => {
        paste::item! {
            impl CudaDevice {
                fn [<launch_fill_ $Suffix>](
                    &self,
                    args: &FillKernelArgs,
                    dims: LaunchDims,
                    stream: &Stream,
                ) -> Result<()> {
                    let module = &self.module;
                    let grid_size = dims.grid_size;
                    let block_size = dims.block_size;

                    unsafe {
                        launch!(
                            module.[<fill_hash_join_buff_ $Suffix>]<<<
                            grid_size,
                            block_size,
                            0,
                            stream
                            >>>(
                                args.buckets.0,
                                args.chain.0,
                                args.error_code.0,
                                args.bucket_count,
                                args.column.0,
                                args.row_count,
                                args.int_min
                               ))?;
                    }

                    Ok(())
                }
            }
        }
    };
}

impl_fill_kernel!(int8);
impl_fill_kernel!(int16);
impl_fill_kernel!(int32);
impl_fill_kernel!(int64);

impl DeviceMemoryManager for CudaDevice {
    fn allocate(&self, bytes: usize, device_id: i32) -> Result<DevicePtr> {
        self.make_current(device_id)?;

        // Zero-sized allocations are invalid in CUDA
        let mut ptr: CUdeviceptr = 0;
        unsafe { cuMemAlloc_v2(&mut ptr, bytes.max(1)) }.to_result()?;

        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr, device_id: i32) {
        let result = self
            .make_current(device_id)
            .and_then(|_| unsafe { cuMemFree_v2(ptr.0) }.to_result());
        if let Err(e) = result {
            warn!("Failed to free device memory at {}: {}", ptr, e);
        }
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8], device_id: i32) -> Result<()> {
        self.make_current(device_id)?;
        if src.is_empty() {
            return Ok(());
        }

        unsafe { cuMemcpyHtoD_v2(dst.0, src.as_ptr() as *const c_void, src.len()) }.to_result()
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr, device_id: i32) -> Result<()> {
        self.make_current(device_id)?;
        if dst.is_empty() {
            return Ok(());
        }

        unsafe { cuMemcpyDtoH_v2(dst.as_mut_ptr() as *mut c_void, src.0, dst.len()) }.to_result()
    }
}

impl DeviceBackend for CudaDevice {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn launch_fill(&self, args: &FillKernelArgs, dims: LaunchDims, device_id: i32) -> Result<()> {
        self.make_current(device_id)?;
        if dims.threads() == 0 {
            Err(ErrorKind::InvalidArgument(
                "Grid and block size must be non-zero".to_string(),
            ))?;
        }
        if !is_supported_width(args.value_size as usize) {
            let code = crate::runtime::FILL_ERR_BAD_WIDTH.to_le_bytes();
            return self.copy_to_device(args.error_code, &code, device_id);
        }

        let module = &self.module;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
        let grid_size = dims.grid_size;
        let block_size = dims.block_size;

        unsafe {
            launch!(
                module.init_hash_join_buff_on_device<<<
                grid_size,
                block_size,
                0,
                stream
                >>>(
                    args.buckets.0,
                    args.chain.0,
                    args.bucket_count,
                    args.row_count
                   ))?;
        }

        match args.value_size {
            1 => self.launch_fill_int8(args, dims, &stream)?,
            2 => self.launch_fill_int16(args, dims, &stream)?,
            4 => self.launch_fill_int32(args, dims, &stream)?,
            _ => self.launch_fill_int64(args, dims, &stream)?,
        }

        stream.synchronize()?;
        Ok(())
    }
}
