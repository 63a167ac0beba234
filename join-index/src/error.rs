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

//! Errors of the join index.
//!
//! An ineligible predicate is not an error; `JoinHashTable::get_instance`
//! returns `Ok(None)` in that case. Build failures are reported internally as
//! `BuildFailure` and also surface as `Ok(None)`. `ConfigurationFault` and
//! `InvariantViolation` are fatal for the compilation of the affected query.

use error_chain::error_chain;

error_chain! {
    errors {
        BuildFailure(code: i32) {
            description("Hash table build failure")
            display("Hash table build failed with error code {}", code)
        }
        ConfigurationFault(msg: String) {
            description("Configuration fault")
            display("Aborted with: {}", msg)
        }
        DeviceError(msg: String) {
            description("Device error")
            display("Aborted with: {}", msg)
        }
        IntegerOverflow(msg: String) {
            description("Integer overflow error")
            display("Aborted with: {}", msg)
        }
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        InvariantViolation(msg: String) {
            description("Invariant violation")
            display("Aborting with: {}", msg)
        }
    }

    foreign_links {
        Cuda(rustacuda::error::CudaError) #[cfg(feature = "cuda")];
        Io(::std::io::Error);
        RayonThreadPoolBuild(rayon::ThreadPoolBuildError);
        Toml(toml::de::Error);
    }
}

/// Converts raw CUDA driver results into a `Result`.
#[cfg(feature = "cuda")]
pub trait ToResult {
    fn to_result(self) -> Result<()>;
}

#[cfg(feature = "cuda")]
impl ToResult for cuda_driver_sys::CUresult {
    fn to_result(self) -> Result<()> {
        match self {
            cuda_driver_sys::CUresult::CUDA_SUCCESS => Ok(()),
            other => Err(ErrorKind::DeviceError(format!("CUDA driver returned {:?}", other)).into()),
        }
    }
}
