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

use join_index::executor::DeviceBackendKind;
use join_index::storage::MemoryLevel;
use serde_derive::Serialize;
use structopt::clap::arg_enum;

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgMemoryLevel {
        Host,
        Device,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgDeviceBackend {
        Emulated,
        Cuda,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgInnerDistribution {
        Unique,
        Duplicates,
        Uniform,
    }
}

arg_enum! {
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgKeyBytes {
        Bytes4,
        Bytes8,
    }
}

impl From<ArgMemoryLevel> for MemoryLevel {
    fn from(level: ArgMemoryLevel) -> Self {
        match level {
            ArgMemoryLevel::Host => MemoryLevel::Host,
            ArgMemoryLevel::Device => MemoryLevel::Device,
        }
    }
}

impl From<ArgDeviceBackend> for DeviceBackendKind {
    fn from(backend: ArgDeviceBackend) -> Self {
        match backend {
            ArgDeviceBackend::Emulated => DeviceBackendKind::Emulated,
            ArgDeviceBackend::Cuda => DeviceBackendKind::Cuda,
        }
    }
}
