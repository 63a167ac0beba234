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

//! Execution context of a compiled query.
//!
//! The executor holds the configuration, the device capability that is
//! resolved once at creation, the code generation state, and the registry of
//! join hash tables that generated code refers to.

use crate::codegen::CgenState;
use crate::device::emulated::EmulatedDevice;
use crate::device::{DeviceBackend, LaunchDims};
use crate::error::{ErrorKind, Result};
use crate::expression_range::{FragmentStatsRange, RangeAnalyzer};
use crate::join_hash_table::JoinHashTable;
use crate::storage::MemoryLevel;
use crate::strategy::{BuildStrategy, DeviceStrategy, HostStrategy};
use log::info;
use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Selects the device on which device-level hash tables are built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackendKind {
    None,
    Emulated,
    Cuda,
}

impl Default for DeviceBackendKind {
    fn default() -> Self {
        DeviceBackendKind::None
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Allows queries to use dense hash joins. Off by default.
    pub enable_dense_hash_join: bool,

    /// Largest key range for which a dense hash table is built.
    pub max_bucket_count: usize,

    /// Launch dimensions of device kernels.
    pub launch: LaunchDims,

    pub device_backend: DeviceBackendKind,

    /// Worker threads of the emulated device. Defaults to one per core.
    pub emulated_threads: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enable_dense_hash_join: false,
            max_bucket_count: 1 << 28,
            launch: LaunchDims::default(),
            device_backend: DeviceBackendKind::None,
            emulated_threads: None,
        }
    }
}

impl ExecutorConfig {
    /// Parses a TOML configuration. Missing keys take their default value.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// The device available to the executor.
#[derive(Clone, Default)]
pub struct DeviceCapability {
    backend: Option<Arc<dyn DeviceBackend>>,
}

impl DeviceCapability {
    pub fn host_only() -> Self {
        Self { backend: None }
    }

    pub fn with_backend(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Creates the device backend selected by the configuration.
    pub fn resolve(config: &ExecutorConfig) -> Result<Self> {
        let capability = match config.device_backend {
            DeviceBackendKind::None => Self::host_only(),
            DeviceBackendKind::Emulated => Self::with_backend(Arc::new(EmulatedDevice::new(
                config.emulated_threads,
            )?)),
            DeviceBackendKind::Cuda => Self::resolve_cuda()?,
        };

        match capability.backend {
            Some(ref backend) => info!("Device capability: {}", backend.name()),
            None => info!("Device capability: host only"),
        }

        Ok(capability)
    }

    #[cfg(feature = "cuda")]
    fn resolve_cuda() -> Result<Self> {
        match crate::device::cuda::CudaDevice::detect()? {
            Some(device) => Ok(Self::with_backend(Arc::new(device))),
            None => Err(ErrorKind::ConfigurationFault("No CUDA device is available".to_string()).into()),
        }
    }

    #[cfg(not(feature = "cuda"))]
    fn resolve_cuda() -> Result<Self> {
        Err(ErrorKind::ConfigurationFault(
            "The CUDA backend requires the \"cuda\" feature".to_string(),
        )
        .into())
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend(&self) -> Option<&Arc<dyn DeviceBackend>> {
        self.backend.as_ref()
    }
}

impl fmt::Debug for DeviceCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCapability")
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .finish()
    }
}

/// Identifies a join hash table within its executor.
///
/// Generated code embeds the handle as a constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinTableHandle(pub u32);

impl fmt::Display for JoinTableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Executor {
    config: ExecutorConfig,
    capability: DeviceCapability,
    range_analyzer: Arc<dyn RangeAnalyzer>,
    host_strategy: Arc<dyn BuildStrategy>,
    device_strategy: Option<Arc<dyn BuildStrategy>>,
    cgen_state: Mutex<CgenState>,
    join_tables: RwLock<Vec<Arc<JoinHashTable>>>,
}

impl Executor {
    /// Creates an executor and resolves its device capability.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        let capability = DeviceCapability::resolve(&config)?;
        Ok(Self::with_capability(config, capability))
    }

    /// Creates an executor with an already resolved device capability.
    ///
    /// `config.device_backend` is ignored.
    pub fn with_capability(config: ExecutorConfig, capability: DeviceCapability) -> Self {
        let device_strategy = capability.backend().map(|backend| {
            Arc::new(DeviceStrategy::new(backend.clone(), config.launch)) as Arc<dyn BuildStrategy>
        });

        Self {
            config,
            capability,
            range_analyzer: Arc::new(FragmentStatsRange),
            host_strategy: Arc::new(HostStrategy),
            device_strategy,
            cgen_state: Mutex::new(CgenState::new()),
            join_tables: RwLock::new(Vec::new()),
        }
    }

    pub fn with_range_analyzer(mut self, range_analyzer: Arc<dyn RangeAnalyzer>) -> Self {
        self.range_analyzer = range_analyzer;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn capability(&self) -> &DeviceCapability {
        &self.capability
    }

    pub fn launch_dims(&self) -> LaunchDims {
        self.config.launch
    }

    pub fn range_analyzer(&self) -> &dyn RangeAnalyzer {
        self.range_analyzer.as_ref()
    }

    /// Code generation state of the query compiled by this executor.
    pub fn cgen_state(&self) -> MutexGuard<'_, CgenState> {
        self.cgen_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the build strategy for a memory level.
    pub fn strategy_for(&self, memory_level: MemoryLevel) -> Result<Arc<dyn BuildStrategy>> {
        match memory_level {
            MemoryLevel::Host => Ok(self.host_strategy.clone()),
            MemoryLevel::Device => self.device_strategy.clone().ok_or_else(|| {
                ErrorKind::ConfigurationFault(
                    "Device hash join requested, but no device backend is configured".to_string(),
                )
                .into()
            }),
        }
    }

    /// Registers a built join hash table.
    ///
    /// `make_table` receives the handle under which the table is registered.
    pub fn register_join_table<F>(&self, make_table: F) -> Result<Arc<JoinHashTable>>
    where
        F: FnOnce(JoinTableHandle) -> JoinHashTable,
    {
        let mut tables = self
            .join_tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let handle = u32::try_from(tables.len()).map_err(|_| {
            ErrorKind::IntegerOverflow("Too many join hash tables".to_string())
        })?;
        let table = Arc::new(make_table(JoinTableHandle(handle)));
        tables.push(table.clone());

        Ok(table)
    }

    pub fn join_table(&self, handle: JoinTableHandle) -> Option<Arc<JoinHashTable>> {
        self.join_tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(handle.0 as usize)
            .cloned()
    }

    pub fn num_join_tables(&self) -> usize {
        self.join_tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Runtime entry point of `hash_join_idx`.
    pub fn probe(
        &self,
        handle: JoinTableHandle,
        key: i64,
        int_min: i64,
        int_max: i64,
    ) -> Result<i64> {
        let table = self.join_table(handle).ok_or_else(|| {
            ErrorKind::InvariantViolation(format!("Unknown join table handle {}", handle))
        })?;
        table.probe_within(key, int_min, int_max)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("capability", &self.capability)
            .field("num_join_tables", &self.num_join_tables())
            .finish()
    }
}
