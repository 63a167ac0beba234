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

//! Physical column storage.
//!
//! Tables are split into fragments, and each fragment stores one chunk per
//! column. The join index resolves the raw buffer of a chunk through the
//! `BufferProvider` trait, either as a host slice or as device memory.
//!
//! `InMemoryStorage` is a simple provider that keeps all chunks in host memory
//! and uploads them to a device on demand.

use crate::analyzer::TypeInfo;
use crate::device::{DeviceAllocation, DeviceBackend, DevicePtr};
use crate::error::{ErrorKind, Result};
use num_traits::{PrimInt, ToPrimitive};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// An integer type that can be stored in a column chunk.
pub trait ColumnValue: PrimInt + ToPrimitive {
    const BYTES: usize;

    /// Appends the value in little-endian byte order.
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_column_value {
    ($Type:ty) => {
        impl ColumnValue for $Type {
            const BYTES: usize = std::mem::size_of::<$Type>();

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_column_value!(i16);
impl_column_value!(i32);
impl_column_value!(i64);

/// Memory level at which a query executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLevel {
    Host,
    Device,
}

impl MemoryLevel {
    /// Index into per-level arrays, such as `FragmentInfo::device_ids`.
    pub fn index(self) -> usize {
        match self {
            MemoryLevel::Host => 0,
            MemoryLevel::Device => 1,
        }
    }
}

impl fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLevel::Host => write!(f, "host"),
            MemoryLevel::Device => write!(f, "device"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub db_id: i32,
    pub table_id: i32,
    pub column_id: i32,
    pub fragment_id: i32,
}

/// Value statistics of a chunk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkStats {
    pub min: i64,
    pub max: i64,
    pub has_nulls: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkMetadata {
    pub num_bytes: usize,
    pub num_elements: usize,
    pub stats: ChunkStats,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FragmentInfo {
    pub fragment_id: i32,
    /// Chunk metadata by column id.
    pub chunk_metadata: HashMap<i32, ChunkMetadata>,
    /// Device on which the fragment resides, indexed by `MemoryLevel::index`.
    pub device_ids: [i32; 2],
}

/// The fragments of one table scanned by a query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryInfo {
    pub fragments: Vec<FragmentInfo>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDescriptor {
    pub table_id: i32,
    pub column_id: i32,
    pub is_virtual: bool,
    pub type_info: TypeInfo,
}

/// A raw column buffer.
///
/// The buffer borrows memory owned by the storage manager.
#[derive(Clone, Debug)]
pub enum ColumnBuffer {
    Host(Arc<[u8]>),
    Device(DevicePtr),
}

impl ColumnBuffer {
    pub fn memory_level(&self) -> MemoryLevel {
        match self {
            ColumnBuffer::Host(_) => MemoryLevel::Host,
            ColumnBuffer::Device(_) => MemoryLevel::Device,
        }
    }
}

/// Resolves physical column buffers.
pub trait BufferProvider {
    fn db_id(&self) -> i32;

    fn column_descriptor(&self, table_id: i32, column_id: i32) -> Option<ColumnDescriptor>;

    /// Returns the buffer of a chunk at the requested memory level.
    ///
    /// Returns `Ok(None)` if the storage doesn't hold the chunk.
    fn buffer_for(
        &self,
        cd: &ColumnDescriptor,
        key: &ChunkKey,
        memory_level: MemoryLevel,
        device_id: i32,
        num_bytes: usize,
        num_elements: usize,
    ) -> Result<Option<ColumnBuffer>>;
}

struct StoredChunk {
    data: Option<Arc<[u8]>>,
    metadata: ChunkMetadata,
}

struct StoredColumn {
    descriptor: ColumnDescriptor,
    chunks: Vec<StoredChunk>,
}

/// Host-resident table storage.
pub struct InMemoryStorage {
    db_id: i32,
    columns: HashMap<(i32, i32), StoredColumn>,
    device: Option<Arc<dyn DeviceBackend>>,
    device_chunks: Mutex<HashMap<(ChunkKey, i32), DeviceAllocation>>,
}

impl InMemoryStorage {
    pub fn new(db_id: i32) -> Self {
        Self {
            db_id,
            columns: HashMap::new(),
            device: None,
            device_chunks: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a device to which chunks are uploaded for device queries.
    pub fn with_device(mut self, device: Arc<dyn DeviceBackend>) -> Self {
        self.device = Some(device);
        self
    }

    /// Adds a non-nullable integer column, one slice per fragment.
    pub fn add_column<T: ColumnValue>(
        &mut self,
        table_id: i32,
        column_id: i32,
        type_info: TypeInfo,
        fragments: &[&[T]],
    ) -> Result<()> {
        let nullable: Vec<Vec<Option<T>>> = fragments
            .iter()
            .map(|fragment| fragment.iter().copied().map(Some).collect())
            .collect();
        let nullable: Vec<&[Option<T>]> = nullable.iter().map(|f| f.as_slice()).collect();

        self.add_nullable_column(table_id, column_id, type_info, &nullable)
    }

    /// Adds a nullable integer column, one slice per fragment.
    ///
    /// `None` is stored as the smallest value of `T`, which is reserved as the
    /// NULL sentinel and excluded from the chunk's min/max statistics.
    pub fn add_nullable_column<T: ColumnValue>(
        &mut self,
        table_id: i32,
        column_id: i32,
        type_info: TypeInfo,
        fragments: &[&[Option<T>]],
    ) -> Result<()> {
        if type_info.size() != T::BYTES {
            Err(ErrorKind::InvalidArgument(format!(
                "Column type is {} bytes wide, but values are {} bytes",
                type_info.size(),
                T::BYTES
            )))?;
        }

        let chunks = fragments
            .iter()
            .map(|fragment| Self::encode_chunk(fragment))
            .collect::<Result<Vec<_>>>()?;

        self.drop_device_chunks(table_id, column_id, None);
        self.columns.insert(
            (table_id, column_id),
            StoredColumn {
                descriptor: ColumnDescriptor {
                    table_id,
                    column_id,
                    is_virtual: false,
                    type_info,
                },
                chunks,
            },
        );

        Ok(())
    }

    /// Adds a virtual column, e.g., a row id, that has no physical storage.
    pub fn add_virtual_column(&mut self, table_id: i32, column_id: i32, type_info: TypeInfo) {
        self.drop_device_chunks(table_id, column_id, None);
        self.columns.insert(
            (table_id, column_id),
            StoredColumn {
                descriptor: ColumnDescriptor {
                    table_id,
                    column_id,
                    is_virtual: true,
                    type_info,
                },
                chunks: Vec::new(),
            },
        );
    }

    /// Drops the data of a chunk, but keeps its metadata.
    pub fn evict_chunk(&mut self, table_id: i32, column_id: i32, fragment_id: i32) {
        self.drop_device_chunks(table_id, column_id, Some(fragment_id));
        if let Some(chunk) = self
            .columns
            .get_mut(&(table_id, column_id))
            .and_then(|column| column.chunks.get_mut(fragment_id as usize))
        {
            chunk.data = None;
        }
    }

    /// Describes the fragments of a table for query compilation.
    pub fn query_info(&self, table_id: i32) -> QueryInfo {
        let num_fragments = self
            .columns
            .iter()
            .filter(|((table, _), _)| *table == table_id)
            .map(|(_, column)| column.chunks.len())
            .max()
            .unwrap_or(0);

        let fragments = (0..num_fragments)
            .map(|fragment| FragmentInfo {
                fragment_id: fragment as i32,
                chunk_metadata: self
                    .columns
                    .iter()
                    .filter(|((table, _), _)| *table == table_id)
                    .filter_map(|((_, column_id), column)| {
                        column
                            .chunks
                            .get(fragment)
                            .map(|chunk| (*column_id, chunk.metadata))
                    })
                    .collect(),
                device_ids: [0, 0],
            })
            .collect();

        QueryInfo { fragments }
    }

    /// Number of chunks currently uploaded to the device.
    pub fn device_chunk_count(&self) -> usize {
        self.device_chunks().len()
    }

    fn device_chunks(&self) -> std::sync::MutexGuard<'_, HashMap<(ChunkKey, i32), DeviceAllocation>> {
        self.device_chunks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Releases uploaded copies of a column, or of a single fragment.
    fn drop_device_chunks(&self, table_id: i32, column_id: i32, fragment_id: Option<i32>) {
        self.device_chunks().retain(|(key, _), _| {
            key.table_id != table_id
                || key.column_id != column_id
                || fragment_id.map_or(false, |id| key.fragment_id != id)
        });
    }

    fn encode_chunk<T: ColumnValue>(values: &[Option<T>]) -> Result<StoredChunk> {
        let mut data = Vec::with_capacity(values.len() * T::BYTES);
        let mut min: Option<i64> = None;
        let mut max: Option<i64> = None;
        let mut has_nulls = false;

        for value in values {
            match value {
                Some(v) => {
                    let v64 = v.to_i64().ok_or_else(|| {
                        ErrorKind::IntegerOverflow("Key doesn't fit into i64".to_string())
                    })?;
                    if *v == T::min_value() {
                        Err(ErrorKind::InvalidArgument(
                            "The smallest value of a type is reserved for NULL".to_string(),
                        ))?;
                    }
                    min = Some(min.map_or(v64, |m| m.min(v64)));
                    max = Some(max.map_or(v64, |m| m.max(v64)));
                    v.write_le(&mut data);
                }
                None => {
                    has_nulls = true;
                    T::min_value().write_le(&mut data);
                }
            }
        }

        // An empty or all-NULL chunk has an empty range
        let stats = ChunkStats {
            min: min.unwrap_or(0),
            max: max.unwrap_or(-1),
            has_nulls,
        };

        Ok(StoredChunk {
            metadata: ChunkMetadata {
                num_bytes: data.len(),
                num_elements: values.len(),
                stats,
            },
            data: Some(data.into()),
        })
    }
}

impl BufferProvider for InMemoryStorage {
    fn db_id(&self) -> i32 {
        self.db_id
    }

    fn column_descriptor(&self, table_id: i32, column_id: i32) -> Option<ColumnDescriptor> {
        self.columns
            .get(&(table_id, column_id))
            .map(|column| column.descriptor.clone())
    }

    fn buffer_for(
        &self,
        cd: &ColumnDescriptor,
        key: &ChunkKey,
        memory_level: MemoryLevel,
        device_id: i32,
        num_bytes: usize,
        num_elements: usize,
    ) -> Result<Option<ColumnBuffer>> {
        if key.db_id != self.db_id {
            return Ok(None);
        }

        let chunk = match self
            .columns
            .get(&(cd.table_id, cd.column_id))
            .and_then(|column| column.chunks.get(key.fragment_id as usize))
        {
            Some(chunk) => chunk,
            None => return Ok(None),
        };
        let data = match chunk.data {
            Some(ref data) => data,
            None => return Ok(None),
        };

        if chunk.metadata.num_bytes != num_bytes || chunk.metadata.num_elements != num_elements {
            Err(ErrorKind::InvalidArgument(format!(
                "Chunk {:?} has {} bytes and {} elements, but {} bytes and {} elements were requested",
                key, chunk.metadata.num_bytes, chunk.metadata.num_elements, num_bytes, num_elements
            )))?;
        }

        match memory_level {
            MemoryLevel::Host => Ok(Some(ColumnBuffer::Host(data.clone()))),
            MemoryLevel::Device => {
                let device = self.device.as_ref().ok_or_else(|| {
                    ErrorKind::ConfigurationFault(
                        "Storage has no device to upload chunks to".to_string(),
                    )
                })?;

                let mut device_chunks = self.device_chunks();
                let cache_key = (key.clone(), device_id);
                if let Some(alloc) = device_chunks.get(&cache_key) {
                    return Ok(Some(ColumnBuffer::Device(alloc.as_device_ptr())));
                }

                let alloc = DeviceAllocation::new(device.clone(), num_bytes, device_id)?;
                alloc.copy_from_host(data)?;
                let ptr = alloc.as_device_ptr();
                device_chunks.insert(cache_key, alloc);

                Ok(Some(ColumnBuffer::Device(ptr)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::SqlType;
    use crate::device::emulated::EmulatedDevice;

    fn int_type() -> TypeInfo {
        TypeInfo::new(SqlType::Int, true)
    }

    #[test]
    fn query_info_has_stats() -> Result<()> {
        let mut storage = InMemoryStorage::new(1);
        storage.add_column::<i32>(7, 1, int_type(), &[&[3, -2, 8], &[10]])?;

        let info = storage.query_info(7);
        assert_eq!(2, info.fragments.len());

        let meta = info.fragments[0].chunk_metadata[&1];
        assert_eq!(12, meta.num_bytes);
        assert_eq!(3, meta.num_elements);
        assert_eq!(
            ChunkStats {
                min: -2,
                max: 8,
                has_nulls: false
            },
            meta.stats
        );
        assert!(storage.query_info(8).fragments.is_empty());
        Ok(())
    }

    #[test]
    fn nulls_are_recorded() -> Result<()> {
        let mut storage = InMemoryStorage::new(1);
        storage.add_nullable_column::<i64>(
            7,
            1,
            TypeInfo::new(SqlType::BigInt, false),
            &[&[Some(1), None]],
        )?;

        let stats = storage.query_info(7).fragments[0].chunk_metadata[&1].stats;
        assert!(stats.has_nulls);
        assert_eq!((1, 1), (stats.min, stats.max));
        Ok(())
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let mut storage = InMemoryStorage::new(1);
        let result = storage.add_column::<i64>(7, 1, int_type(), &[&[1]]);
        assert!(result.is_err());
    }

    #[test]
    fn host_buffer() -> Result<()> {
        let mut storage = InMemoryStorage::new(1);
        storage.add_column::<i32>(7, 1, int_type(), &[&[1, 2]])?;
        let cd = storage.column_descriptor(7, 1).ok_or("missing column")?;
        let key = ChunkKey {
            db_id: 1,
            table_id: 7,
            column_id: 1,
            fragment_id: 0,
        };

        match storage.buffer_for(&cd, &key, MemoryLevel::Host, 0, 8, 2)? {
            Some(ColumnBuffer::Host(data)) => assert_eq!(&[1, 0, 0, 0, 2, 0, 0, 0], &data[..]),
            other => panic!("Unexpected buffer {:?}", other),
        }

        storage.evict_chunk(7, 1, 0);
        assert!(storage
            .buffer_for(&cd, &key, MemoryLevel::Host, 0, 8, 2)?
            .is_none());
        Ok(())
    }

    #[test]
    fn device_buffer_is_uploaded_once() -> Result<()> {
        let device = Arc::new(EmulatedDevice::new(Some(1))?);
        let mut storage = InMemoryStorage::new(1).with_device(device.clone());
        storage.add_column::<i16>(7, 1, TypeInfo::new(SqlType::SmallInt, true), &[&[4, 5]])?;
        let cd = storage.column_descriptor(7, 1).ok_or("missing column")?;
        let key = ChunkKey {
            db_id: 1,
            table_id: 7,
            column_id: 1,
            fragment_id: 0,
        };

        let first = storage.buffer_for(&cd, &key, MemoryLevel::Device, 0, 4, 2)?;
        let second = storage.buffer_for(&cd, &key, MemoryLevel::Device, 0, 4, 2)?;
        match (first, second) {
            (Some(ColumnBuffer::Device(a)), Some(ColumnBuffer::Device(b))) => assert_eq!(a, b),
            other => panic!("Unexpected buffers {:?}", other),
        }
        assert_eq!(1, storage.device_chunk_count());
        assert_eq!(1, device.live_allocations());

        storage.evict_chunk(7, 1, 0);
        assert_eq!(0, storage.device_chunk_count());
        assert_eq!(0, device.live_allocations());
        Ok(())
    }

    #[test]
    fn device_buffer_needs_device() -> Result<()> {
        let mut storage = InMemoryStorage::new(1);
        storage.add_column::<i32>(7, 1, int_type(), &[&[1]])?;
        let cd = storage.column_descriptor(7, 1).ok_or("missing column")?;
        let key = ChunkKey {
            db_id: 1,
            table_id: 7,
            column_id: 1,
            fragment_id: 0,
        };

        assert!(storage
            .buffer_for(&cd, &key, MemoryLevel::Device, 0, 4, 1)
            .is_err());
        Ok(())
    }
}
