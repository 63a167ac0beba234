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

use datagen::relation::{DenseKeyRelation, ProbeKeyRelation};
use itertools::Itertools;
use join_index::analyzer::{BinOper, ColumnVar, Expr, OpType, SqlType, TypeInfo};
use join_index::codegen::{RowEvaluator, RuntimeFunction, Value};
use join_index::device::emulated::EmulatedDevice;
use join_index::device::LaunchDims;
use join_index::error::ErrorKind;
use join_index::executor::{DeviceCapability, Executor, ExecutorConfig, JoinTableHandle};
use join_index::expression_range::{ExpressionRange, RangeAnalyzer};
use join_index::runtime::NO_MATCH;
use join_index::storage::{InMemoryStorage, MemoryLevel, QueryInfo};
use join_index::JoinHashTable;
use once_cell::sync::Lazy;
use std::error::Error;
use std::result::Result;
use std::sync::Arc;

const OUTER_TABLE: i32 = 1;
const INNER_TABLE: i32 = 2;
const KEY_COLUMN: i32 = 1;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

fn int_type() -> TypeInfo {
    TypeInfo::new(SqlType::Int, true)
}

fn enabled_config() -> ExecutorConfig {
    ExecutorConfig {
        enable_dense_hash_join: true,
        launch: LaunchDims::new(3, 32),
        ..ExecutorConfig::default()
    }
}

fn equi_join(outer_type: TypeInfo, inner_type: TypeInfo) -> BinOper {
    BinOper::comparison(
        OpType::Eq,
        ColumnVar::new(OUTER_TABLE, KEY_COLUMN, 0, outer_type).into(),
        ColumnVar::new(INNER_TABLE, KEY_COLUMN, 1, inner_type).into(),
    )
}

/// Range analyzer that reports a fixed range for every column.
struct FixedRange(ExpressionRange);

impl RangeAnalyzer for FixedRange {
    fn range_of(&self, _col: &ColumnVar, _query_infos: &[QueryInfo]) -> ExpressionRange {
        self.0
    }
}

struct TestContext {
    level: MemoryLevel,
    device: Arc<EmulatedDevice>,
    storage: InMemoryStorage,
    executor: Executor,
}

impl TestContext {
    fn new(level: MemoryLevel) -> Result<Self, Box<dyn Error>> {
        Self::with_config(level, enabled_config())
    }

    fn with_config(level: MemoryLevel, config: ExecutorConfig) -> Result<Self, Box<dyn Error>> {
        Lazy::force(&LOGGER);

        let device = Arc::new(EmulatedDevice::new(Some(4))?);
        let storage = InMemoryStorage::new(1).with_device(device.clone());
        let executor =
            Executor::with_capability(config, DeviceCapability::with_backend(device.clone()));

        let mut ctx = Self {
            level,
            device,
            storage,
            executor,
        };
        ctx.storage
            .add_column::<i32>(OUTER_TABLE, KEY_COLUMN, int_type(), &[&[0]])?;

        Ok(ctx)
    }

    fn query_infos(&self) -> Vec<QueryInfo> {
        vec![
            self.storage.query_info(OUTER_TABLE),
            self.storage.query_info(INNER_TABLE),
        ]
    }

    fn build(&self, pred: &BinOper) -> join_index::error::Result<Option<Arc<JoinHashTable>>> {
        JoinHashTable::get_instance(
            pred,
            &self.storage,
            &self.query_infos(),
            self.level,
            &self.executor,
        )
    }

    fn build_int_keys(
        &mut self,
        keys: &[i32],
    ) -> Result<Option<Arc<JoinHashTable>>, Box<dyn Error>> {
        self.storage
            .add_column::<i32>(INNER_TABLE, KEY_COLUMN, int_type(), &[keys])?;
        Ok(self.build(&equi_join(int_type(), int_type()))?)
    }
}

macro_rules! test_levels {
    ($name:ident) => {
        paste::item! {
            #[test]
            fn [<host_ $name>]() -> Result<(), Box<dyn Error>> {
                $name(MemoryLevel::Host)
            }

            #[test]
            fn [<emulated_ $name>]() -> Result<(), Box<dyn Error>> {
                $name(MemoryLevel::Device)
            }
        }
    };
}

fn build_with_duplicates(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    let table = ctx.build_int_keys(&[5, 7, 5, 9])?.ok_or("no table")?;

    assert_eq!(level, table.memory_level());
    assert_eq!(5, table.col_range().int_min);
    assert_eq!(9, table.col_range().int_max);
    assert_eq!(5, table.bucket_count());
    assert_eq!(4, table.row_count());

    let head = table.probe(5)?;
    assert!(head == 0 || head == 2, "head of key 5 is {}", head);
    if level == MemoryLevel::Host {
        assert_eq!(0, head);
    }
    assert_eq!(1, table.probe(7)?);
    assert_eq!(3, table.probe(9)?);
    assert_eq!(NO_MATCH, table.probe(6)?);
    assert_eq!(NO_MATCH, table.probe(8)?);
    assert_eq!(NO_MATCH, table.probe(4)?);
    assert_eq!(NO_MATCH, table.probe(10)?);

    assert_eq!(
        vec![0, 2],
        table.matches(5)?.into_iter().sorted().collect::<Vec<_>>()
    );
    assert!(table.matches(6)?.is_empty());
    Ok(())
}

test_levels!(build_with_duplicates);

fn every_inner_row_is_found(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    let keys = DenseKeyRelation::gen_attr_with_duplicates::<i32>(-50..=49, 3)?;
    let table = ctx.build_int_keys(&keys)?.ok_or("no table")?;

    assert_eq!(100, table.bucket_count());
    for (row, &key) in keys.iter().enumerate() {
        let rows = table.matches(i64::from(key))?;
        assert_eq!(3, rows.len());
        assert!(rows.contains(&(row as i64)), "row {} not found", row);
    }

    let (buckets, chain) = table.download()?;
    assert_eq!(200, buckets.len());
    assert_eq!(keys.len(), chain.len());
    assert!(buckets.iter().skip(1).step_by(2).all(|&count| count == 3));
    Ok(())
}

test_levels!(every_inner_row_is_found);

fn single_distinct_key(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    let table = ctx.build_int_keys(&[42])?.ok_or("no table")?;

    assert_eq!(1, table.bucket_count());
    assert_eq!(0, table.probe(42)?);
    assert_eq!(NO_MATCH, table.probe(41)?);
    assert_eq!(NO_MATCH, table.probe(43)?);
    Ok(())
}

test_levels!(single_distinct_key);

fn probe_is_deterministic(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    let keys = DenseKeyRelation::gen_attr_with_duplicates::<i32>(0..=99, 4)?;
    let table = ctx.build_int_keys(&keys)?.ok_or("no table")?;

    for key in -5..105 {
        let first = table.probe(key)?;
        assert_eq!(first, table.probe(key)?);
        assert_eq!(first, table.probe(key)?);
    }
    Ok(())
}

test_levels!(probe_is_deterministic);

fn generated_code_probes_table(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    let inner_keys = DenseKeyRelation::gen_attr_with_duplicates::<i32>(10..=29, 2)?;
    let table = ctx.build_int_keys(&inner_keys)?.ok_or("no table")?;

    let function = {
        let mut cgen = ctx.executor.cgen_state();
        let key = cgen.arg(0);
        let slot = table.codegen_slot(key, &mut cgen);
        cgen.finish(slot)
    };

    let mut outer_keys = vec![0_i32; 200];
    ProbeKeyRelation::gen_attr_with_misses(&mut outer_keys, &inner_keys, 80)?;

    let evaluator = RowEvaluator::new(&ctx.executor);
    for &key in &outer_keys {
        let key = i64::from(key);
        let row = evaluator.run(&function, &[key])?;
        assert_eq!(table.probe(key)?, row);
        if (10..=29).contains(&key) {
            assert_eq!(i64::from(inner_keys[row as usize]), key);
        } else {
            assert_eq!(NO_MATCH, row);
        }
    }
    Ok(())
}

test_levels!(generated_code_probes_table);

fn emitted_bounds_stay_inside_table(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    let table = ctx.build_int_keys(&[3, 4])?.ok_or("no table")?;
    let handle = i64::from(table.handle().0);

    let call_with_bounds = |int_min: i64, int_max: i64| {
        let mut cgen = ctx.executor.cgen_state();
        let key = cgen.arg(0);
        let args = vec![
            cgen.ll_int(handle),
            key,
            cgen.ll_int(int_min),
            cgen.ll_int(int_max),
        ];
        let slot = cgen.emit_call(RuntimeFunction::HashJoinIdx, args);
        cgen.finish(slot)
    };

    let evaluator = RowEvaluator::new(&ctx.executor);

    let overflowing = call_with_bounds(-1, i64::MAX);
    assert_eq!(NO_MATCH, evaluator.run(&overflowing, &[i64::MAX])?);

    let full_domain = call_with_bounds(i64::MIN, i64::MAX);
    assert_eq!(NO_MATCH, evaluator.run(&full_domain, &[0])?);
    assert_eq!(NO_MATCH, evaluator.run(&full_domain, &[3])?);

    let widened = call_with_bounds(3, 1000);
    assert_eq!(0, evaluator.run(&widened, &[3])?);
    assert_eq!(1, evaluator.run(&widened, &[4])?);
    assert_eq!(NO_MATCH, evaluator.run(&widened, &[5])?);
    assert_eq!(NO_MATCH, evaluator.run(&widened, &[1000])?);
    Ok(())
}

test_levels!(emitted_bounds_stay_inside_table);

fn tables_get_distinct_handles(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    let first = ctx.build_int_keys(&[1, 2, 3])?.ok_or("no table")?;
    let second = ctx
        .build(&equi_join(int_type(), int_type()))?
        .ok_or("no table")?;

    assert_eq!(JoinTableHandle(0), first.handle());
    assert_eq!(JoinTableHandle(1), second.handle());
    assert_eq!(2, ctx.executor.num_join_tables());
    assert!(ctx.executor.join_table(JoinTableHandle(1)).is_some());
    assert!(ctx.executor.join_table(JoinTableHandle(2)).is_none());
    Ok(())
}

test_levels!(tables_get_distinct_handles);

fn nullable_inner_column_is_rejected(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    ctx.storage.add_nullable_column::<i32>(
        INNER_TABLE,
        KEY_COLUMN,
        TypeInfo::new(SqlType::Int, false),
        &[&[Some(1), None, Some(3)]],
    )?;

    let ti = TypeInfo::new(SqlType::Int, false);
    assert!(ctx.build(&equi_join(ti, ti))?.is_none());
    assert_eq!(0, ctx.executor.num_join_tables());
    Ok(())
}

test_levels!(nullable_inner_column_is_rejected);

fn multi_fragment_inner_table_is_rejected(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    ctx.storage.add_column::<i32>(
        INNER_TABLE,
        KEY_COLUMN,
        int_type(),
        &[&[1, 2], &[3, 4]],
    )?;

    assert!(ctx.build(&equi_join(int_type(), int_type()))?.is_none());
    assert_eq!(0, ctx.executor.num_join_tables());
    assert_eq!(0, ctx.storage.device_chunk_count());
    Ok(())
}

test_levels!(multi_fragment_inner_table_is_rejected);

fn ineligible_predicates_are_rejected(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    ctx.storage
        .add_column::<i32>(INNER_TABLE, KEY_COLUMN, int_type(), &[&[1, 2, 3]])?;
    let int = int_type();

    // Not an equality
    let pred = BinOper::comparison(
        OpType::Lt,
        ColumnVar::new(OUTER_TABLE, KEY_COLUMN, 0, int).into(),
        ColumnVar::new(INNER_TABLE, KEY_COLUMN, 1, int).into(),
    );
    assert!(ctx.build(&pred)?.is_none());

    // Type mismatch
    let pred = equi_join(TypeInfo::new(SqlType::BigInt, true), int);
    assert!(ctx.build(&pred)?.is_none());

    // Nullability is part of the type
    let pred = equi_join(TypeInfo::new(SqlType::Int, false), int);
    assert!(ctx.build(&pred)?.is_none());

    // Non-column operand
    let pred = BinOper::comparison(
        OpType::Eq,
        Expr::Constant {
            type_info: int,
            value: 2,
        },
        ColumnVar::new(INNER_TABLE, KEY_COLUMN, 1, int).into(),
    );
    assert!(ctx.build(&pred)?.is_none());

    // Same row range
    let pred = BinOper::comparison(
        OpType::Eq,
        ColumnVar::new(OUTER_TABLE, KEY_COLUMN, 1, int).into(),
        ColumnVar::new(INNER_TABLE, KEY_COLUMN, 1, int).into(),
    );
    assert!(ctx.build(&pred)?.is_none());

    // Non-integer keys
    let double = TypeInfo::new(SqlType::Double, true);
    assert!(ctx.build(&equi_join(double, double))?.is_none());

    assert_eq!(0, ctx.executor.num_join_tables());
    Ok(())
}

test_levels!(ineligible_predicates_are_rejected);

fn disabled_switch_rejects_everything(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let config = ExecutorConfig {
        enable_dense_hash_join: false,
        ..enabled_config()
    };
    let mut ctx = TestContext::with_config(level, config)?;

    assert!(ctx.build_int_keys(&[1, 2, 3])?.is_none());
    assert_eq!(0, ctx.storage.device_chunk_count());
    Ok(())
}

test_levels!(disabled_switch_rejects_everything);

fn range_above_bucket_limit_is_rejected(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let config = ExecutorConfig {
        max_bucket_count: 1000,
        ..enabled_config()
    };
    let mut ctx = TestContext::with_config(level, config)?;

    assert!(ctx.build_int_keys(&[0, 1000])?.is_none());
    assert!(ctx.build(&equi_join(int_type(), int_type()))?.is_none());
    Ok(())
}

test_levels!(range_above_bucket_limit_is_rejected);

fn failed_build_releases_memory(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    ctx.storage
        .add_column::<i32>(INNER_TABLE, KEY_COLUMN, int_type(), &[&[1, 2, 50]])?;

    // The analyzer underestimates the range, thus the fill hits an
    // out-of-range key
    let narrow = FixedRange(ExpressionRange {
        int_min: 1,
        int_max: 10,
        has_nulls: false,
    });
    let executor = Executor::with_capability(
        enabled_config(),
        DeviceCapability::with_backend(ctx.device.clone()),
    )
    .with_range_analyzer(Arc::new(narrow));
    ctx.executor = executor;

    assert!(ctx.build(&equi_join(int_type(), int_type()))?.is_none());
    assert_eq!(0, ctx.executor.num_join_tables());
    assert_eq!(ctx.storage.device_chunk_count(), ctx.device.live_allocations());
    assert_eq!(0, ctx.device.double_frees());
    Ok(())
}

test_levels!(failed_build_releases_memory);

fn missing_chunk_is_an_invariant_violation(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    ctx.storage
        .add_column::<i32>(INNER_TABLE, KEY_COLUMN, int_type(), &[&[1, 2, 3]])?;
    ctx.storage.evict_chunk(INNER_TABLE, KEY_COLUMN, 0);

    match ctx.build(&equi_join(int_type(), int_type())) {
        Err(e) => match e.kind() {
            ErrorKind::InvariantViolation(_) => {}
            other => panic!("Unexpected error {:?}", other),
        },
        Ok(table) => panic!("Unexpected result {:?}", table),
    }
    Ok(())
}

test_levels!(missing_chunk_is_an_invariant_violation);

fn virtual_column_is_an_invariant_violation(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;
    ctx.storage.add_virtual_column(INNER_TABLE, KEY_COLUMN, int_type());

    let range = FixedRange(ExpressionRange {
        int_min: 0,
        int_max: 9,
        has_nulls: false,
    });
    ctx.executor = Executor::with_capability(
        enabled_config(),
        DeviceCapability::with_backend(ctx.device.clone()),
    )
    .with_range_analyzer(Arc::new(range));

    // Borrow the fragment layout of the outer table, which has chunk
    // metadata for the same column id
    let query_infos = [
        ctx.storage.query_info(OUTER_TABLE),
        ctx.storage.query_info(OUTER_TABLE),
    ];

    let result = JoinHashTable::get_instance(
        &equi_join(int_type(), int_type()),
        &ctx.storage,
        &query_infos,
        ctx.level,
        &ctx.executor,
    );
    match result {
        Err(e) => match e.kind() {
            ErrorKind::InvariantViolation(_) => {}
            other => panic!("Unexpected error {:?}", other),
        },
        Ok(table) => panic!("Unexpected result {:?}", table),
    }
    Ok(())
}

test_levels!(virtual_column_is_an_invariant_violation);

fn key_widths(level: MemoryLevel) -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(level)?;

    let small = TypeInfo::new(SqlType::SmallInt, true);
    ctx.storage
        .add_column::<i16>(INNER_TABLE, KEY_COLUMN, small, &[&[-300, -299, -300]])?;
    let table = ctx.build(&equi_join(small, small))?.ok_or("no table")?;
    assert_eq!(2, table.bucket_count());
    assert_eq!(1, table.probe(-299)?);
    assert_eq!(2, table.matches(-300)?.len());

    let big = TypeInfo::new(SqlType::BigInt, true);
    let base = 1_i64 << 40;
    ctx.storage.add_column::<i64>(
        INNER_TABLE,
        KEY_COLUMN,
        big,
        &[&[base + 2, base, base + 1]],
    )?;
    let table = ctx.build(&equi_join(big, big))?.ok_or("no table")?;
    assert_eq!(3, table.bucket_count());
    assert_eq!(1, table.probe(base)?);
    assert_eq!(0, table.probe(base + 2)?);
    assert_eq!(NO_MATCH, table.probe(base + 3)?);
    Ok(())
}

test_levels!(key_widths);

#[test]
fn host_and_device_find_same_rows() -> Result<(), Box<dyn Error>> {
    let mut host = TestContext::new(MemoryLevel::Host)?;
    let mut device = TestContext::new(MemoryLevel::Device)?;
    let keys = DenseKeyRelation::gen_attr_with_duplicates::<i32>(-1000..=999, 5)?;

    let host_table = host.build_int_keys(&keys)?.ok_or("no table")?;
    let device_table = device.build_int_keys(&keys)?.ok_or("no table")?;

    assert_eq!(host_table.col_range(), device_table.col_range());
    for key in -1001..=1000 {
        let expected = host_table.matches(key)?;
        let actual = device_table.matches(key)?.into_iter().sorted().collect::<Vec<_>>();
        assert_eq!(expected, actual, "key {}", key);
    }
    Ok(())
}

#[test]
fn device_memory_is_released_once() -> Result<(), Box<dyn Error>> {
    let mut ctx = TestContext::new(MemoryLevel::Device)?;
    let table = ctx.build_int_keys(&[3, 1, 2])?.ok_or("no table")?;

    // Key chunk, bucket array, and row chain
    assert_eq!(1, ctx.storage.device_chunk_count());
    assert_eq!(3, ctx.device.live_allocations());

    drop(table);
    assert_eq!(3, ctx.device.live_allocations());

    let TestContext {
        device,
        storage,
        executor,
        ..
    } = ctx;
    drop(executor);
    assert_eq!(1, device.live_allocations());
    drop(storage);
    assert_eq!(0, device.live_allocations());
    assert_eq!(0, device.double_frees());
    Ok(())
}

#[test]
fn device_level_without_backend_is_a_fault() -> Result<(), Box<dyn Error>> {
    Lazy::force(&LOGGER);
    let mut storage = InMemoryStorage::new(1);
    storage.add_column::<i32>(OUTER_TABLE, KEY_COLUMN, int_type(), &[&[0]])?;
    storage.add_column::<i32>(INNER_TABLE, KEY_COLUMN, int_type(), &[&[1, 2]])?;
    let query_infos = [
        storage.query_info(OUTER_TABLE),
        storage.query_info(INNER_TABLE),
    ];
    let executor = Executor::new(enabled_config())?;

    let result = JoinHashTable::get_instance(
        &equi_join(int_type(), int_type()),
        &storage,
        &query_infos,
        MemoryLevel::Device,
        &executor,
    );
    match result {
        Err(e) => match e.kind() {
            ErrorKind::ConfigurationFault(_) => {}
            other => panic!("Unexpected error {:?}", other),
        },
        Ok(table) => panic!("Unexpected result {:?}", table),
    }

    // Ineligible predicates are rejected before the device is needed
    let pred = equi_join(TypeInfo::new(SqlType::BigInt, true), int_type());
    assert!(JoinHashTable::get_instance(
        &pred,
        &storage,
        &query_infos,
        MemoryLevel::Device,
        &executor
    )?
    .is_none());
    Ok(())
}

#[test]
fn executor_from_toml_config() -> Result<(), Box<dyn Error>> {
    Lazy::force(&LOGGER);
    let config = ExecutorConfig::from_toml_str(
        r#"
        enable_dense_hash_join = true
        device_backend = "emulated"
        emulated_threads = 2
        "#,
    )?;
    let executor = Executor::new(config)?;

    let mut storage =
        InMemoryStorage::new(1).with_device(executor.capability().backend().ok_or("no device")?.clone());
    storage.add_column::<i32>(OUTER_TABLE, KEY_COLUMN, int_type(), &[&[0]])?;
    storage.add_column::<i32>(INNER_TABLE, KEY_COLUMN, int_type(), &[&[8, 6, 7]])?;
    let query_infos = [
        storage.query_info(OUTER_TABLE),
        storage.query_info(INNER_TABLE),
    ];

    let table = JoinHashTable::get_instance(
        &equi_join(int_type(), int_type()),
        &storage,
        &query_infos,
        MemoryLevel::Device,
        &executor,
    )?
    .ok_or("no table")?;
    assert_eq!(0, table.probe(8)?);
    assert_eq!(1, table.probe(6)?);
    Ok(())
}
