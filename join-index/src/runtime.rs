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

//! Host runtime functions for dense join hash tables.
//!
//! The hash table is an array of `2 * bucket_count` words. Bucket `b` holds the
//! keys equal to `int_min + b`; there is no hash function. Word `2 * b` is the
//! head of the bucket's row chain, word `2 * b + 1` the number of rows in the
//! bucket. The row chain is a separate array with one word per inner row, that
//! links each row to the next row with the same key.
//!
//! The layout must be kept in sync with the CUDA kernels in
//! `cudautils/dense_hash_join.cu` and the emulated device kernels.

use num_traits::AsPrimitive;
use std::convert::TryInto;
use std::mem::size_of;

/// Marks an empty bucket and the end of a row chain.
pub const EMPTY_SLOT: i64 = -1;

/// Probe result if no inner row matches.
pub const NO_MATCH: i64 = -1;

pub const FILL_OK: i32 = 0;

/// A key lies outside of `[int_min, int_min + bucket_count - 1]`.
pub const FILL_ERR_OUT_OF_RANGE: i32 = -1;

/// The key width is not 1, 2, 4, or 8 bytes.
pub const FILL_ERR_BAD_WIDTH: i32 = -2;

/// A buffer is too short for the given bucket or row count.
pub const FILL_ERR_SHORT_BUFFER: i32 = -3;

pub fn is_supported_width(value_size: usize) -> bool {
    match value_size {
        1 | 2 | 4 | 8 => true,
        _ => false,
    }
}

/// A fixed-width integer stored in a little-endian column.
trait ColumnKey: Copy + AsPrimitive<i64> {
    const BYTES: usize;

    fn load(bytes: &[u8]) -> Self;
}

macro_rules! impl_column_key {
    ($Type:ty) => {
        impl ColumnKey for $Type {
            const BYTES: usize = size_of::<$Type>();

            #[inline]
            fn load(bytes: &[u8]) -> Self {
                let mut raw = [0_u8; size_of::<$Type>()];
                raw.copy_from_slice(&bytes[..Self::BYTES]);
                <$Type>::from_le_bytes(raw)
            }
        }
    };
}

impl_column_key!(i8);
impl_column_key!(i16);
impl_column_key!(i32);
impl_column_key!(i64);

/// Reads the sign-extended key of `row` from a column of `value_size`-byte
/// integers.
///
/// Returns `None` for unsupported widths or rows beyond the column.
pub fn read_key(column: &[u8], row: usize, value_size: usize) -> Option<i64> {
    let start = row.checked_mul(value_size)?;
    let bytes = column.get(start..start.checked_add(value_size)?)?;

    match value_size {
        1 => Some(i8::load(bytes).as_()),
        2 => Some(i16::load(bytes).as_()),
        4 => Some(i32::load(bytes).as_()),
        8 => Some(i64::load(bytes).as_()),
        _ => None,
    }
}

/// Initializes and fills a dense hash table in a single sequential pass.
///
/// `buff` must hold at least `2 * bucket_count` words, `chain` at least
/// `row_count` words. Rows are inserted in descending order, so that every
/// bucket's chain lists its rows in ascending order and the head is the
/// smallest row id.
///
/// Returns `FILL_OK`, or an error code if the input is inconsistent.
pub fn init_hash_join_buff(
    buff: &mut [i64],
    chain: &mut [i64],
    bucket_count: usize,
    column: &[u8],
    row_count: usize,
    value_size: usize,
    int_min: i64,
) -> i32 {
    if !is_supported_width(value_size) {
        return FILL_ERR_BAD_WIDTH;
    }
    let column_bytes = match row_count.checked_mul(value_size) {
        Some(bytes) => bytes,
        None => return FILL_ERR_SHORT_BUFFER,
    };
    let buff_len = match bucket_count.checked_mul(2) {
        Some(len) => len,
        None => return FILL_ERR_SHORT_BUFFER,
    };
    if buff.len() < buff_len || chain.len() < row_count || column.len() < column_bytes {
        return FILL_ERR_SHORT_BUFFER;
    }

    let buff = &mut buff[..buff_len];
    let chain = &mut chain[..row_count];
    let column = &column[..column_bytes];

    buff.chunks_exact_mut(2).for_each(|bucket| {
        bucket[0] = EMPTY_SLOT;
        bucket[1] = 0;
    });
    chain.iter_mut().for_each(|next| *next = EMPTY_SLOT);

    match value_size {
        1 => fill_typed::<i8>(buff, chain, column, int_min),
        2 => fill_typed::<i16>(buff, chain, column, int_min),
        4 => fill_typed::<i32>(buff, chain, column, int_min),
        _ => fill_typed::<i64>(buff, chain, column, int_min),
    }
}

fn fill_typed<T: ColumnKey>(buff: &mut [i64], chain: &mut [i64], column: &[u8], int_min: i64) -> i32 {
    let bucket_count = (buff.len() / 2) as u64;

    for (row, bytes) in column.chunks_exact(T::BYTES).enumerate().rev() {
        let key: i64 = T::load(bytes).as_();
        let bucket = match key.checked_sub(int_min) {
            Some(offset) if offset >= 0 && (offset as u64) < bucket_count => offset as usize,
            _ => return FILL_ERR_OUT_OF_RANGE,
        };

        chain[row] = buff[2 * bucket];
        buff[2 * bucket] = row as i64;
        buff[2 * bucket + 1] += 1;
    }

    FILL_OK
}

/// Offset of `key`'s bucket, or `None` if the key is outside of `[int_min, int_max]`.
#[inline]
pub(crate) fn bucket_index(key: i64, int_min: i64, int_max: i64) -> Option<usize> {
    if key >= int_min && key <= int_max {
        key.checked_sub(int_min).map(|offset| offset as usize)
    } else {
        None
    }
}

/// Looks up `key` in the hash table.
///
/// Returns the head row id of the key's bucket, or `NO_MATCH` if the key is
/// outside of `[int_min, int_max]` or no inner row has the key.
#[inline]
pub fn hash_join_idx(buff: &[i64], key: i64, int_min: i64, int_max: i64) -> i64 {
    bucket_index(key, int_min, int_max)
        .and_then(|bucket| buff.get(2 * bucket))
        .copied()
        .unwrap_or(NO_MATCH)
}

/// Number of inner rows that match `key`.
pub fn match_count(buff: &[i64], key: i64, int_min: i64, int_max: i64) -> usize {
    bucket_index(key, int_min, int_max)
        .and_then(|bucket| buff.get(2 * bucket + 1))
        .map_or(0, |&count| count as usize)
}

/// Iterator over all inner rows that match a key.
#[derive(Clone, Debug)]
pub struct BucketRows<'a> {
    chain: &'a [i64],
    next: i64,
}

impl<'a> Iterator for BucketRows<'a> {
    type Item = i64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == EMPTY_SLOT {
            return None;
        }

        let row = self.next;
        self.next = row
            .try_into()
            .ok()
            .and_then(|idx: usize| self.chain.get(idx))
            .copied()
            .unwrap_or(EMPTY_SLOT);
        Some(row)
    }
}

/// Enumerates every inner row stored for `key` by following the row chain.
pub fn bucket_rows<'a>(
    buff: &[i64],
    chain: &'a [i64],
    key: i64,
    int_min: i64,
    int_max: i64,
) -> BucketRows<'a> {
    BucketRows {
        chain,
        next: hash_join_idx(buff, key, int_min, int_max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagen::relation::to_le_bytes;

    fn fill(keys: &[i32], int_min: i64, int_max: i64) -> (i32, Vec<i64>, Vec<i64>) {
        let bucket_count = (int_max - int_min + 1) as usize;
        let mut buff = vec![0; 2 * bucket_count];
        let mut chain = vec![0; keys.len()];
        let column = to_le_bytes(keys);

        let err = init_hash_join_buff(
            &mut buff,
            &mut chain,
            bucket_count,
            &column,
            keys.len(),
            4,
            int_min,
        );
        (err, buff, chain)
    }

    #[test]
    fn fill_with_duplicates() {
        let (err, buff, chain) = fill(&[5, 7, 5, 9], 5, 9);

        assert_eq!(FILL_OK, err);
        assert_eq!(vec![0, 2, -1, 0, 1, 1, -1, 0, 3, 1], buff);
        assert_eq!(vec![2, -1, -1, -1], chain);
        assert_eq!(0, hash_join_idx(&buff, 5, 5, 9));
        assert_eq!(NO_MATCH, hash_join_idx(&buff, 6, 5, 9));
        assert_eq!(3, hash_join_idx(&buff, 9, 5, 9));
        assert_eq!(vec![0, 2], bucket_rows(&buff, &chain, 5, 5, 9).collect::<Vec<_>>());
        assert_eq!(2, match_count(&buff, 5, 5, 9));
    }

    #[test]
    fn probe_outside_range() {
        let (_, buff, chain) = fill(&[1, 2, 3], 1, 3);

        assert_eq!(NO_MATCH, hash_join_idx(&buff, 0, 1, 3));
        assert_eq!(NO_MATCH, hash_join_idx(&buff, 4, 1, 3));
        assert_eq!(NO_MATCH, hash_join_idx(&buff, i64::min_value(), 1, 3));
        assert_eq!(0, bucket_rows(&buff, &chain, i64::max_value(), 1, 3).count());
        assert_eq!(0, match_count(&buff, 4, 1, 3));
    }

    #[test]
    fn fill_rejects_out_of_range() {
        let (err, _, _) = fill(&[1, 2, 10], 1, 3);
        assert_eq!(FILL_ERR_OUT_OF_RANGE, err);

        let (err, _, _) = fill(&[0], 1, 3);
        assert_eq!(FILL_ERR_OUT_OF_RANGE, err);
    }

    #[test]
    fn fill_rejects_bad_input() {
        let mut buff = vec![0; 4];
        let mut chain = vec![0; 2];
        let column = vec![0_u8; 6];

        assert_eq!(
            FILL_ERR_BAD_WIDTH,
            init_hash_join_buff(&mut buff, &mut chain, 2, &column, 2, 3, 0)
        );
        assert_eq!(
            FILL_ERR_SHORT_BUFFER,
            init_hash_join_buff(&mut buff, &mut chain, 3, &column, 2, 2, 0)
        );
        assert_eq!(
            FILL_ERR_SHORT_BUFFER,
            init_hash_join_buff(&mut buff, &mut chain, 2, &column, 2, 4, 0)
        );
    }

    #[test]
    fn read_key_widths() {
        let column = vec![0xff_u8, 0x7f, 0x00, 0x80];

        assert_eq!(Some(-1), read_key(&column, 0, 1));
        assert_eq!(Some(0x7fff), read_key(&column, 0, 2));
        assert_eq!(Some(-32768), read_key(&column, 1, 2));
        assert_eq!(Some(-0x7fff_8001), read_key(&column, 0, 4));
        assert_eq!(None, read_key(&column, 1, 4));
        assert_eq!(None, read_key(&column, 0, 3));
    }

    #[test]
    fn single_bucket() {
        let (err, buff, _) = fill(&[42, 42, 42], 42, 42);

        assert_eq!(FILL_OK, err);
        assert_eq!(vec![0, 3], buff);
        assert_eq!(0, hash_join_idx(&buff, 42, 42, 42));
        assert_eq!(NO_MATCH, hash_join_idx(&buff, 41, 42, 42));
    }

    #[test]
    fn negative_domain() {
        let (err, buff, chain) = fill(&[-3, -1, -3], -3, -1);

        assert_eq!(FILL_OK, err);
        assert_eq!(vec![0, 2], bucket_rows(&buff, &chain, -3, -3, -1).collect::<Vec<_>>());
        assert_eq!(1, hash_join_idx(&buff, -1, -3, -1));
    }
}
