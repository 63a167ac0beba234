// Copyright 2019-2022 Clemens Lutz
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

//! Key column generators.

use crate::error::{ErrorKind, Result};

use num_traits::{FromPrimitive, PrimInt, ToPrimitive};

use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

use rayon::prelude::*;

use std::ops::RangeInclusive;

/// An integer type that can be stored in a key column.
pub trait KeyAttribute: PrimInt + FromPrimitive + ToPrimitive + Send + Sync {
    /// Width of one key in bytes.
    const BYTES: usize;

    fn try_from_i64(x: i64) -> Result<Self> {
        <Self as FromPrimitive>::from_i64(x).ok_or_else(|| {
            ErrorKind::IntegerOverflow(format!(
                "Key {} doesn't fit into {} bytes",
                x,
                Self::BYTES
            ))
            .into()
        })
    }

    /// Appends the key in little-endian byte order.
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_key_attribute {
    ($Type:ty) => {
        impl KeyAttribute for $Type {
            const BYTES: usize = std::mem::size_of::<$Type>();

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_key_attribute!(i16);
impl_key_attribute!(i32);
impl_key_attribute!(i64);

/// Encodes a key column as a contiguous little-endian byte buffer.
pub fn to_le_bytes<T: KeyAttribute>(attr: &[T]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(attr.len() * T::BYTES);
    attr.iter().for_each(|&x| x.write_le(&mut bytes));
    bytes
}

/// Generator for build-side relations of a dense join.
pub struct DenseKeyRelation;

impl DenseKeyRelation {
    /// Generates a primary key attribute.
    ///
    /// The keys are unique and contiguous, starting from `first_key` and ending
    /// at `first_key + attr.len() - 1`. Keys are placed at random locations
    /// within the slice.
    pub fn gen_primary_key<T: KeyAttribute>(attr: &mut [T], first_key: i64) -> Result<()> {
        let mut rng = thread_rng();

        attr.iter_mut()
            .zip(first_key..)
            .map(|(x, key)| T::try_from_i64(key).map(|key| *x = key))
            .collect::<Result<()>>()?;

        attr.shuffle(&mut rng);
        Ok(())
    }

    /// Generates keys uniformly sampled from `range` in parallel.
    pub fn gen_attr_par<T: KeyAttribute>(
        attr: &mut [T],
        range: RangeInclusive<i64>,
    ) -> Result<()> {
        Self::check_range(&range)?;
        let between = Uniform::from(range);

        attr.par_iter_mut()
            .map_init(thread_rng, |rng, x| {
                T::try_from_i64(between.sample(rng)).map(|key| *x = key)
            })
            .collect::<Result<()>>()?;

        Ok(())
    }

    /// Generates a key attribute in which every key of `range` occurs
    /// `duplicates` times, in random order.
    pub fn gen_attr_with_duplicates<T: KeyAttribute>(
        range: RangeInclusive<i64>,
        duplicates: usize,
    ) -> Result<Vec<T>> {
        Self::check_range(&range)?;
        if duplicates == 0 {
            Err(ErrorKind::InvalidArgument(
                "Duplicates must be at least 1".to_string(),
            ))?;
        }

        let mut attr = range
            .flat_map(|key| std::iter::repeat(key).take(duplicates))
            .map(T::try_from_i64)
            .collect::<Result<Vec<T>>>()?;

        attr.shuffle(&mut thread_rng());
        Ok(attr)
    }

    fn check_range(range: &RangeInclusive<i64>) -> Result<()> {
        if range.start() > range.end() {
            Err(ErrorKind::InvalidArgument(format!(
                "Empty key range {}..={}",
                range.start(),
                range.end()
            )))?;
        }
        Ok(())
    }
}

/// Generator for probe-side relations.
pub struct ProbeKeyRelation;

impl ProbeKeyRelation {
    /// Generates probe keys of which `hit_percent` percent are sampled from
    /// `pk_attr`, and the remainder lie outside of `[min(pk), max(pk)]`.
    pub fn gen_attr_with_misses<T: KeyAttribute>(
        attr: &mut [T],
        pk_attr: &[T],
        hit_percent: u32,
    ) -> Result<()> {
        if hit_percent > 100 {
            Err(ErrorKind::InvalidArgument(
                "Hit percentage must be between 0 and 100".to_string(),
            ))?;
        }

        let (min, max) = match (pk_attr.iter().min(), pk_attr.iter().max()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => Err(ErrorKind::InvalidArgument(
                "Primary key attribute is empty".to_string(),
            ))?,
        };
        let miss_key = if max < T::max_value() {
            max + T::one()
        } else if min > T::min_value() {
            min - T::one()
        } else {
            Err(ErrorKind::IntegerOverflow(
                "Key domain is full, cannot generate misses".to_string(),
            ))?
        };

        let percent = Uniform::from(1..=100);
        let mut rng = thread_rng();

        attr.iter_mut().for_each(|x| {
            *x = if percent.sample(&mut rng) <= hit_percent {
                pk_attr[rng.gen_range(0, pk_attr.len())]
            } else {
                miss_key
            }
        });

        Ok(())
    }
}
