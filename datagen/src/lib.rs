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

//! Generators for join key columns.
//!
//! Dense join hash tables are sized by the key domain, not by the number of
//! rows. The generators therefore take an explicit, signed key range, and can
//! produce unique keys, keys with duplicates, and probe-side keys that partly
//! fall outside of the build-side domain.

pub mod error;
pub mod relation;
