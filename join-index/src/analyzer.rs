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

//! Typed expression trees handed to the join index by the query compiler.
//!
//! Only the parts that the join index inspects are modeled: column
//! references with their row-range identifier, constants, and binary
//! operators.

use std::sync::Arc;

/// SQL data types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SqlType {
    Boolean,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    /// Dictionary-encoded string.
    Text,
}

/// Declared type of an expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub sql_type: SqlType,
    pub not_null: bool,
}

impl TypeInfo {
    pub fn new(sql_type: SqlType, not_null: bool) -> Self {
        Self { sql_type, not_null }
    }

    pub fn is_integer(&self) -> bool {
        match self.sql_type {
            SqlType::SmallInt | SqlType::Int | SqlType::BigInt => true,
            _ => false,
        }
    }

    /// Physical width of one value in bytes.
    pub fn size(&self) -> usize {
        match self.sql_type {
            SqlType::Boolean => 1,
            SqlType::SmallInt => 2,
            SqlType::Int | SqlType::Float | SqlType::Text => 4,
            SqlType::BigInt | SqlType::Double => 8,
        }
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpType {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Reference to a physical column of a table scanned by the query.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnVar {
    pub table_id: i32,
    pub column_id: i32,
    /// Position of the table among the tables referenced by the query.
    pub rte_idx: usize,
    pub type_info: TypeInfo,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinOper {
    pub optype: OpType,
    pub type_info: TypeInfo,
    pub left: Arc<Expr>,
    pub right: Arc<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    ColumnVar(ColumnVar),
    Constant { type_info: TypeInfo, value: i64 },
    BinOper(BinOper),
}

impl Expr {
    pub fn type_info(&self) -> TypeInfo {
        match self {
            Expr::ColumnVar(col) => col.type_info,
            Expr::Constant { type_info, .. } => *type_info,
            Expr::BinOper(op) => op.type_info,
        }
    }

    pub fn as_column_var(&self) -> Option<&ColumnVar> {
        match self {
            Expr::ColumnVar(col) => Some(col),
            _ => None,
        }
    }
}

impl BinOper {
    /// Builds a comparison. Comparisons are typed as non-nullable booleans.
    pub fn comparison(optype: OpType, left: Expr, right: Expr) -> Self {
        Self {
            optype,
            type_info: TypeInfo::new(SqlType::Boolean, true),
            left: Arc::new(left),
            right: Arc::new(right),
        }
    }

    pub fn left_operand(&self) -> &Expr {
        &self.left
    }

    pub fn right_operand(&self) -> &Expr {
        &self.right
    }
}

impl ColumnVar {
    pub fn new(table_id: i32, column_id: i32, rte_idx: usize, type_info: TypeInfo) -> Self {
        Self {
            table_id,
            column_id,
            rte_idx,
            type_info,
        }
    }
}

impl From<ColumnVar> for Expr {
    fn from(col: ColumnVar) -> Self {
        Expr::ColumnVar(col)
    }
}
