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

//! Generated per-row code.
//!
//! Query compilation emits a linear list of runtime calls for each row. The
//! instruction list is what a native code generator would lower to machine
//! code. `RowEvaluator` interprets it directly, dispatching runtime calls to
//! the execution context.

use crate::error::{ErrorKind, Result};
use crate::executor::{Executor, JoinTableHandle};
use std::convert::TryFrom;
use std::fmt;
use std::mem;

/// Runtime functions callable from generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFunction {
    /// `hash_join_idx(table, key, int_min, int_max) -> row_id`
    HashJoinIdx,
}

impl RuntimeFunction {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeFunction::HashJoinIdx => "hash_join_idx",
        }
    }

    fn arity(self) -> usize {
        match self {
            RuntimeFunction::HashJoinIdx => 4,
        }
    }
}

impl fmt::Display for RuntimeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An operand of generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    /// A 64-bit integer literal.
    Const(i64),
    /// The result of an earlier instruction.
    Reg(u32),
    /// A row function argument.
    Arg(u32),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Const(v) => write!(f, "i64 {}", v),
            Value::Reg(r) => write!(f, "%{}", r),
            Value::Arg(a) => write!(f, "%arg{}", a),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Call {
        dst: u32,
        func: RuntimeFunction,
        args: Vec<Value>,
    },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Call { dst, func, args } => {
                write!(f, "%{} = call {}(", dst, func)?;
                for (i, arg) in args.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Code generation state of the query being compiled.
#[derive(Clone, Debug, Default)]
pub struct CgenState {
    instructions: Vec<Instruction>,
    next_reg: u32,
    num_args: u32,
}

impl CgenState {
    pub fn new() -> Self {
        Self::default()
    }

    /// References row function argument `index`.
    pub fn arg(&mut self, index: u32) -> Value {
        self.num_args = self.num_args.max(index + 1);
        Value::Arg(index)
    }

    pub fn ll_int(&self, value: i64) -> Value {
        Value::Const(value)
    }

    /// Appends a call and returns its result.
    pub fn emit_call(&mut self, func: RuntimeFunction, args: Vec<Value>) -> Value {
        let dst = self.next_reg;
        self.next_reg += 1;
        self.instructions.push(Instruction::Call { dst, func, args });
        Value::Reg(dst)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Completes the row function and resets the state for the next one.
    pub fn finish(&mut self, ret: Value) -> RowFunction {
        let state = mem::take(self);
        RowFunction {
            instructions: state.instructions,
            num_regs: state.next_reg,
            num_args: state.num_args,
            ret,
        }
    }
}

/// A compiled per-row function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowFunction {
    instructions: Vec<Instruction>,
    num_regs: u32,
    num_args: u32,
    ret: Value,
}

impl RowFunction {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn num_args(&self) -> u32 {
        self.num_args
    }

    pub fn ret(&self) -> Value {
        self.ret
    }
}

impl fmt::Display for RowFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instruction in &self.instructions {
            writeln!(f, "{}", instruction)?;
        }
        write!(f, "ret {}", self.ret)
    }
}

/// Executes row functions against an execution context.
pub struct RowEvaluator<'e> {
    executor: &'e Executor,
}

impl<'e> RowEvaluator<'e> {
    pub fn new(executor: &'e Executor) -> Self {
        Self { executor }
    }

    /// Evaluates `function` for one row.
    pub fn run(&self, function: &RowFunction, args: &[i64]) -> Result<i64> {
        if args.len() != function.num_args as usize {
            Err(ErrorKind::InvalidArgument(format!(
                "Row function takes {} arguments, but {} were given",
                function.num_args,
                args.len()
            )))?;
        }

        let mut regs: Vec<Option<i64>> = vec![None; function.num_regs as usize];
        for instruction in &function.instructions {
            match instruction {
                Instruction::Call { dst, func, args: call_args } => {
                    let values = call_args
                        .iter()
                        .map(|value| Self::load(*value, &regs, args))
                        .collect::<Result<Vec<_>>>()?;
                    let result = self.call(*func, &values)?;
                    let slot = regs.get_mut(*dst as usize).ok_or_else(|| {
                        ErrorKind::InvariantViolation(format!("Register %{} out of bounds", dst))
                    })?;
                    *slot = Some(result);
                }
            }
        }

        Self::load(function.ret, &regs, args)
    }

    fn load(value: Value, regs: &[Option<i64>], args: &[i64]) -> Result<i64> {
        let loaded = match value {
            Value::Const(v) => Some(v),
            Value::Reg(r) => regs.get(r as usize).copied().flatten(),
            Value::Arg(a) => args.get(a as usize).copied(),
        };
        loaded.ok_or_else(|| {
            ErrorKind::InvariantViolation(format!("Use of undefined value {}", value)).into()
        })
    }

    fn call(&self, func: RuntimeFunction, args: &[i64]) -> Result<i64> {
        if args.len() != func.arity() {
            Err(ErrorKind::InvariantViolation(format!(
                "{} called with {} arguments",
                func,
                args.len()
            )))?;
        }

        match func {
            RuntimeFunction::HashJoinIdx => {
                let handle = u32::try_from(args[0]).map_err(|_| {
                    ErrorKind::InvariantViolation(format!("Invalid join table handle {}", args[0]))
                })?;
                self.executor
                    .probe(JoinTableHandle(handle), args[1], args[2], args[3])
            }
        }
    }
}
