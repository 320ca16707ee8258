//! Instruction set of the kernel stack machine.
//!
//! One program computes one output element: the machine is re-entered per
//! output index (and per reduction step) with `gidx`/`ridx`/`acc` registers
//! set by the driver loop. Values on the stack are tagged scalars; the
//! assembler guarantees type agreement, so the executor only checks depth.

use gradix_ir::{DType, Scalar};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    // constants and registers
    Push(Scalar),
    LoadGidx,
    LoadRidx,
    LoadAcc,
    // CSE slots
    StoreLocal(u16),
    LoadLocal(u16),
    /// Pop an i32 index, push the element read from input `gid`. The index
    /// is clamped to the buffer; masked lanes discard the value through a
    /// later `Select`.
    LoadGlobal { gid: u16, dtype: DType },
    // arithmetic: pop rhs, pop lhs, push result
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Min,
    Max,
    Pow,
    // unary: pop operand, push result
    Neg,
    Recip,
    Sqrt,
    Abs,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Atan,
    Asin,
    Erf,
    Erfc,
    // comparisons: pop rhs, pop lhs, push bool
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
    /// Pop else-value, then-value, condition; push the selected value.
    /// Both branches are evaluated (straight-line code has no jumps).
    Select,
    Cast(DType),
}

/// A straight-line program plus its local-slot count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<Instr>,
    pub locals: u16,
}
