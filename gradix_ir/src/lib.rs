//! Typed expression IR for the gradix array runtime.
//!
//! This crate is the pure leaf of the workspace: primitive dtypes and tagged
//! scalars, the ALU expression language with its simplifier and tree-walk
//! evaluator, shape trackers describing logical views over contiguous
//! buffers, and the `Kernel` bundle handed to backends. It performs no I/O
//! and owns no device state.

// Prevent accidental debug output in library code.
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]

pub mod alu;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod view;

pub use alu::{
    scalar_binary, scalar_compare, scalar_unary, AluArg, AluExp, AluOp, EvalCtx, GlobalRead,
    NoGlobals, SpecialKind,
};
pub use dtype::{DType, Scalar};
pub use error::IrError;
pub use kernel::{Kernel, ReduceOp, Reduction};
pub use view::{contiguous_strides, ShapeTracker, View};
