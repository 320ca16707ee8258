//! Composable program transformations: trace-compile-cache (`jit`),
//! batching (`vmap`), forward-mode (`jvp`) and reverse-mode (`vjp`/`grad`)
//! differentiation. Each is an interpreter on the tracer stack plus a set
//! of per-primitive rules.

pub mod jit;
pub mod jvp;
pub mod vjp;
pub mod vmap;

pub use jit::{jit, jit_with_static, Jit};
pub use jvp::jvp;
pub use vjp::{grad, linearize, vjp, Pullback};
pub use vmap::vmap;
