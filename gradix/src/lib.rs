//! gradix: a lazy, kernel-fusing array runtime with composable function
//! transformations.
//!
//! Array operations record a typed ALU expression graph; element-wise
//! chains fuse into single kernels, reductions get a tuned schedule, and
//! three backends execute the result: a tree-walking reference
//! interpreter, a bytecode stack machine, and wgpu compute shaders.
//! On top sits a tracing layer with `jit`, `vmap`, `jvp`, `vjp` and
//! `grad`.
//!
//! ```no_run
//! use gradix::{init, ops, random, Device, Tensor, Val};
//!
//! init(&[Device::Cpu]);
//! let x = Val::from(Tensor::arange(0.0, 8.0, 1.0, gradix::DType::F32, None).unwrap());
//! let y = ops::mul(&ops::add(&x, &x).unwrap(), &ops::subs(&x, 1.0).unwrap()).unwrap();
//! let data = y.tensor().unwrap().to_f64_vec().unwrap();
//! # let _ = (data, random::key(0));
//! ```

// Prevent accidental debug output in library code; the env-gated scheduler
// log helper carries a targeted allow.
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]

pub mod array;
pub mod backend;
pub(crate) mod debug;
pub mod error;
pub mod random;
pub mod routines;
pub mod safetensors;
pub mod trace;
pub mod transform;
pub mod tuner;

pub use gradix_ir::{DType, Scalar};

pub use array::{einsum, HostData, Tensor};
pub use backend::{default_device, init, shutdown, with_backend, Device};
pub use error::{Error, Result};
pub use trace::{ops, Aval, Val};
pub use transform::{grad, jit, jit_with_static, jvp, linearize, vjp, vmap, Jit, Pullback};
