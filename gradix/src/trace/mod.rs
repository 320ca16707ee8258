//! Tracing machinery: traceable values, the thread-local interpreter stack
//! and primitive dispatch.
//!
//! Every operation funnels through [`bind`]: the highest-level interpreter
//! owning an input tracer rewrites the application (recording an equation,
//! propagating dual numbers, or adjusting a batch axis); with no tracers in
//! sight the primitive evaluates concretely on lazy tensors.

pub mod ops;
pub mod primitive;
pub mod tape;

use std::cell::RefCell;
use std::rc::Rc;

use gradix_ir::{DType, Scalar};

use crate::array::Tensor;
use crate::error::{Error, Result};
use primitive::{eval_concrete, Params, Primitive};
use tape::{TapeBuilder, VarId};

/// Abstract value: what a transformation knows about an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aval {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl Aval {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Aval {
        Aval { shape, dtype }
    }

    pub fn of(t: &Tensor) -> Aval {
        Aval {
            shape: t.shape().to_vec(),
            dtype: t.dtype(),
        }
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// A traceable value: a concrete lazy tensor or a transformation tracer.
#[derive(Debug, Clone)]
pub enum Val {
    Concrete(Tensor),
    Tracer(Rc<TracerCore>),
}

#[derive(Debug)]
pub struct TracerCore {
    pub(crate) level: usize,
    pub(crate) data: TracerData,
}

#[derive(Debug)]
pub(crate) enum TracerData {
    /// Records into a tape (jit and the linearization pass).
    Tape { var: VarId, aval: Aval },
    /// Dual number for forward-mode differentiation.
    Jvp { primal: Val, tangent: Val },
    /// Value carrying a batched axis.
    Batch { val: Val, bdim: Option<usize> },
}

impl From<Tensor> for Val {
    fn from(t: Tensor) -> Val {
        Val::Concrete(t)
    }
}

impl Val {
    pub fn aval(&self) -> Aval {
        match self {
            Val::Concrete(t) => Aval::of(t),
            Val::Tracer(core) => match &core.data {
                TracerData::Tape { aval, .. } => aval.clone(),
                TracerData::Jvp { primal, .. } => primal.aval(),
                TracerData::Batch { val, bdim } => {
                    let mut aval = val.aval();
                    if let Some(b) = bdim {
                        aval.shape.remove(*b);
                    }
                    aval
                }
            },
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.aval().shape
    }

    pub fn dtype(&self) -> DType {
        self.aval().dtype
    }

    pub(crate) fn level(&self) -> usize {
        match self {
            Val::Concrete(_) => 0,
            Val::Tracer(core) => core.level,
        }
    }

    /// The underlying tensor; an error while a transformation still owns
    /// the value.
    pub fn tensor(&self) -> Result<&Tensor> {
        match self {
            Val::Concrete(t) => Ok(t),
            Val::Tracer(_) => Err(Error::Internal(
                "value is an abstract tracer; read it outside the transformation".into(),
            )),
        }
    }

    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Val::Concrete(t) => Ok(t),
            Val::Tracer(_) => Err(Error::Internal(
                "value is an abstract tracer; read it outside the transformation".into(),
            )),
        }
    }
}

/// One entry of the interpreter stack. Level n is index n-1.
#[derive(Clone)]
pub(crate) enum Interp {
    Jvp,
    Batch { size: usize },
    Tape(Rc<RefCell<TapeBuilder>>),
}

impl std::fmt::Debug for Interp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interp::Jvp => f.write_str("Jvp"),
            Interp::Batch { size } => write!(f, "Batch({})", size),
            Interp::Tape(_) => f.write_str("Tape"),
        }
    }
}

thread_local! {
    static STACK: RefCell<Vec<Interp>> = const { RefCell::new(Vec::new()) };
}

/// Scoped push; the interpreter pops when the guard drops, releasing the
/// tracers the scope owned.
pub(crate) struct InterpGuard {
    pub level: usize,
}

impl std::fmt::Debug for InterpGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InterpGuard(level {})", self.level)
    }
}

pub(crate) fn push_interp(interp: Interp) -> InterpGuard {
    let level = STACK.with(|s| {
        let mut s = s.borrow_mut();
        s.push(interp);
        s.len()
    });
    InterpGuard { level }
}

impl Drop for InterpGuard {
    fn drop(&mut self) {
        STACK.with(|s| {
            let mut s = s.borrow_mut();
            debug_assert_eq!(s.len(), self.level);
            s.pop();
        });
    }
}

fn interp_at(level: usize) -> Interp {
    STACK.with(|s| s.borrow()[level - 1].clone())
}

/// Apply a primitive. Dispatches to the highest-level interpreter among the
/// inputs' tracers, falling back to concrete evaluation.
pub fn bind(prim: Primitive, params: Params, inputs: &[Val]) -> Result<Vec<Val>> {
    let level = inputs.iter().map(Val::level).max().unwrap_or(0);
    if level == 0 {
        let tensors: Vec<&Tensor> = inputs
            .iter()
            .map(|v| v.tensor())
            .collect::<Result<_>>()?;
        return Ok(eval_concrete(&prim, &params, &tensors)?
            .into_iter()
            .map(Val::Concrete)
            .collect());
    }
    match interp_at(level) {
        Interp::Jvp => crate::transform::jvp::process(prim, params, inputs, level),
        Interp::Batch { size } => crate::transform::vmap::process(prim, params, inputs, level, size),
        Interp::Tape(builder) => crate::transform::jit::process_tape(&builder, prim, params, inputs, level),
    }
}

/// Single-output convenience over [`bind`].
pub fn bind1(prim: Primitive, params: Params, inputs: &[Val]) -> Result<Val> {
    let mut outs = bind(prim, params, inputs)?;
    match outs.len() {
        1 => Ok(outs.remove(0)),
        n => Err(Error::Internal(format!("expected one output, got {}", n))),
    }
}

/// A concrete zero with the given abstract value, used as the tangent of
/// values a differentiation pass does not track.
pub(crate) fn zeros_like_aval(aval: &Aval) -> Result<Val> {
    Ok(Val::Concrete(Tensor::full(
        &aval.shape,
        Scalar::zero(aval.dtype),
        None,
    )?))
}
