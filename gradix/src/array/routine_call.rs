//! Scheduling of routine invocations: arguments are realized to contiguous
//! buffers, then the routine joins the pending queue like any kernel.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use gradix_ir::DType;

use super::{merge_pending, next_seq, BufferHandle, PendingExec, Source, Tensor, Work};
use crate::error::{Error, Result};
use crate::routines::{Routine, RoutineKind};

/// Invoke a routine over tensors, producing buffer-backed outputs whose
/// pending sets order the routine after its producers.
pub(crate) fn call_routine(
    kind: RoutineKind,
    inputs: &[&Tensor],
    out_shapes: Vec<Vec<usize>>,
    out_dtypes: Vec<DType>,
) -> Result<Vec<Tensor>> {
    let first = *inputs.first().ok_or(Error::EmptyOperandList)?;
    let device = first.device();
    let mut realized = Vec::with_capacity(inputs.len());
    for t in inputs {
        if t.device() != device {
            return Err(Error::InvalidOperand {
                op: kind.name(),
                message: "routine operands must share a device".into(),
            });
        }
        realized.push(t.realized()?);
    }
    let in_bufs: Vec<Rc<BufferHandle>> = realized
        .iter()
        .map(|t| match &t.source {
            Source::Buffer(b) => b.clone(),
            Source::Expr { .. } => unreachable!("realized() always yields a buffer source"),
        })
        .collect();
    let routine = Routine {
        kind,
        in_shapes: realized.iter().map(|t| t.shape().to_vec()).collect(),
        in_dtypes: realized.iter().map(|t| t.dtype()).collect(),
        out_shapes: out_shapes.clone(),
        out_dtypes: out_dtypes.clone(),
    };
    let out_bufs: Vec<Rc<BufferHandle>> = out_shapes
        .iter()
        .zip(&out_dtypes)
        .map(|(shape, dtype)| {
            let bytes = shape.iter().product::<usize>() * dtype.size_of();
            BufferHandle::alloc(device, bytes, None)
        })
        .collect::<Result<_>>()?;
    let exec = Rc::new(PendingExec {
        work: Work::Routine(routine),
        inputs: RefCell::new(in_bufs),
        outputs: out_bufs.clone(),
        device,
        submitted: Cell::new(false),
        seq: next_seq(),
    });
    let mut pending = realized
        .iter()
        .fold(Vec::new(), |acc, t| merge_pending(&acc, t.pending()));
    pending.push(exec);
    Ok(out_shapes
        .into_iter()
        .zip(out_dtypes)
        .zip(&out_bufs)
        .map(|((shape, dtype), buf)| {
            Tensor::from_buffer(shape, dtype, device, buf.clone(), pending.clone())
        })
        .collect())
}

impl Tensor {
    /// Ascending stable sort along `axis`; NaN orders last.
    pub fn sort(&self, axis: i64) -> Result<Tensor> {
        if self.rank() == 0 {
            return Err(Error::ScalarRank { op: "sort" });
        }
        let axis = super::movement::normalize_axis(axis, self.rank())?;
        let outs = call_routine(
            RoutineKind::Sort { axis },
            &[self],
            vec![self.shape().to_vec()],
            vec![self.dtype()],
        )?;
        Ok(outs.into_iter().next().unwrap_or_else(|| unreachable!()))
    }

    /// Stable argsort along `axis`, i32 indices.
    pub fn argsort(&self, axis: i64) -> Result<Tensor> {
        if self.rank() == 0 {
            return Err(Error::ScalarRank { op: "argsort" });
        }
        let axis = super::movement::normalize_axis(axis, self.rank())?;
        let outs = call_routine(
            RoutineKind::Argsort { axis },
            &[self],
            vec![self.shape().to_vec()],
            vec![DType::I32],
        )?;
        Ok(outs.into_iter().next().unwrap_or_else(|| unreachable!()))
    }

    /// Lower Cholesky factor, batched over leading dimensions.
    pub fn cholesky(&self) -> Result<Tensor> {
        let outs = call_routine(
            RoutineKind::Cholesky,
            &[self],
            vec![self.shape().to_vec()],
            vec![self.dtype()],
        )?;
        Ok(outs.into_iter().next().unwrap_or_else(|| unreachable!()))
    }

    /// Solve `self x = b` for triangular `self` by substitution.
    pub fn solve_triangular(&self, b: &Tensor, lower: bool, unit_diagonal: bool) -> Result<Tensor> {
        let outs = call_routine(
            RoutineKind::TriangularSolve {
                lower,
                unit_diagonal,
            },
            &[self, b],
            vec![b.shape().to_vec()],
            vec![self.dtype()],
        )?;
        Ok(outs.into_iter().next().unwrap_or_else(|| unreachable!()))
    }

    /// Elementwise Threefry-2x32 over four equally shaped u32 tensors.
    pub fn threefry(
        k0: &Tensor,
        k1: &Tensor,
        c0: &Tensor,
        c1: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        for t in [k0, k1, c0, c1] {
            if t.dtype() != DType::U32 {
                return Err(Error::DTypeMismatch {
                    expected: DType::U32,
                    got: t.dtype(),
                });
            }
            if t.shape() != k0.shape() {
                return Err(Error::ShapeMismatch {
                    expected: k0.shape().to_vec(),
                    got: t.shape().to_vec(),
                });
            }
        }
        let shape = k0.shape().to_vec();
        let outs = call_routine(
            RoutineKind::Threefry,
            &[k0, k1, c0, c1],
            vec![shape.clone(), shape],
            vec![DType::U32, DType::U32],
        )?;
        let mut it = outs.into_iter();
        let a = it.next().unwrap_or_else(|| unreachable!());
        let b = it.next().unwrap_or_else(|| unreachable!());
        Ok((a, b))
    }
}
