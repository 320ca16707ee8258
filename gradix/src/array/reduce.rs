//! Reductions: a permute-to-trailing rewrite plus one reduction kernel.
//! The elementwise prologue fuses into the kernel body and `mean` fuses its
//! division into the accumulator epilogue.

use gradix_ir::{AluExp, DType, ReduceOp, Scalar};

use super::movement::normalize_axis;
use super::Tensor;
use crate::error::{Error, Result};

/// Which extremum `arg_extremum` locates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgExtremum {
    Min,
    Max,
}

impl Tensor {
    /// Reduce over `axes` (all axes when `None`).
    pub(crate) fn reduce(
        &self,
        op: ReduceOp,
        axes: Option<&[i64]>,
        keepdims: bool,
        fusion: Option<AluExp>,
        out_dtype: Option<DType>,
    ) -> Result<Tensor> {
        let rank = self.rank();
        let mut reduced = vec![false; rank];
        match axes {
            None => reduced.fill(true),
            Some(axes) => {
                for &a in axes {
                    let a = normalize_axis(a, rank)?;
                    if std::mem::replace(&mut reduced[a], true) {
                        return Err(Error::DuplicateAxis { axis: a });
                    }
                }
            }
        }
        let kept: Vec<usize> = (0..rank).filter(|&d| !reduced[d]).collect();
        let dropped: Vec<usize> = (0..rank).filter(|&d| reduced[d]).collect();
        let perm: Vec<usize> = kept.iter().chain(dropped.iter()).copied().collect();
        let permuted = self.transpose(Some(&perm))?;
        let out_shape: Vec<usize> = kept.iter().map(|&d| self.shape()[d]).collect();
        let r: usize = dropped.iter().map(|&d| self.shape()[d]).product();
        let out_dtype = out_dtype.unwrap_or(self.dtype());
        let result =
            Tensor::materialize_reduce(&permuted, out_shape, r, op, fusion, out_dtype)?;
        if keepdims {
            let full: Vec<i64> = (0..rank)
                .map(|d| if reduced[d] { 1 } else { self.shape()[d] as i64 })
                .collect();
            result.reshape(&full)
        } else {
            Ok(result)
        }
    }

    pub fn sum(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Sum, axes, keepdims, None, None)
    }

    pub fn prod(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Prod, axes, keepdims, None, None)
    }

    pub fn min(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Min, axes, keepdims, None, None)
    }

    pub fn max(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Max, axes, keepdims, None, None)
    }

    /// Arithmetic mean; the division by the element count runs as the
    /// reduction epilogue, so this is still a single kernel.
    pub fn mean(&self, axes: Option<&[i64]>, keepdims: bool) -> Result<Tensor> {
        if !self.dtype().is_float() {
            return Err(Error::InvalidOperand {
                op: "mean",
                message: format!("requires a float dtype, got {}", self.dtype()),
            });
        }
        let rank = self.rank();
        let count: usize = match axes {
            None => self.size(),
            Some(axes) => {
                let mut c = 1usize;
                for &a in axes {
                    c *= self.shape()[normalize_axis(a, rank)?];
                }
                c
            }
        };
        let epilogue = AluExp::acc(self.dtype())
            .div(&AluExp::const_of(self.dtype(), count as f64));
        self.reduce(ReduceOp::Sum, axes, keepdims, Some(epilogue), None)
    }

    /// Index of the extremum along `axis` (the flattened tensor when
    /// `None`). Ties resolve to the lowest index.
    pub fn arg_extremum(&self, which: ArgExtremum, axis: Option<i64>) -> Result<Tensor> {
        let t = match axis {
            Some(_) => self.clone(),
            None => self.reshape(&[self.size() as i64])?,
        };
        let axis = normalize_axis(axis.unwrap_or(0), t.rank())?;
        let op = match which {
            ArgExtremum::Min => ReduceOp::Min,
            ArgExtremum::Max => ReduceOp::Max,
        };
        let extremum = t.reduce(op, Some(&[axis as i64]), true, None, None)?;
        let hit = t.binary(gradix_ir::AluOp::Eq, &extremum.broadcast_to(t.shape())?)?;
        let iota = Tensor::iota(t.shape(), axis, Some(t.device()))?;
        let miss = Tensor::full(
            t.shape(),
            Scalar::I32(t.shape()[axis] as i32),
            Some(t.device()),
        )?;
        let masked = hit.select(&iota, &miss)?;
        masked.reduce(ReduceOp::Min, Some(&[axis as i64]), false, None, None)
    }

    pub fn argmax(&self, axis: Option<i64>) -> Result<Tensor> {
        self.arg_extremum(ArgExtremum::Max, axis)
    }

    pub fn argmin(&self, axis: Option<i64>) -> Result<Tensor> {
        self.arg_extremum(ArgExtremum::Min, axis)
    }
}
