//! Movement operations: zero-cost tracker rewrites, plus the composite
//! movements (concat, stack, tile, repeat) built from them.

use gradix_ir::AluOp;

use super::Tensor;
use crate::error::{Error, Result};

/// Normalize a possibly negative axis against `rank`.
pub(crate) fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let a = if axis < 0 { axis + rank as i64 } else { axis };
    if a < 0 || a as usize >= rank {
        return Err(Error::AxisOutOfBounds { axis, rank });
    }
    Ok(a as usize)
}

impl Tensor {
    pub fn reshape(&self, new_shape: &[i64]) -> Result<Tensor> {
        Ok(self.with_tracker(self.tracker().reshape(new_shape)?))
    }

    /// Permute axes; `None` reverses them.
    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Tensor> {
        let rank = self.rank();
        let axes: Vec<usize> = match axes {
            Some(a) => a.to_vec(),
            None => (0..rank).rev().collect(),
        };
        Ok(self.with_tracker(self.tracker().permute(&axes)?))
    }

    pub fn moveaxis(&self, from: i64, to: i64) -> Result<Tensor> {
        let rank = self.rank();
        let from = normalize_axis(from, rank)?;
        let to = normalize_axis(to, rank)?;
        let mut axes: Vec<usize> = (0..rank).filter(|&a| a != from).collect();
        axes.insert(to, from);
        self.transpose(Some(&axes))
    }

    /// Broadcast to `shape`. Missing leading dims are inserted; size-1 dims
    /// stretch with stride 0.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor> {
        if shape.len() < self.rank() {
            return Err(Error::NotBroadcastable {
                from: self.shape().to_vec(),
                to: shape.to_vec(),
            });
        }
        let mut aligned: Vec<i64> = vec![1; shape.len() - self.rank()];
        aligned.extend(self.shape().iter().map(|&d| d as i64));
        let lifted = self.tracker().reshape(&aligned)?;
        let expanded = lifted.expand(shape).map_err(|_| Error::NotBroadcastable {
            from: self.shape().to_vec(),
            to: shape.to_vec(),
        })?;
        Ok(self.with_tracker(expanded))
    }

    /// Insert a size-1 dimension at `axis`.
    pub fn expand_dims(&self, axis: i64) -> Result<Tensor> {
        let rank = self.rank();
        let at = if axis < 0 { axis + rank as i64 + 1 } else { axis };
        if at < 0 || at as usize > rank {
            return Err(Error::AxisOutOfBounds { axis, rank });
        }
        let mut shape: Vec<i64> = self.shape().iter().map(|&d| d as i64).collect();
        shape.insert(at as usize, 1);
        self.reshape(&shape)
    }

    /// Restrict to `[start, stop)` per axis with positive steps. A reversed
    /// traversal is `flip` composed with a positive-step slice.
    pub fn slice(&self, starts: &[i64], stops: &[i64], steps: Option<&[i64]>) -> Result<Tensor> {
        Ok(self.with_tracker(self.tracker().slice(starts, stops, steps)?))
    }

    /// Reverse the listed axes.
    pub fn flip(&self, axes: &[i64]) -> Result<Tensor> {
        let rank = self.rank();
        let mut mask = vec![false; rank];
        for &a in axes {
            let a = normalize_axis(a, rank)?;
            if std::mem::replace(&mut mask[a], true) {
                return Err(Error::DuplicateAxis { axis: a });
            }
        }
        self.flip_axes(&mask)
    }

    pub(crate) fn flip_axes(&self, mask: &[bool]) -> Result<Tensor> {
        Ok(self.with_tracker(self.tracker().flip(mask)?))
    }

    /// Zero-pad by `(before, after)` per axis.
    pub fn pad(&self, widths: &[(usize, usize)]) -> Result<Tensor> {
        Ok(self.with_tracker(self.tracker().pad(widths)?))
    }

    /// Concatenate along `axis`. Lowers to a fused sum of shifted zero-pads,
    /// so the whole concatenation is a single kernel.
    pub fn concat(parts: &[&Tensor], axis: i64) -> Result<Tensor> {
        let first = *parts.first().ok_or(Error::EmptyOperandList)?;
        let rank = first.rank();
        let axis = normalize_axis(axis, rank)?;
        let total: usize = parts.iter().map(|t| t.shape()[axis]).sum();
        for t in parts {
            if t.rank() != rank
                || (0..rank).any(|d| d != axis && t.shape()[d] != first.shape()[d])
            {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().to_vec(),
                    got: t.shape().to_vec(),
                });
            }
        }
        let mut offset = 0usize;
        let mut acc: Option<Tensor> = None;
        for t in parts {
            let mut widths = vec![(0usize, 0usize); rank];
            widths[axis] = (offset, total - offset - t.shape()[axis]);
            offset += t.shape()[axis];
            // Bool has no addition; route through i32 and back.
            let numeric = if t.dtype() == gradix_ir::DType::Bool {
                t.cast(gradix_ir::DType::I32)
            } else {
                (*t).clone()
            };
            let padded = numeric.pad(&widths)?;
            acc = Some(match acc {
                None => padded,
                Some(a) => a.binary(AluOp::Add, &padded)?,
            });
        }
        let out = acc.unwrap_or_else(|| unreachable!());
        if first.dtype() == gradix_ir::DType::Bool {
            Ok(out.cast(gradix_ir::DType::Bool))
        } else {
            Ok(out)
        }
    }

    /// Stack along a fresh leading `axis`.
    pub fn stack(parts: &[&Tensor], axis: i64) -> Result<Tensor> {
        let lifted: Vec<Tensor> = parts
            .iter()
            .map(|t| t.expand_dims(axis))
            .collect::<Result<_>>()?;
        let refs: Vec<&Tensor> = lifted.iter().collect();
        Tensor::concat(&refs, axis)
    }

    /// Repeat the whole tensor `reps[d]` times along each axis.
    pub fn tile(&self, reps: &[usize]) -> Result<Tensor> {
        if reps.len() != self.rank() {
            return Err(Error::InvalidOperand {
                op: "tile",
                message: format!("expected {} reps, got {}", self.rank(), reps.len()),
            });
        }
        let mut out = self.clone();
        for (d, &rep) in reps.iter().enumerate() {
            if rep == 1 {
                continue;
            }
            // [.., s, ..] -> [.., 1, s, ..] -> [.., rep, s, ..] -> merge
            let lifted = out.expand_dims(d as i64)?;
            let mut target = lifted.shape().to_vec();
            target[d] = rep;
            let expanded = lifted.broadcast_to(&target)?;
            let mut merged: Vec<i64> = expanded.shape().iter().map(|&x| x as i64).collect();
            let s = merged.remove(d + 1);
            merged[d] *= s;
            out = expanded.reshape(&merged)?;
        }
        Ok(out)
    }

    /// Repeat each element `rep` times along `axis`.
    pub fn repeat(&self, rep: usize, axis: i64) -> Result<Tensor> {
        let axis = normalize_axis(axis, self.rank())?;
        // [.., s, ..] -> [.., s, 1, ..] -> [.., s, rep, ..] -> merge
        let lifted = self.expand_dims(axis as i64 + 1)?;
        let mut target = lifted.shape().to_vec();
        target[axis + 1] = rep;
        let expanded = lifted.broadcast_to(&target)?;
        let mut merged: Vec<i64> = expanded.shape().iter().map(|&x| x as i64).collect();
        let r = merged.remove(axis + 1);
        merged[axis] *= r;
        expanded.reshape(&merged)
    }
}
