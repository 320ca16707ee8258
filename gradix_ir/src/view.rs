//! Shape trackers: logical tensor views over contiguous buffers.
//!
//! A tracker is a stack of views. Each view maps its own logical
//! multi-indices to a flat offset in the space of the view below it (the
//! bottom view maps into the physical buffer), together with a per-dimension
//! validity mask produced by padding. Movement operations rewrite the top
//! view when possible and push a fresh contiguous view when not.

use serde::{Deserialize, Serialize};

use crate::alu::AluExp;
use crate::error::IrError;

/// Canonical row-major strides for a shape.
pub fn contiguous_strides(shape: &[usize]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1] as i64;
    }
    strides
}

/// Ceiling division for a positive divisor.
fn ceil_div(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    (a + b - 1).div_euclid(b)
}

/// One view: (shape, strides, offset, optional per-dim valid range).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub shape: Vec<usize>,
    pub strides: Vec<i64>,
    pub offset: i64,
    /// Per-dimension half-open valid range `[lo, hi)`. Reads outside any
    /// range yield the identity value 0. `None` means fully valid.
    pub mask: Option<Vec<(i64, i64)>>,
}

impl View {
    pub fn contiguous(shape: Vec<usize>) -> View {
        let strides = contiguous_strides(&shape);
        View {
            shape,
            strides,
            offset: 0,
            mask: None,
        }
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.mask.is_none() && self.strides == contiguous_strides(&self.shape)
    }

    /// Trivial (full-range) masks are dropped so that equality and
    /// contiguity checks stay canonical.
    fn normalize_mask(&mut self) {
        if let Some(mask) = &self.mask {
            let full = mask
                .iter()
                .zip(&self.shape)
                .all(|(&(lo, hi), &s)| lo <= 0 && hi >= s as i64);
            if full {
                self.mask = None;
            }
        }
    }

    /// Numeric offset computation: logical indices to (offset, valid).
    pub fn offset_of(&self, idxs: &[i64]) -> (i64, bool) {
        debug_assert_eq!(idxs.len(), self.shape.len());
        let mut off = self.offset;
        let mut valid = true;
        for (d, &i) in idxs.iter().enumerate() {
            off += i * self.strides[d];
            if let Some(mask) = &self.mask {
                let (lo, hi) = mask[d];
                valid &= i >= lo && i < hi;
            }
        }
        (off, valid)
    }

    /// ALU lowering of `offset_of`: builds i32 index arithmetic and a bool
    /// validity predicate over the given index expressions.
    pub fn to_alu(&self, idxs: &[AluExp]) -> (AluExp, AluExp) {
        debug_assert_eq!(idxs.len(), self.shape.len());
        let mut off = AluExp::const_i32(self.offset as i32);
        let mut valid = AluExp::const_bool(true);
        for (d, idx) in idxs.iter().enumerate() {
            if self.strides[d] != 0 && self.shape[d] != 1 {
                off = off.add(&idx.mul(&AluExp::const_i32(self.strides[d] as i32)));
            }
            if let Some(mask) = &self.mask {
                let (lo, hi) = mask[d];
                if lo > 0 || hi < self.shape[d] as i64 {
                    let ge = idx.ge(&AluExp::const_i32(lo as i32));
                    let lt = idx.lt(&AluExp::const_i32(hi as i32));
                    valid = valid.and(&ge.and(&lt));
                }
            }
        }
        (off, valid)
    }
}

/// A stack of views; the last view is the logical top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeTracker {
    views: Vec<View>,
}

impl ShapeTracker {
    pub fn from_shape(shape: &[usize]) -> ShapeTracker {
        ShapeTracker {
            views: vec![View::contiguous(shape.to_vec())],
        }
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    fn top(&self) -> &View {
        // A tracker always holds at least one view.
        &self.views[self.views.len() - 1]
    }

    fn top_mut(&mut self) -> &mut View {
        let last = self.views.len() - 1;
        &mut self.views[last]
    }

    pub fn shape(&self) -> &[usize] {
        &self.top().shape
    }

    pub fn rank(&self) -> usize {
        self.top().shape.len()
    }

    pub fn size(&self) -> usize {
        self.top().size()
    }

    /// Strides of the top view, consumed by the tuner heuristics.
    pub fn last_strides(&self) -> &[i64] {
        &self.top().strides
    }

    /// A tracker is contiguous iff it is a single canonical view.
    pub fn is_contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].is_contiguous()
    }

    /// Reshape. One target dimension may be `-1` and is inferred. Mutates the
    /// top view in place when its strides admit the new shape; otherwise a
    /// fresh contiguous view is pushed.
    pub fn reshape(&self, new_shape: &[i64]) -> Result<ShapeTracker, IrError> {
        let size = self.size();
        let resolved = resolve_reshape(self.shape(), size, new_shape)?;
        if resolved == self.shape() {
            return Ok(self.clone());
        }
        let mut out = self.clone();
        let top = out.top_mut();
        if top.mask.is_none() {
            if let Some(strides) = merge_reshape_strides(&top.shape, &top.strides, &resolved) {
                top.shape = resolved;
                top.strides = strides;
                return Ok(out);
            }
        }
        out.views.push(View::contiguous(resolved));
        Ok(out)
    }

    pub fn permute(&self, axes: &[usize]) -> Result<ShapeTracker, IrError> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if axes.len() != rank || axes.iter().any(|&a| a >= rank || std::mem::replace(&mut seen[a], true)) {
            return Err(IrError::InvalidPermutation {
                axes: axes.to_vec(),
                rank,
            });
        }
        let mut out = self.clone();
        let top = out.top_mut();
        let new_shape = axes.iter().map(|&a| top.shape[a]).collect();
        let new_strides = axes.iter().map(|&a| top.strides[a]).collect();
        let new_mask = top
            .mask
            .as_ref()
            .map(|mask| axes.iter().map(|&a| mask[a]).collect());
        top.shape = new_shape;
        top.strides = new_strides;
        top.mask = new_mask;
        Ok(out)
    }

    /// Broadcast: dims of size 1 may grow to any size with stride 0.
    pub fn expand(&self, new_shape: &[usize]) -> Result<ShapeTracker, IrError> {
        let shape = self.shape();
        if new_shape.len() != shape.len() {
            return Err(IrError::RankMismatch {
                expected: shape.len(),
                got: new_shape.len(),
            });
        }
        let mut out = self.clone();
        let top = out.top_mut();
        for (d, (&old, &new)) in shape.iter().zip(new_shape).enumerate() {
            if old == new {
                continue;
            }
            if old != 1 {
                return Err(IrError::InvalidExpand {
                    from: shape.to_vec(),
                    to: new_shape.to_vec(),
                });
            }
            if let Some(mask) = &mut top.mask {
                match mask[d] {
                    (lo, hi) if lo <= 0 && hi >= 1 => mask[d] = (0, new as i64),
                    (lo, hi) if lo >= hi => mask[d] = (0, 0),
                    _ => return Err(IrError::MaskedExpand { axis: d }),
                }
            }
            top.shape[d] = new;
            top.strides[d] = 0;
        }
        Ok(out)
    }

    /// Reverse the masked axes.
    pub fn flip(&self, axes: &[bool]) -> Result<ShapeTracker, IrError> {
        if axes.len() != self.rank() {
            return Err(IrError::RankMismatch {
                expected: self.rank(),
                got: axes.len(),
            });
        }
        let mut out = self.clone();
        let top = out.top_mut();
        for (d, &do_flip) in axes.iter().enumerate() {
            if !do_flip {
                continue;
            }
            let n = top.shape[d] as i64;
            top.offset += (n - 1) * top.strides[d];
            top.strides[d] = -top.strides[d];
            if let Some(mask) = &mut top.mask {
                let (lo, hi) = mask[d];
                mask[d] = (n - hi, n - lo);
            }
        }
        Ok(out)
    }

    /// Restrict each axis to `[start, stop)` with a positive step.
    pub fn slice(
        &self,
        starts: &[i64],
        stops: &[i64],
        steps: Option<&[i64]>,
    ) -> Result<ShapeTracker, IrError> {
        let rank = self.rank();
        if starts.len() != rank || stops.len() != rank {
            return Err(IrError::RankMismatch {
                expected: rank,
                got: starts.len().max(stops.len()),
            });
        }
        let mut out = self.clone();
        let top = out.top_mut();
        for d in 0..rank {
            let size = top.shape[d];
            let step = steps.map_or(1, |s| s[d]);
            let (start, stop) = (starts[d], stops[d]);
            if step < 1 || start < 0 || start > stop || stop > size as i64 {
                return Err(IrError::InvalidSlice {
                    axis: d,
                    start,
                    stop,
                    step,
                    size,
                });
            }
            let new_size = ceil_div(stop - start, step).max(0);
            if let Some(mask) = &mut top.mask {
                let (lo, hi) = mask[d];
                let new_lo = ceil_div(lo - start, step).clamp(0, new_size);
                let new_hi = ceil_div(hi - start, step).clamp(0, new_size);
                mask[d] = (new_lo, new_hi);
            }
            top.offset += start * top.strides[d];
            top.strides[d] *= step;
            top.shape[d] = new_size as usize;
        }
        top.normalize_mask();
        Ok(out)
    }

    /// Grow each axis by `(before, after)` masked-out elements. Reads inside
    /// the padding yield the identity value 0.
    pub fn pad(&self, widths: &[(usize, usize)]) -> Result<ShapeTracker, IrError> {
        let rank = self.rank();
        if widths.len() != rank {
            return Err(IrError::RankMismatch {
                expected: rank,
                got: widths.len(),
            });
        }
        if widths.iter().all(|&(b, a)| b == 0 && a == 0) {
            return Ok(self.clone());
        }
        let mut out = self.clone();
        let top = out.top_mut();
        let base: Vec<(i64, i64)> = match &top.mask {
            Some(mask) => mask.clone(),
            None => top.shape.iter().map(|&s| (0, s as i64)).collect(),
        };
        let mut mask = Vec::with_capacity(rank);
        for (d, &(before, after)) in widths.iter().enumerate() {
            let (lo, hi) = base[d];
            mask.push((lo + before as i64, hi + before as i64));
            top.offset -= before as i64 * top.strides[d];
            top.shape[d] += before + after;
        }
        top.mask = Some(mask);
        top.normalize_mask();
        Ok(out)
    }

    /// Stack `self`'s views on top of `other`. `self` must have been built
    /// over `other`'s logical shape.
    pub fn compose(&self, other: &ShapeTracker) -> ShapeTracker {
        debug_assert_eq!(self.views[0].size(), {
            // the bottom view of `self` indexes other's logical flat space
            other.size()
        });
        let mut views = other.views.clone();
        views.extend(self.views.iter().cloned());
        ShapeTracker { views }
    }

    /// Numeric mirror of [`ShapeTracker::to_alu`].
    pub fn offset_of(&self, idxs: &[i64]) -> (i64, bool) {
        let mut idxs = idxs.to_vec();
        let mut valid = true;
        let mut off = 0i64;
        for (level, view) in self.views.iter().enumerate().rev() {
            let (o, v) = view.offset_of(&idxs);
            valid &= v;
            off = o;
            if level > 0 {
                idxs = unflatten_i64(off, &self.views[level - 1].shape);
            }
        }
        (off, valid)
    }

    /// Lower a logical multi-index to `(linear offset, valid)` in ALU IR.
    /// Views compose top-down; validity is the AND of every mask predicate.
    pub fn to_alu(&self, idxs: &[AluExp]) -> (AluExp, AluExp) {
        let mut idxs = idxs.to_vec();
        let mut valid = AluExp::const_bool(true);
        let mut off = AluExp::const_i32(0);
        for (level, view) in self.views.iter().enumerate().rev() {
            let (o, v) = view.to_alu(&idxs);
            valid = valid.and(&v);
            off = o;
            if level > 0 {
                idxs = unflatten_alu(&off, &self.views[level - 1].shape);
            }
        }
        (off.simplify(), valid.simplify())
    }
}

/// Split a flat index into per-dimension indices for `shape`.
pub fn unflatten_alu(flat: &AluExp, shape: &[usize]) -> Vec<AluExp> {
    let strides = contiguous_strides(shape);
    shape
        .iter()
        .zip(&strides)
        .map(|(&s, &stride)| {
            flat.idiv(&AluExp::const_i32(stride as i32))
                .rem(&AluExp::const_i32(s as i32))
        })
        .collect()
}

pub fn unflatten_i64(flat: i64, shape: &[usize]) -> Vec<i64> {
    let strides = contiguous_strides(shape);
    shape
        .iter()
        .zip(&strides)
        .map(|(&s, &stride)| (flat / stride).rem_euclid(s as i64))
        .collect()
}

/// Resolve a reshape target (with at most one `-1`) against a source size.
fn resolve_reshape(from: &[usize], size: usize, to: &[i64]) -> Result<Vec<usize>, IrError> {
    let inferred = to.iter().filter(|&&d| d == -1).count();
    if inferred > 1 {
        return Err(IrError::MultipleInferredDims { to: to.to_vec() });
    }
    if to.iter().any(|&d| d < -1) {
        return Err(IrError::InvalidReshape {
            from: from.to_vec(),
            from_size: size,
            to: to.to_vec(),
        });
    }
    let known: usize = to.iter().filter(|&&d| d != -1).map(|&d| d as usize).product();
    let mut resolved = Vec::with_capacity(to.len());
    for &d in to {
        if d == -1 {
            if known == 0 || size % known != 0 {
                return Err(IrError::InvalidReshape {
                    from: from.to_vec(),
                    from_size: size,
                    to: to.to_vec(),
                });
            }
            resolved.push(size / known);
        } else {
            resolved.push(d as usize);
        }
    }
    if resolved.iter().product::<usize>() != size {
        return Err(IrError::InvalidReshape {
            from: from.to_vec(),
            from_size: size,
            to: to.to_vec(),
        });
    }
    Ok(resolved)
}

/// Try to express `new_shape` over the same storage as `(shape, strides)`.
///
/// Dimensions are consumed in groups of equal element count; a group of old
/// dimensions can be re-divided only when its members are contiguous with one
/// another. Returns the strides for the new shape, or None when a flat
/// traversal is impossible and a view push is required.
fn merge_reshape_strides(shape: &[usize], strides: &[i64], new_shape: &[usize]) -> Option<Vec<i64>> {
    // Size-1 dims carry no layout information; strip them for grouping.
    let old: Vec<(usize, i64)> = shape
        .iter()
        .zip(strides)
        .filter(|(&s, _)| s != 1)
        .map(|(&s, &st)| (s, st))
        .collect();
    let mut new_strides = vec![0i64; new_shape.len()];
    let mut oi = 0;
    let mut ni = 0;
    while ni < new_shape.len() {
        if new_shape[ni] == 1 {
            new_strides[ni] = 0;
            ni += 1;
            continue;
        }
        // Grow a group until old and new element counts match.
        let group_start = ni;
        let mut new_count = new_shape[ni];
        ni += 1;
        if oi >= old.len() {
            return None;
        }
        let old_start = oi;
        let mut old_count = old[oi].0;
        oi += 1;
        while old_count != new_count {
            if old_count < new_count {
                if oi >= old.len() {
                    return None;
                }
                old_count *= old[oi].0;
                oi += 1;
            } else {
                if ni >= new_shape.len() {
                    return None;
                }
                new_count *= new_shape[ni];
                ni += 1;
            }
        }
        // Old dims inside the group must be contiguous with one another.
        for k in old_start..oi - 1 {
            if old[k].1 != old[k + 1].1 * old[k + 1].0 as i64 {
                return None;
            }
        }
        // Innermost stride of the group seeds the new strides.
        let mut stride = old[oi - 1].1;
        for k in (group_start..ni).rev() {
            if new_shape[k] == 1 {
                new_strides[k] = 0;
                continue;
            }
            new_strides[k] = stride;
            stride *= new_shape[k] as i64;
        }
    }
    if oi != old.len() {
        return None;
    }
    Some(new_strides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[3, 4, 5]), vec![20, 5, 1]);
        assert_eq!(contiguous_strides(&[7]), vec![1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn test_from_shape_is_contiguous() {
        let st = ShapeTracker::from_shape(&[2, 3]);
        assert!(st.is_contiguous());
        assert_eq!(st.size(), 6);
        assert_eq!(st.offset_of(&[1, 2]), (5, true));
    }

    #[test]
    fn test_reshape_merges_contiguous() {
        let st = ShapeTracker::from_shape(&[3, 4]).reshape(&[2, 6]).unwrap();
        assert_eq!(st.views().len(), 1);
        assert_eq!(st.shape(), &[2, 6]);
        assert!(st.is_contiguous());
    }

    #[test]
    fn test_reshape_infers_dim() {
        let st = ShapeTracker::from_shape(&[3, 4]).reshape(&[-1, 2]).unwrap();
        assert_eq!(st.shape(), &[6, 2]);
        assert!(ShapeTracker::from_shape(&[3, 4]).reshape(&[5, -1]).is_err());
    }

    #[test]
    fn test_reshape_after_permute_pushes_view() {
        let st = ShapeTracker::from_shape(&[3, 4])
            .permute(&[1, 0])
            .unwrap()
            .reshape(&[2, 6])
            .unwrap();
        assert_eq!(st.views().len(), 2);
        // Element (0, 1) of the reshaped tensor is element (0, 1) of the
        // transposed [4, 3] tensor, i.e. flat offset 1*4 = 4 in the base.
        assert_eq!(st.offset_of(&[0, 1]), (4, true));
    }

    #[test]
    fn test_permute_validation() {
        let st = ShapeTracker::from_shape(&[2, 3, 4]);
        assert!(st.permute(&[0, 1]).is_err());
        assert!(st.permute(&[0, 0, 1]).is_err());
        assert!(st.permute(&[0, 2, 1]).is_ok());
    }

    #[test]
    fn test_permute_round_trip_offsets() {
        let st = ShapeTracker::from_shape(&[2, 3]).permute(&[1, 0]).unwrap();
        assert_eq!(st.shape(), &[3, 2]);
        assert_eq!(st.offset_of(&[2, 1]), (5, true));
    }

    #[test]
    fn test_expand_broadcasts_with_zero_stride() {
        let st = ShapeTracker::from_shape(&[1, 3]).expand(&[4, 3]).unwrap();
        assert_eq!(st.shape(), &[4, 3]);
        assert_eq!(st.last_strides(), &[0, 1]);
        assert_eq!(st.offset_of(&[3, 2]), (2, true));
        assert!(ShapeTracker::from_shape(&[2, 3]).expand(&[4, 3]).is_err());
    }

    #[test]
    fn test_flip_reads_reversed() {
        let st = ShapeTracker::from_shape(&[4]).flip(&[true]).unwrap();
        assert_eq!(st.offset_of(&[0]), (3, true));
        assert_eq!(st.offset_of(&[3]), (0, true));
    }

    #[test]
    fn test_slice_with_step() {
        let st = ShapeTracker::from_shape(&[10])
            .slice(&[2], &[9], Some(&[3]))
            .unwrap();
        assert_eq!(st.shape(), &[3]);
        assert_eq!(st.offset_of(&[0]), (2, true));
        assert_eq!(st.offset_of(&[2]), (8, true));
    }

    #[test]
    fn test_slice_validation() {
        let st = ShapeTracker::from_shape(&[4]);
        assert!(st.slice(&[0], &[5], None).is_err());
        assert!(st.slice(&[2], &[1], None).is_err());
        assert!(st.slice(&[0], &[4], Some(&[0])).is_err());
    }

    #[test]
    fn test_pad_masks_out_of_range() {
        let st = ShapeTracker::from_shape(&[3]).pad(&[(1, 2)]).unwrap();
        assert_eq!(st.shape(), &[6]);
        assert!(!st.offset_of(&[0]).1);
        assert_eq!(st.offset_of(&[1]), (0, true));
        assert_eq!(st.offset_of(&[3]), (2, true));
        assert!(!st.offset_of(&[4]).1);
    }

    #[test]
    fn test_pad_then_slice_restores_full_view() {
        let st = ShapeTracker::from_shape(&[3])
            .pad(&[(2, 2)])
            .unwrap()
            .slice(&[2], &[5], None)
            .unwrap();
        assert_eq!(st.shape(), &[3]);
        assert!(st.views()[0].mask.is_none());
        assert_eq!(st.offset_of(&[1]), (1, true));
    }

    #[test]
    fn test_compose_stacks_views() {
        let base = ShapeTracker::from_shape(&[3, 4]).permute(&[1, 0]).unwrap();
        let top = ShapeTracker::from_shape(&[4, 3]).reshape(&[12]).unwrap();
        let st = top.compose(&base);
        // flat index 1 of the reshaped view is (0, 1) of the transposed
        // tensor, which is (1, 0) of the base: offset 4.
        assert_eq!(st.offset_of(&[1]), (4, true));
    }

    #[test]
    fn test_reshape_transpose_reshape_scenario() {
        // arange(12).reshape([3,4]).transpose([1,0]).reshape([2,6])
        let st = ShapeTracker::from_shape(&[12])
            .reshape(&[3, 4])
            .unwrap()
            .permute(&[1, 0])
            .unwrap()
            .reshape(&[2, 6])
            .unwrap();
        let expect = [[0i64, 4, 8, 1, 5, 9], [2, 6, 10, 3, 7, 11]];
        for r in 0..2 {
            for c in 0..6 {
                assert_eq!(st.offset_of(&[r as i64, c as i64]), (expect[r][c], true));
            }
        }
    }

    #[test]
    fn test_merge_reshape_split_dim() {
        // Splitting a dimension never needs a new view.
        let st = ShapeTracker::from_shape(&[6, 5])
            .permute(&[1, 0])
            .unwrap()
            .reshape(&[5, 2, 3])
            .unwrap();
        assert_eq!(st.views().len(), 1);
        assert_eq!(st.last_strides(), &[1, 15, 5]);
        assert_eq!(st.offset_of(&[2, 1, 2]), (27, true));
    }
}
