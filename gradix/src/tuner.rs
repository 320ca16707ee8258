//! Kernel lowering plans.
//!
//! The null tuner resolves `GlobalView` reads through their shape trackers
//! and leaves the schedule alone: one thread per output, a plain reduction
//! loop. The GPU tuner additionally chooses upcast/unroll/group factors for
//! reduction kernels to improve coalescing and occupancy. Tuning never
//! changes numerical semantics; it only rewrites index arithmetic.

use std::collections::HashMap;

use gradix_ir::view::unflatten_alu;
use gradix_ir::{
    contiguous_strides, AluArg, AluExp, AluOp, DType, Kernel, ReduceOp, ShapeTracker, SpecialKind,
};

/// Chosen schedule factors. `groups * reduce * unroll` always equals the
/// original reduction size; `upcast` is the number of outputs per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelDims {
    pub groups: usize,
    pub reduce: usize,
    pub unroll: usize,
    pub upcast: usize,
}

/// A lowered kernel: rewritten body, output-index expression, total thread
/// count and the schedule factors.
#[derive(Debug, Clone)]
pub struct TunedKernel {
    pub num_inputs: usize,
    /// Total number of output elements (the original `kernel.size`).
    pub out_count: usize,
    pub out_dtype: DType,
    /// Dtype of the accumulator (the body expression's dtype).
    pub acc_dtype: DType,
    /// Body as a function of the `gidx`/`ridx`/`group`/`unroll`/`upcast`
    /// specials, with every `GlobalView` resolved to indexed reads.
    pub exp: AluExp,
    /// Maps (gidx, upcast) to the flat output index.
    pub out_index: AluExp,
    pub reduce_op: Option<ReduceOp>,
    pub epilogue: Option<AluExp>,
    pub threads: usize,
    pub dims: KernelDims,
}

/// Replace every `GlobalView` by masked `GlobalIndex` reads through the
/// view's tracker.
fn resolve_views(exp: &AluExp) -> AluExp {
    exp.rewrite(&mut |e| {
        if e.op() != AluOp::GlobalView {
            return None;
        }
        let (gid, tracker) = match e.arg() {
            AluArg::View { gid, tracker } => (*gid, tracker.clone()),
            _ => return None,
        };
        let (off, valid) = tracker.to_alu(e.src());
        let read = AluExp::global_index(e.dtype(), gid, off);
        Some(match valid.as_const() {
            Some(s) if s.to_bool() => read,
            _ => AluExp::select(&valid, &read, &AluExp::const_of(e.dtype(), 0.0)),
        })
    })
    .simplify()
}

/// The null plan: substitute nothing, one thread per output.
pub fn tune_null(kernel: &Kernel) -> TunedKernel {
    let reduce = kernel.reduction.as_ref().map_or(1, |r| r.size);
    TunedKernel {
        num_inputs: kernel.num_inputs,
        out_count: kernel.size,
        out_dtype: kernel.dtype(),
        acc_dtype: kernel.exp.dtype(),
        exp: resolve_views(&kernel.exp),
        out_index: AluExp::gidx(kernel.size),
        reduce_op: kernel.reduction.as_ref().map(|r| r.op),
        epilogue: kernel
            .reduction
            .as_ref()
            .and_then(|r| r.fusion.as_ref())
            .map(resolve_views),
        threads: kernel.size,
        dims: KernelDims {
            groups: 1,
            reduce,
            unroll: 1,
            upcast: 1,
        },
    }
}

fn view_trackers(exp: &AluExp) -> Vec<ShapeTracker> {
    exp.collect(&|e| e.op() == AluOp::GlobalView)
        .iter()
        .filter_map(|e| match e.arg() {
            AluArg::View { tracker, .. } => Some(tracker.clone()),
            _ => None,
        })
        .collect()
}

/// Split `index_shape` into output axes and reduction axes by matching the
/// trailing product against the reduction size.
fn split_reduction_axes(index_shape: &[usize], r: usize) -> Option<usize> {
    let mut acc = 1usize;
    for k in (0..=index_shape.len()).rev() {
        if acc == r {
            return Some(k);
        }
        if k == 0 {
            break;
        }
        acc *= index_shape[k - 1];
    }
    None
}

/// The GPU plan. Falls back to the null schedule whenever the kernel does
/// not look like a well-formed reduction over a shared index space.
pub fn tune_gpu(kernel: &Kernel) -> TunedKernel {
    let Some(reduction) = &kernel.reduction else {
        return tune_null(kernel);
    };
    let trackers = view_trackers(&kernel.exp);
    let Some(first) = trackers.first() else {
        return tune_null(kernel);
    };
    let index_shape = first.shape().to_vec();
    if trackers.iter().any(|t| t.shape() != index_shape) {
        return tune_null(kernel);
    }
    let Some(out_rank) = split_reduction_axes(&index_shape, reduction.size) else {
        return tune_null(kernel);
    };
    let out_shape = &index_shape[..out_rank];
    if out_shape.iter().product::<usize>() != kernel.size {
        return tune_null(kernel);
    }

    // --- upcast: output axes where some input broadcasts (stride 0) and a
    // factor of 3 or 4 divides evenly; repeat while enough parallelism
    // remains. Tie-break lexicographically.
    let mut factors: Vec<(usize, usize)> = Vec::new(); // (axis, factor)
    let mut cur_shape = out_shape.to_vec();
    let mut upcast = 1usize;
    while kernel.size / upcast >= 1024 && factors.len() < 2 {
        let mut best: Option<((usize, i64, usize, usize), (usize, usize))> = None;
        for (axis, &s) in cur_shape.iter().enumerate() {
            if factors.iter().any(|&(a, _)| a == axis) {
                continue;
            }
            let zero_stride = trackers.iter().any(|t| t.last_strides()[axis] == 0);
            if !zero_stride {
                continue;
            }
            let nonzero: usize = trackers
                .iter()
                .filter(|t| t.last_strides()[axis] != 0)
                .count();
            let stride_sum: i64 = trackers.iter().map(|t| t.last_strides()[axis].abs()).sum();
            for factor in [4usize, 3] {
                if s % factor == 0 {
                    let score = (nonzero, stride_sum, axis, factor);
                    if best.as_ref().is_none_or(|(b, _)| score < *b) {
                        best = Some((score, (axis, factor)));
                    }
                }
            }
        }
        let Some((_, (axis, factor))) = best else { break };
        cur_shape[axis] /= factor;
        upcast *= factor;
        factors.push((axis, factor));
    }

    // --- unroll the reduction loop by a small constant factor
    let r = reduction.size;
    let unroll = if r % 4 == 0 && r >= 8 {
        4
    } else if r % 2 == 0 && r >= 4 {
        2
    } else {
        1
    };

    // --- group: cooperative reduction when the loop is long and the output
    // side offers little parallelism
    let rem_r = r / unroll;
    let out_parallel = kernel.size / upcast;
    let mut groups = 1usize;
    if r >= 256 && out_parallel <= 256 {
        let mut g = 64;
        while g > 1 && rem_r % g != 0 {
            g /= 2;
        }
        groups = g;
    }
    let reduce = r / (unroll * groups);

    // --- index substitutions
    let out_strides = contiguous_strides(out_shape);
    let gidx = AluExp::gidx(kernel.size / upcast);
    let lane = AluExp::special(DType::I32, SpecialKind::Upcast, upcast);
    let coords = unflatten_alu(&gidx, &cur_shape);
    let mut gidx_sub = AluExp::const_i32(0);
    for (axis, coord) in coords.iter().enumerate() {
        let c = match factors.iter().position(|&(a, _)| a == axis) {
            Some(pos) => {
                let factor = factors[pos].1;
                // lane bits for this axis: factors chosen later are inner
                let post: usize = factors[pos + 1..].iter().map(|&(_, f)| f).product();
                let lane_axis = lane
                    .idiv(&AluExp::const_i32(post as i32))
                    .rem(&AluExp::const_i32(factor as i32));
                coord.mul(&AluExp::const_i32(factor as i32)).add(&lane_axis)
            }
            None => coord.clone(),
        };
        gidx_sub = gidx_sub.add(&c.mul(&AluExp::const_i32(out_strides[axis] as i32)));
    }
    let gidx_sub = gidx_sub.simplify();

    let ridx = AluExp::ridx(reduce);
    let mut ridx_sub = ridx;
    if groups > 1 {
        ridx_sub = ridx_sub
            .mul(&AluExp::const_i32(groups as i32))
            .add(&AluExp::special(DType::I32, SpecialKind::Group, groups));
    }
    if unroll > 1 {
        ridx_sub = ridx_sub
            .mul(&AluExp::const_i32(unroll as i32))
            .add(&AluExp::special(DType::I32, SpecialKind::Unroll, unroll));
    }
    let ridx_sub = ridx_sub.simplify();

    let mut map = HashMap::new();
    map.insert(SpecialKind::Gidx, gidx_sub.clone());
    map.insert(SpecialKind::Ridx, ridx_sub);
    let exp = resolve_views(&kernel.exp.substitute(&map));
    let epilogue = reduction
        .fusion
        .as_ref()
        .map(|f| resolve_views(&f.substitute(&map)));

    TunedKernel {
        num_inputs: kernel.num_inputs,
        out_count: kernel.size,
        out_dtype: kernel.dtype(),
        acc_dtype: kernel.exp.dtype(),
        exp,
        out_index: gidx_sub,
        reduce_op: Some(reduction.op),
        epilogue,
        threads: (kernel.size / upcast) * groups,
        dims: KernelDims {
            groups,
            reduce,
            unroll,
            upcast,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradix_ir::Reduction;

    fn reduce_kernel(out_shape: &[usize], r_dim: usize) -> Kernel {
        // sum over the trailing axis of a broadcast input
        let mut shape = out_shape.to_vec();
        shape.push(r_dim);
        let size: usize = out_shape.iter().product();
        let tracker = ShapeTracker::from_shape(&[1])
            .reshape(&vec![1i64; shape.len()])
            .unwrap()
            .expand(&shape)
            .unwrap();
        let full = AluExp::gidx(size)
            .mul(&AluExp::const_i32(r_dim as i32))
            .add(&AluExp::ridx(r_dim));
        let idxs = unflatten_alu(&full, &shape);
        let exp = AluExp::global_view(DType::F32, 0, tracker, idxs);
        Kernel {
            num_inputs: 1,
            size,
            exp,
            reduction: Some(Reduction {
                op: ReduceOp::Sum,
                size: r_dim,
                fusion: None,
            }),
        }
    }

    #[test]
    fn test_null_dims() {
        let k = reduce_kernel(&[8], 16);
        let t = tune_null(&k);
        assert_eq!(t.threads, 8);
        assert_eq!(
            t.dims,
            KernelDims {
                groups: 1,
                reduce: 16,
                unroll: 1,
                upcast: 1
            }
        );
    }

    #[test]
    fn test_gpu_factorization_invariant() {
        for (shape, r) in [(vec![4096usize], 64usize), (vec![64, 64], 64), (vec![8], 512)] {
            let k = reduce_kernel(&shape, r);
            let t = tune_gpu(&k);
            assert_eq!(
                t.dims.groups * t.dims.reduce * t.dims.unroll,
                r,
                "reduction factors must multiply back to {}",
                r
            );
            assert_eq!(t.threads, (k.size / t.dims.upcast) * t.dims.groups);
            assert_eq!(k.size % t.dims.upcast, 0);
        }
    }

    #[test]
    fn test_gpu_grouping_kicks_in_for_long_reductions() {
        let k = reduce_kernel(&[8], 512);
        let t = tune_gpu(&k);
        assert!(t.dims.groups > 1);
    }

    #[test]
    fn test_gpu_upcast_on_broadcast_axis() {
        let k = reduce_kernel(&[4096], 64);
        let t = tune_gpu(&k);
        assert!(t.dims.upcast > 1, "broadcast axis should be upcast");
    }

    #[test]
    fn test_tuned_matches_null_semantics() {
        use gradix_ir::{EvalCtx, GlobalRead, Scalar};
        struct Ones;
        impl GlobalRead for Ones {
            fn load(&self, _gid: usize, _index: i64, dtype: DType) -> Scalar {
                Scalar::one(dtype)
            }
        }
        let k = reduce_kernel(&[8], 512);
        let null = tune_null(&k);
        let tuned = tune_gpu(&k);
        // Fold the tuned plan on the host: iterate every (gidx, group,
        // ridx, unroll, upcast) lane and scatter into out by out_index.
        let mut out_tuned = vec![0f32; k.size];
        let d = tuned.dims;
        for g in 0..tuned.threads / d.groups {
            for u in 0..d.upcast {
                let mut acc = 0f32;
                for grp in 0..d.groups {
                    for r in 0..d.reduce {
                        for l in 0..d.unroll {
                            let mut ctx = EvalCtx::new(&Ones);
                            ctx.set_index(SpecialKind::Gidx, g as i64)
                                .set_index(SpecialKind::Group, grp as i64)
                                .set_index(SpecialKind::Ridx, r as i64)
                                .set_index(SpecialKind::Unroll, l as i64)
                                .set_index(SpecialKind::Upcast, u as i64);
                            acc += tuned.exp.evaluate(&ctx).to_f64() as f32;
                        }
                    }
                }
                let mut ctx = EvalCtx::new(&Ones);
                ctx.set_index(SpecialKind::Gidx, g as i64)
                    .set_index(SpecialKind::Upcast, u as i64);
                let at = tuned.out_index.evaluate(&ctx).to_i64() as usize;
                out_tuned[at] = acc;
            }
        }
        let mut out_null = vec![0f32; k.size];
        for g in 0..null.threads {
            let mut acc = 0f32;
            for r in 0..null.dims.reduce {
                let mut ctx = EvalCtx::new(&Ones);
                ctx.set_index(SpecialKind::Gidx, g as i64)
                    .set_index(SpecialKind::Ridx, r as i64);
                acc += null.exp.evaluate(&ctx).to_f64() as f32;
            }
            out_null[g] = acc;
        }
        assert_eq!(out_tuned, out_null);
    }
}
