//! Batching: a tracer carrying an optional batch-axis position, with
//! per-primitive rules that keep the axis alive through every operation.
//! Nested `vmap` composes because each nesting level owns its own tracer.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::trace::ops;
use crate::trace::primitive::{Params, Primitive};
use crate::trace::{bind, push_interp, Interp, TracerCore, TracerData, Val};

fn batched(level: usize, val: Val, bdim: Option<usize>) -> Val {
    Val::Tracer(Rc::new(TracerCore {
        level,
        data: TracerData::Batch { val, bdim },
    }))
}

fn unwrap(v: &Val, level: usize) -> (Val, Option<usize>) {
    if let Val::Tracer(core) = v {
        if core.level == level {
            if let TracerData::Batch { val, bdim } = &core.data {
                return (val.clone(), *bdim);
            }
        }
    }
    (v.clone(), None)
}

/// Move (or create) the batch axis at position 0.
fn to_front(v: &Val, bdim: Option<usize>, size: usize) -> Result<Val> {
    match bdim {
        Some(0) => Ok(v.clone()),
        Some(b) => ops::moveaxis(v, b as i64, 0),
        None => {
            let mut target = vec![size];
            target.extend(v.shape());
            ops::broadcast_to(&ops::expand_dims(v, 0)?, &target)
        }
    }
}

pub(crate) fn process(
    prim: Primitive,
    params: Params,
    inputs: &[Val],
    level: usize,
    size: usize,
) -> Result<Vec<Val>> {
    let pairs: Vec<(Val, Option<usize>)> = inputs.iter().map(|v| unwrap(v, level)).collect();
    let (outs, bdims) = rule(prim, &params, &pairs, size)?;
    Ok(outs
        .into_iter()
        .zip(bdims)
        .map(|(v, b)| batched(level, v, b))
        .collect())
}

fn rule(
    prim: Primitive,
    params: &Params,
    ins: &[(Val, Option<usize>)],
    size: usize,
) -> Result<(Vec<Val>, Vec<Option<usize>>)> {
    use Primitive::*;
    // Every rule aligns batch axes at the front first; the rewritten
    // application then runs one level down through `bind`.
    let fronted: Vec<Val> = ins
        .iter()
        .map(|(v, b)| to_front(v, *b, size))
        .collect::<Result<_>>()?;
    match prim {
        Reshape => {
            let mut shape = vec![size];
            shape.extend(params.shape.clone().unwrap_or_default());
            let outs = bind(
                prim,
                Params {
                    shape: Some(shape),
                    ..params.clone()
                },
                &fronted,
            )?;
            Ok((outs, vec![Some(0)]))
        }
        Transpose => {
            let mut axes = vec![0usize];
            axes.extend(params.axes.clone().unwrap_or_default().iter().map(|a| a + 1));
            let outs = bind(
                prim,
                Params {
                    axes: Some(axes),
                    ..params.clone()
                },
                &fronted,
            )?;
            Ok((outs, vec![Some(0)]))
        }
        Broadcast => {
            let target = params.shape.clone().unwrap_or_default();
            // Insert explicit size-1 dims so the batch axis stays leading.
            let in_shape = fronted[0].shape();
            let mut lifted: Vec<i64> = vec![in_shape[0] as i64];
            lifted.extend(std::iter::repeat(1).take(target.len() + 1 - in_shape.len()));
            lifted.extend(in_shape[1..].iter().map(|&d| d as i64));
            let reshaped = ops::reshape(&fronted[0], &lifted)?;
            let mut full = vec![size];
            full.extend(target);
            let outs = bind(
                prim,
                Params {
                    shape: Some(full),
                    ..params.clone()
                },
                &[reshaped],
            )?;
            Ok((outs, vec![Some(0)]))
        }
        Slice => {
            let mut starts = vec![0i64];
            starts.extend(params.starts.clone().unwrap_or_default());
            let mut stops = vec![size as i64];
            stops.extend(params.stops.clone().unwrap_or_default());
            let steps = params.steps.clone().map(|s| {
                let mut v = vec![1i64];
                v.extend(s);
                v
            });
            let outs = bind(
                prim,
                Params {
                    starts: Some(starts),
                    stops: Some(stops),
                    steps,
                    ..params.clone()
                },
                &fronted,
            )?;
            Ok((outs, vec![Some(0)]))
        }
        Flip => {
            let mut flips = vec![false];
            flips.extend(params.flips.clone().unwrap_or_default());
            let outs = bind(
                prim,
                Params {
                    flips: Some(flips),
                    ..params.clone()
                },
                &fronted,
            )?;
            Ok((outs, vec![Some(0)]))
        }
        Pad => {
            let mut pads = vec![(0usize, 0usize)];
            pads.extend(params.pads.clone().unwrap_or_default());
            let outs = bind(
                prim,
                Params {
                    pads: Some(pads),
                    ..params.clone()
                },
                &fronted,
            )?;
            Ok((outs, vec![Some(0)]))
        }
        Concat => {
            let axis = params.axis.unwrap_or(0) + 1;
            let outs = bind(
                prim,
                Params {
                    axis: Some(axis),
                    ..params.clone()
                },
                &fronted,
            )?;
            Ok((outs, vec![Some(0)]))
        }
        Reduce(_) => {
            let axes: Vec<usize> = params
                .axes
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|a| a + 1)
                .collect();
            let outs = bind(
                prim,
                Params {
                    axes: Some(axes),
                    ..params.clone()
                },
                &fronted,
            )?;
            Ok((outs, vec![Some(0)]))
        }
        Sort | Argsort => {
            let outs = bind(
                prim,
                Params {
                    axis: Some(params.axis.unwrap_or(0) + 1),
                    ..params.clone()
                },
                &fronted,
            )?;
            Ok((outs, vec![Some(0)]))
        }
        // Elementwise ops, comparisons, where, cast and threefry act
        // pointwise, and matmul/cholesky/solve batch natively over leading
        // dimensions: aligning the batch axis at the front is the rule.
        _ => {
            let outs = bind(prim, params.clone(), &fronted)?;
            let n = outs.len();
            Ok((outs, vec![Some(0); n]))
        }
    }
}

/// Vectorize `f` over the axes named by `in_axes` (one entry per argument;
/// `None` arguments broadcast). Outputs carry the batch axis at position 0.
pub fn vmap<F>(f: F, in_axes: Vec<Option<usize>>) -> impl Fn(&[Val]) -> Result<Vec<Val>>
where
    F: Fn(&[Val]) -> Result<Vec<Val>>,
{
    move |args: &[Val]| {
        if args.len() != in_axes.len() {
            return Err(Error::Internal(format!(
                "vmap expects {} arguments, got {}",
                in_axes.len(),
                args.len()
            )));
        }
        let size = args
            .iter()
            .zip(&in_axes)
            .find_map(|(v, ax)| ax.map(|a| v.shape()[a]))
            .ok_or_else(|| Error::InvalidOperand {
                op: "vmap",
                message: "at least one argument must be mapped".into(),
            })?;
        let guard = push_interp(Interp::Batch { size });
        let level = guard.level;
        let wrapped: Vec<Val> = args
            .iter()
            .zip(&in_axes)
            .map(|(v, ax)| match ax {
                Some(a) => batched(level, v.clone(), Some(*a)),
                None => v.clone(),
            })
            .collect();
        let outs = f(&wrapped)?;
        drop(guard);
        outs.iter()
            .map(|out| {
                let (val, bdim) = unwrap(out, level);
                to_front(&val, bdim, size)
            })
            .collect()
    }
}
