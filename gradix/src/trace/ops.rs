//! The traceable operation surface over [`Val`].
//!
//! These wrappers normalize axes, insert broadcasts and resolve inferred
//! dimensions, then apply primitives through [`bind`], so the same user
//! code runs concretely or under any transformation. Elementwise extrema
//! are `minimum`/`maximum`; `min`/`max` are the reductions.

use gradix_ir::{DType, ReduceOp, Scalar};

use super::primitive::{Params, Primitive};
use super::{bind, bind1, Val};
use crate::array::Tensor;
use crate::backend::Device;
use crate::error::{Error, Result};

/// Right-aligned broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(Error::NotBroadcastable {
                    from: a.to_vec(),
                    to: b.to_vec(),
                })
            }
        };
    }
    Ok(out)
}

fn device_of(v: &Val) -> Option<Device> {
    match v {
        Val::Concrete(t) => Some(t.device()),
        Val::Tracer(core) => match &core.data {
            super::TracerData::Jvp { primal, .. } => device_of(primal),
            super::TracerData::Batch { val, .. } => device_of(val),
            super::TracerData::Tape { .. } => None,
        },
    }
}

/// A scalar constant matching `like`'s dtype and device.
pub fn scalar_like(like: &Val, value: f64) -> Result<Val> {
    Ok(Val::Concrete(Tensor::full(
        &[],
        Scalar::from_f64(like.dtype(), value),
        device_of(like),
    )?))
}

pub fn full_like(like: &Val, value: f64) -> Result<Val> {
    broadcast_to(&scalar_like(like, value)?, &like.shape())
}

pub fn zeros_like(like: &Val) -> Result<Val> {
    full_like(like, 0.0)
}

pub fn ones_like(like: &Val) -> Result<Val> {
    full_like(like, 1.0)
}

pub fn broadcast_to(v: &Val, shape: &[usize]) -> Result<Val> {
    if v.shape() == shape {
        return Ok(v.clone());
    }
    bind1(
        Primitive::Broadcast,
        Params {
            shape: Some(shape.to_vec()),
            ..Params::default()
        },
        &[v.clone()],
    )
}

fn align2(a: &Val, b: &Val) -> Result<(Val, Val)> {
    let common = broadcast_shapes(&a.shape(), &b.shape())?;
    Ok((broadcast_to(a, &common)?, broadcast_to(b, &common)?))
}

fn binary(prim: Primitive, a: &Val, b: &Val) -> Result<Val> {
    let (a, b) = align2(a, b)?;
    bind1(prim, Params::none(), &[a, b])
}

fn unary(prim: Primitive, a: &Val) -> Result<Val> {
    bind1(prim, Params::none(), &[a.clone()])
}

macro_rules! binary_ops {
    ($($name:ident => $prim:ident),* $(,)?) => {
        $(pub fn $name(a: &Val, b: &Val) -> Result<Val> {
            binary(Primitive::$prim, a, b)
        })*
    };
}

macro_rules! unary_ops {
    ($($name:ident => $prim:ident),* $(,)?) => {
        $(pub fn $name(a: &Val) -> Result<Val> {
            unary(Primitive::$prim, a)
        })*
    };
}

binary_ops! {
    add => Add,
    sub => Sub,
    mul => Mul,
    div => Div,
    pow => Pow,
    minimum => Min,
    maximum => Max,
    eq => Eq,
    ne => Ne,
    lt => Lt,
    le => Le,
    gt => Gt,
    ge => Ge,
}

unary_ops! {
    neg => Neg,
    reciprocal => Recip,
    exp => Exp,
    log => Log,
    sin => Sin,
    cos => Cos,
    tan => Tan,
    atan => Atan,
    asin => Asin,
    sqrt => Sqrt,
    abs => Abs,
    erf => Erf,
    erfc => Erfc,
}

/// Add a scalar literal.
pub fn adds(a: &Val, s: f64) -> Result<Val> {
    add(a, &scalar_like(a, s)?)
}

pub fn subs(a: &Val, s: f64) -> Result<Val> {
    sub(a, &scalar_like(a, s)?)
}

pub fn muls(a: &Val, s: f64) -> Result<Val> {
    mul(a, &scalar_like(a, s)?)
}

pub fn divs(a: &Val, s: f64) -> Result<Val> {
    div(a, &scalar_like(a, s)?)
}

/// `where(cond, x, y)` with full broadcasting.
pub fn where_(cond: &Val, x: &Val, y: &Val) -> Result<Val> {
    let (x, y) = align2(x, y)?;
    let common = broadcast_shapes(&cond.shape(), &x.shape())?;
    let cond = broadcast_to(cond, &common)?;
    let x = broadcast_to(&x, &common)?;
    let y = broadcast_to(&y, &common)?;
    bind1(Primitive::Where, Params::none(), &[cond, x, y])
}

pub fn cast(a: &Val, dtype: DType) -> Result<Val> {
    if a.dtype() == dtype {
        return Ok(a.clone());
    }
    bind1(
        Primitive::Cast,
        Params {
            dtype: Some(dtype),
            ..Params::default()
        },
        &[a.clone()],
    )
}

// ---- movement ----

fn resolve_reshape(size: usize, shape: &[i64]) -> Result<Vec<usize>> {
    let inferred = shape.iter().filter(|&&d| d == -1).count();
    if inferred > 1 {
        return Err(Error::Ir(gradix_ir::IrError::MultipleInferredDims {
            to: shape.to_vec(),
        }));
    }
    let known: usize = shape.iter().filter(|&&d| d != -1).map(|&d| d as usize).product();
    shape
        .iter()
        .map(|&d| {
            if d >= 0 {
                Ok(d as usize)
            } else if known > 0 && size % known == 0 {
                Ok(size / known)
            } else {
                Err(Error::Ir(gradix_ir::IrError::InvalidReshape {
                    from: vec![size],
                    from_size: size,
                    to: shape.to_vec(),
                }))
            }
        })
        .collect()
}

pub fn reshape(a: &Val, shape: &[i64]) -> Result<Val> {
    let resolved = resolve_reshape(a.aval().size(), shape)?;
    if resolved == a.shape() {
        return Ok(a.clone());
    }
    bind1(
        Primitive::Reshape,
        Params {
            shape: Some(resolved),
            ..Params::default()
        },
        &[a.clone()],
    )
}

pub fn transpose(a: &Val, axes: Option<&[usize]>) -> Result<Val> {
    let rank = a.aval().rank();
    let axes: Vec<usize> = match axes {
        Some(a) => a.to_vec(),
        None => (0..rank).rev().collect(),
    };
    bind1(
        Primitive::Transpose,
        Params {
            axes: Some(axes),
            ..Params::default()
        },
        &[a.clone()],
    )
}

pub fn moveaxis(a: &Val, from: i64, to: i64) -> Result<Val> {
    let rank = a.aval().rank();
    let from = crate::array::normalize_axis(from, rank)?;
    let to = crate::array::normalize_axis(to, rank)?;
    let mut axes: Vec<usize> = (0..rank).filter(|&d| d != from).collect();
    axes.insert(to, from);
    transpose(a, Some(&axes))
}

pub fn expand_dims(a: &Val, axis: i64) -> Result<Val> {
    let rank = a.aval().rank();
    let at = if axis < 0 { axis + rank as i64 + 1 } else { axis };
    if at < 0 || at as usize > rank {
        return Err(Error::AxisOutOfBounds { axis, rank });
    }
    let mut shape: Vec<i64> = a.shape().iter().map(|&d| d as i64).collect();
    shape.insert(at as usize, 1);
    reshape(a, &shape)
}

pub fn slice(a: &Val, starts: &[i64], stops: &[i64], steps: Option<&[i64]>) -> Result<Val> {
    bind1(
        Primitive::Slice,
        Params {
            starts: Some(starts.to_vec()),
            stops: Some(stops.to_vec()),
            steps: steps.map(<[i64]>::to_vec),
            ..Params::default()
        },
        &[a.clone()],
    )
}

pub fn flip(a: &Val, axes: &[i64]) -> Result<Val> {
    let rank = a.aval().rank();
    let mut mask = vec![false; rank];
    for &ax in axes {
        let ax = crate::array::normalize_axis(ax, rank)?;
        if std::mem::replace(&mut mask[ax], true) {
            return Err(Error::DuplicateAxis { axis: ax });
        }
    }
    bind1(
        Primitive::Flip,
        Params {
            flips: Some(mask),
            ..Params::default()
        },
        &[a.clone()],
    )
}

pub fn pad(a: &Val, widths: &[(usize, usize)]) -> Result<Val> {
    if widths.iter().all(|&(b, aa)| b == 0 && aa == 0) {
        return Ok(a.clone());
    }
    bind1(
        Primitive::Pad,
        Params {
            pads: Some(widths.to_vec()),
            ..Params::default()
        },
        &[a.clone()],
    )
}

pub fn concat(parts: &[Val], axis: i64) -> Result<Val> {
    let first = parts.first().ok_or(Error::EmptyOperandList)?;
    let axis = crate::array::normalize_axis(axis, first.aval().rank())?;
    bind1(
        Primitive::Concat,
        Params {
            axis: Some(axis),
            ..Params::default()
        },
        parts,
    )
}

pub fn stack(parts: &[Val], axis: i64) -> Result<Val> {
    let lifted: Vec<Val> = parts
        .iter()
        .map(|v| expand_dims(v, axis))
        .collect::<Result<_>>()?;
    concat(&lifted, axis)
}

pub fn tile(a: &Val, reps: &[usize]) -> Result<Val> {
    let rank = a.aval().rank();
    if reps.len() != rank {
        return Err(Error::InvalidOperand {
            op: "tile",
            message: format!("expected {} reps, got {}", rank, reps.len()),
        });
    }
    let mut out = a.clone();
    for (d, &rep) in reps.iter().enumerate() {
        if rep == 1 {
            continue;
        }
        let lifted = expand_dims(&out, d as i64)?;
        let mut target = lifted.shape();
        target[d] = rep;
        let expanded = broadcast_to(&lifted, &target)?;
        let mut merged: Vec<i64> = expanded.shape().iter().map(|&x| x as i64).collect();
        let s = merged.remove(d + 1);
        merged[d] *= s;
        out = reshape(&expanded, &merged)?;
    }
    Ok(out)
}

pub fn repeat(a: &Val, rep: usize, axis: i64) -> Result<Val> {
    let axis = crate::array::normalize_axis(axis, a.aval().rank())?;
    let lifted = expand_dims(a, axis as i64 + 1)?;
    let mut target = lifted.shape();
    target[axis + 1] = rep;
    let expanded = broadcast_to(&lifted, &target)?;
    let mut merged: Vec<i64> = expanded.shape().iter().map(|&x| x as i64).collect();
    let r = merged.remove(axis + 1);
    merged[axis] *= r;
    reshape(&expanded, &merged)
}

// ---- reductions ----

fn normalize_axes(a: &Val, axes: Option<&[i64]>) -> Result<Vec<usize>> {
    let rank = a.aval().rank();
    match axes {
        None => Ok((0..rank).collect()),
        Some(axes) => {
            let mut out = Vec::with_capacity(axes.len());
            for &ax in axes {
                let ax = crate::array::normalize_axis(ax, rank)?;
                if out.contains(&ax) {
                    return Err(Error::DuplicateAxis { axis: ax });
                }
                out.push(ax);
            }
            Ok(out)
        }
    }
}

fn reduce(a: &Val, op: ReduceOp, axes: Option<&[i64]>, keepdims: bool) -> Result<Val> {
    let axes = normalize_axes(a, axes)?;
    bind1(
        Primitive::Reduce(op),
        Params {
            axes: Some(axes),
            keepdims: Some(keepdims),
            ..Params::default()
        },
        &[a.clone()],
    )
}

pub fn sum(a: &Val, axes: Option<&[i64]>, keepdims: bool) -> Result<Val> {
    reduce(a, ReduceOp::Sum, axes, keepdims)
}

pub fn prod(a: &Val, axes: Option<&[i64]>, keepdims: bool) -> Result<Val> {
    reduce(a, ReduceOp::Prod, axes, keepdims)
}

pub fn min(a: &Val, axes: Option<&[i64]>, keepdims: bool) -> Result<Val> {
    reduce(a, ReduceOp::Min, axes, keepdims)
}

pub fn max(a: &Val, axes: Option<&[i64]>, keepdims: bool) -> Result<Val> {
    reduce(a, ReduceOp::Max, axes, keepdims)
}

pub fn mean(a: &Val, axes: Option<&[i64]>, keepdims: bool) -> Result<Val> {
    let normalized = normalize_axes(a, axes)?;
    let count: usize = normalized.iter().map(|&d| a.shape()[d]).product();
    let total = sum(a, axes, keepdims)?;
    divs(&total, count as f64)
}

fn arg_extremum(a: &Val, op: ReduceOp, axis: Option<i64>) -> Result<Val> {
    let t = match axis {
        Some(_) => a.clone(),
        None => reshape(a, &[a.aval().size() as i64])?,
    };
    let axis = crate::array::normalize_axis(axis.unwrap_or(0), t.aval().rank())?;
    let extremum = reduce(&t, op, Some(&[axis as i64]), true)?;
    let hit = eq(&t, &broadcast_to(&extremum, &t.shape())?)?;
    let iota = Val::Concrete(Tensor::iota(&t.shape(), axis, device_of(&t))?);
    let miss = Val::Concrete(Tensor::full(
        &t.shape(),
        Scalar::I32(t.shape()[axis] as i32),
        device_of(&t),
    )?);
    let masked = where_(&hit, &iota, &miss)?;
    reduce(&masked, ReduceOp::Min, Some(&[axis as i64]), false)
}

pub fn argmax(a: &Val, axis: Option<i64>) -> Result<Val> {
    arg_extremum(a, ReduceOp::Max, axis)
}

pub fn argmin(a: &Val, axis: Option<i64>) -> Result<Val> {
    arg_extremum(a, ReduceOp::Min, axis)
}

// ---- linear algebra ----

pub fn matmul(a: &Val, b: &Val) -> Result<Val> {
    let (a, b) = (a.clone(), b.clone());
    let (a, squeeze_a) = if a.aval().rank() == 1 {
        (expand_dims(&a, 0)?, true)
    } else {
        (a, false)
    };
    let (b, squeeze_b) = if b.aval().rank() == 1 {
        (expand_dims(&b, 1)?, true)
    } else {
        (b, false)
    };
    let mut out = bind1(Primitive::MatMul, Params::none(), &[a, b])?;
    if squeeze_b {
        let mut shape: Vec<i64> = out.shape().iter().map(|&d| d as i64).collect();
        shape.pop();
        out = reshape(&out, &shape)?;
    }
    if squeeze_a {
        let mut shape: Vec<i64> = out.shape().iter().map(|&d| d as i64).collect();
        let at = shape.len() - if squeeze_b { 1 } else { 2 };
        shape.remove(at);
        out = reshape(&out, &shape)?;
    }
    Ok(out)
}

pub fn dot(a: &Val, b: &Val) -> Result<Val> {
    if a.aval().rank() == 1 && b.aval().rank() == 1 {
        vecdot(a, b)
    } else {
        matmul(a, b)
    }
}

pub fn vecdot(a: &Val, b: &Val) -> Result<Val> {
    sum(&mul(a, b)?, Some(&[-1]), false)
}

/// Einsum over one or two operands (composition of movement, multiply and
/// sum primitives, so it traces and differentiates like any other op).
pub fn einsum(spec: &str, operands: &[Val]) -> Result<Val> {
    let tensors: Result<Vec<&Tensor>> = operands.iter().map(Val::tensor).collect();
    match tensors {
        Ok(concrete) => Ok(Val::Concrete(crate::array::einsum(spec, &concrete)?)),
        Err(_) => Err(Error::InvalidOperand {
            op: "einsum",
            message: "einsum inside transformations is not supported; spell the \
                      contraction with matmul/sum"
                .into(),
        }),
    }
}

// ---- routines ----

pub fn sort(a: &Val, axis: i64) -> Result<Val> {
    let axis = crate::array::normalize_axis(axis, a.aval().rank())?;
    bind1(
        Primitive::Sort,
        Params {
            axis: Some(axis),
            ..Params::default()
        },
        &[a.clone()],
    )
}

pub fn argsort(a: &Val, axis: i64) -> Result<Val> {
    let axis = crate::array::normalize_axis(axis, a.aval().rank())?;
    bind1(
        Primitive::Argsort,
        Params {
            axis: Some(axis),
            ..Params::default()
        },
        &[a.clone()],
    )
}

pub fn cholesky(a: &Val) -> Result<Val> {
    bind1(Primitive::Cholesky, Params::none(), &[a.clone()])
}

pub fn solve_triangular(a: &Val, b: &Val, lower: bool, unit_diagonal: bool) -> Result<Val> {
    bind1(
        Primitive::TriangularSolve,
        Params {
            lower: Some(lower),
            unit_diagonal: Some(unit_diagonal),
            ..Params::default()
        },
        &[a.clone(), b.clone()],
    )
}

/// Elementwise Threefry-2x32 (broadcast over all four operands).
pub fn threefry(k0: &Val, k1: &Val, c0: &Val, c1: &Val) -> Result<(Val, Val)> {
    let shape = broadcast_shapes(
        &broadcast_shapes(&k0.shape(), &k1.shape())?,
        &broadcast_shapes(&c0.shape(), &c1.shape())?,
    )?;
    let ins = [
        broadcast_to(k0, &shape)?,
        broadcast_to(k1, &shape)?,
        broadcast_to(c0, &shape)?,
        broadcast_to(c1, &shape)?,
    ];
    let mut outs = bind(Primitive::Threefry, Params::none(), &ins)?;
    if outs.len() != 2 {
        return Err(Error::Internal("threefry yields two outputs".into()));
    }
    let b = outs.pop().unwrap_or_else(|| unreachable!());
    let a = outs.pop().unwrap_or_else(|| unreachable!());
    Ok((a, b))
}
