//! Forward-mode differentiation: dual-number tracing.
//!
//! Non-linear primitives decompose here into a primal application plus a
//! combination that is linear in the tangents; the transpose pass in `vjp`
//! relies on that decomposition.

use std::rc::Rc;

use gradix_ir::ReduceOp;

use crate::error::{Error, Result};
use crate::trace::ops;
use crate::trace::primitive::{Params, Primitive};
use crate::trace::{bind, push_interp, zeros_like_aval, Interp, TracerCore, TracerData, Val};

/// Split a value into (primal, tangent) at `level`.
fn split(v: &Val, level: usize) -> Result<(Val, Val)> {
    if let Val::Tracer(core) = v {
        if core.level == level {
            if let TracerData::Jvp { primal, tangent } = &core.data {
                return Ok((primal.clone(), tangent.clone()));
            }
        }
    }
    Ok((v.clone(), zeros_like_aval(&v.aval())?))
}

fn dual(level: usize, primal: Val, tangent: Val) -> Val {
    Val::Tracer(Rc::new(TracerCore {
        level,
        data: TracerData::Jvp { primal, tangent },
    }))
}

pub(crate) fn process(
    prim: Primitive,
    params: Params,
    inputs: &[Val],
    level: usize,
) -> Result<Vec<Val>> {
    let mut primals = Vec::with_capacity(inputs.len());
    let mut tangents = Vec::with_capacity(inputs.len());
    for v in inputs {
        let (p, t) = split(v, level)?;
        primals.push(p);
        tangents.push(t);
    }
    let (out_primals, out_tangents) = rule(prim, &params, &primals, &tangents)?;
    Ok(out_primals
        .into_iter()
        .zip(out_tangents)
        .map(|(p, t)| dual(level, p, t))
        .collect())
}

/// The tangent of `sign(p) * |t|`-style rules: `-1` below zero, `+1` above.
fn sign_of(p: &Val) -> Result<Val> {
    let neg_one = ops::full_like(p, -1.0)?;
    let one = ops::full_like(p, 1.0)?;
    ops::where_(&ops::lt(p, &ops::zeros_like(p)?)?, &neg_one, &one)
}

fn rule(
    prim: Primitive,
    params: &Params,
    p: &[Val],
    t: &[Val],
) -> Result<(Vec<Val>, Vec<Val>)> {
    use Primitive::*;
    let out = match prim {
        Add => (ops::add(&p[0], &p[1])?, ops::add(&t[0], &t[1])?),
        Sub => (ops::sub(&p[0], &p[1])?, ops::sub(&t[0], &t[1])?),
        Neg => (ops::neg(&p[0])?, ops::neg(&t[0])?),
        Mul => (
            ops::mul(&p[0], &p[1])?,
            ops::add(&ops::mul(&t[0], &p[1])?, &ops::mul(&p[0], &t[1])?)?,
        ),
        Div => (
            ops::div(&p[0], &p[1])?,
            ops::sub(
                &ops::div(&t[0], &p[1])?,
                &ops::mul(&ops::div(&p[0], &ops::mul(&p[1], &p[1])?)?, &t[1])?,
            )?,
        ),
        Pow => {
            let out = ops::pow(&p[0], &p[1])?;
            let dx = ops::mul(&t[0], &ops::mul(&p[1], &ops::pow(&p[0], &ops::subs(&p[1], 1.0)?)?)?)?;
            let dy = ops::mul(&t[1], &ops::mul(&ops::log(&p[0])?, &out)?)?;
            (out.clone(), ops::add(&dx, &dy)?)
        }
        Min => (
            ops::minimum(&p[0], &p[1])?,
            ops::where_(&ops::le(&p[0], &p[1])?, &t[0], &t[1])?,
        ),
        Max => (
            ops::maximum(&p[0], &p[1])?,
            ops::where_(&ops::ge(&p[0], &p[1])?, &t[0], &t[1])?,
        ),
        Recip => (
            ops::reciprocal(&p[0])?,
            ops::neg(&ops::div(&t[0], &ops::mul(&p[0], &p[0])?)?)?,
        ),
        Exp => {
            let out = ops::exp(&p[0])?;
            (out.clone(), ops::mul(&t[0], &out)?)
        }
        Log => (ops::log(&p[0])?, ops::div(&t[0], &p[0])?),
        Sin => (ops::sin(&p[0])?, ops::mul(&t[0], &ops::cos(&p[0])?)?),
        Cos => (
            ops::cos(&p[0])?,
            ops::neg(&ops::mul(&t[0], &ops::sin(&p[0])?)?)?,
        ),
        Tan => {
            let c = ops::cos(&p[0])?;
            (ops::tan(&p[0])?, ops::div(&t[0], &ops::mul(&c, &c)?)?)
        }
        Atan => (
            ops::atan(&p[0])?,
            ops::div(&t[0], &ops::adds(&ops::mul(&p[0], &p[0])?, 1.0)?)?,
        ),
        Asin => {
            let one_minus = ops::sub(&ops::ones_like(&p[0])?, &ops::mul(&p[0], &p[0])?)?;
            (ops::asin(&p[0])?, ops::div(&t[0], &ops::sqrt(&one_minus)?)?)
        }
        Sqrt => {
            let out = ops::sqrt(&p[0])?;
            (out.clone(), ops::div(&t[0], &ops::muls(&out, 2.0)?)?)
        }
        Abs => (ops::abs(&p[0])?, ops::mul(&t[0], &sign_of(&p[0])?)?),
        Erf => {
            // d/dx erf = 2/sqrt(pi) * exp(-x^2)
            let gauss = ops::exp(&ops::neg(&ops::mul(&p[0], &p[0])?)?)?;
            let scale = 2.0 / std::f64::consts::PI.sqrt();
            (ops::erf(&p[0])?, ops::mul(&t[0], &ops::muls(&gauss, scale)?)?)
        }
        Erfc => {
            let gauss = ops::exp(&ops::neg(&ops::mul(&p[0], &p[0])?)?)?;
            let scale = -2.0 / std::f64::consts::PI.sqrt();
            (ops::erfc(&p[0])?, ops::mul(&t[0], &ops::muls(&gauss, scale)?)?)
        }
        Eq | Ne | Lt | Le | Gt | Ge | Argsort => {
            let outs = bind(prim, params.clone(), p)?;
            let zero = zeros_like_aval(&outs[0].aval())?;
            return Ok((outs, vec![zero]));
        }
        Where => (
            ops::where_(&p[0], &p[1], &p[2])?,
            ops::where_(&p[0], &t[1], &t[2])?,
        ),
        Cast => {
            let out = bind(prim, params.clone(), p)?.remove(0);
            let tangent = if out.dtype().is_float() && p[0].dtype().is_float() {
                bind(prim, params.clone(), &[t[0].clone()])?.remove(0)
            } else {
                zeros_like_aval(&out.aval())?
            };
            (out, tangent)
        }
        Reshape | Transpose | Broadcast | Slice | Flip | Pad | Concat => {
            let outs = bind(prim, params.clone(), p)?;
            let tangent = bind(prim, params.clone(), t)?.remove(0);
            return Ok((outs, vec![tangent]));
        }
        Reduce(ReduceOp::Sum) => {
            let outs = bind(prim, params.clone(), p)?;
            let tangent = bind(prim, params.clone(), t)?.remove(0);
            return Ok((outs, vec![tangent]));
        }
        Reduce(ReduceOp::Min) | Reduce(ReduceOp::Max) => {
            let op = match prim {
                Reduce(op) => op,
                _ => unreachable!(),
            };
            let axes: Vec<i64> = params
                .axes
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|&a| a as i64)
                .collect();
            let out = bind(prim, params.clone(), p)?.remove(0);
            let kept = bind(
                Primitive::Reduce(op),
                Params {
                    axes: params.axes.clone(),
                    keepdims: Some(true),
                    ..Params::default()
                },
                p,
            )?
            .remove(0);
            let mask = ops::eq(&p[0], &ops::broadcast_to(&kept, &p[0].shape())?)?;
            let masked = ops::where_(&mask, &t[0], &ops::zeros_like(&t[0])?)?;
            let tangent = ops::sum(&masked, Some(&axes), params.keepdims.unwrap_or(false))?;
            (out, tangent)
        }
        Reduce(ReduceOp::Prod) => {
            let out = bind(prim, params.clone(), p)?.remove(0);
            let axes: Vec<i64> = params
                .axes
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|&a| a as i64)
                .collect();
            let kept = bind(
                Primitive::Reduce(ReduceOp::Prod),
                Params {
                    axes: params.axes.clone(),
                    keepdims: Some(true),
                    ..Params::default()
                },
                p,
            )?
            .remove(0);
            let per = ops::mul(&ops::div(&ops::broadcast_to(&kept, &p[0].shape())?, &p[0])?, &t[0])?;
            let tangent = ops::sum(&per, Some(&axes), params.keepdims.unwrap_or(false))?;
            (out, tangent)
        }
        MatMul => (
            ops::matmul(&p[0], &p[1])?,
            ops::add(&ops::matmul(&t[0], &p[1])?, &ops::matmul(&p[0], &t[1])?)?,
        ),
        Threefry | Sort => {
            // PRNG bits carry no tangent; sorting reorders data whose
            // tangent we do not track through the permutation.
            let outs = bind(prim, params.clone(), p)?;
            let zeros = outs
                .iter()
                .map(|o| zeros_like_aval(&o.aval()))
                .collect::<Result<Vec<_>>>()?;
            return Ok((outs, zeros));
        }
        Cholesky | TriangularSolve => {
            return Err(Error::Unsupported {
                device: crate::backend::get_default(),
                what: format!("differentiation through {:?}", prim),
            })
        }
    };
    Ok((vec![out.0], vec![out.1]))
}

/// Forward-mode derivative of `f` at `primals` along `tangents`.
pub fn jvp<F>(f: F, primals: &[Val], tangents: &[Val]) -> Result<(Vec<Val>, Vec<Val>)>
where
    F: FnOnce(&[Val]) -> Result<Vec<Val>>,
{
    if primals.len() != tangents.len() {
        return Err(Error::Internal(format!(
            "jvp got {} primals but {} tangents",
            primals.len(),
            tangents.len()
        )));
    }
    let guard = push_interp(Interp::Jvp);
    let level = guard.level;
    let args: Vec<Val> = primals
        .iter()
        .zip(tangents)
        .map(|(p, t)| dual(level, p.clone(), t.clone()))
        .collect();
    let outs = f(&args)?;
    drop(guard);
    let mut out_primals = Vec::with_capacity(outs.len());
    let mut out_tangents = Vec::with_capacity(outs.len());
    for out in &outs {
        let (p, t) = split(out, level)?;
        out_primals.push(p);
        out_tangents.push(t);
    }
    Ok((out_primals, out_tangents))
}
