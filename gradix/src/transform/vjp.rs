//! Reverse-mode differentiation: linearize via `jvp` with symbolic
//! tangents, then transpose the recorded linear tape.
//!
//! During linearization the primal side evaluates eagerly (lazy tensors)
//! while the tangent side records onto a tape whose constants are the
//! primal residuals. Every recorded equation is linear in the tape
//! variables, which is what the backward transpose pass relies on.

use std::cell::RefCell;
use std::rc::Rc;

use gradix_ir::ReduceOp;

use crate::error::{Error, Result};
use crate::trace::ops;
use crate::trace::primitive::{Params, Primitive};
use crate::trace::tape::{Tape, TapeBuilder, VarId};
use crate::trace::{push_interp, zeros_like_aval, Aval, Interp, TracerCore, TracerData, Val};

/// Linearize `f` at `primals`: primal outputs plus the linear tangent tape.
pub fn linearize<F>(f: F, primals: &[Val]) -> Result<(Vec<Val>, Tape)>
where
    F: FnOnce(&[Val]) -> Result<Vec<Val>>,
{
    let builder = Rc::new(RefCell::new(TapeBuilder::default()));
    let tape_guard = push_interp(Interp::Tape(builder.clone()));
    let tape_level = tape_guard.level;
    let tangent_args: Vec<Val> = primals
        .iter()
        .map(|p| {
            let aval = p.aval();
            let var = builder.borrow_mut().new_invar(aval.clone());
            Val::Tracer(Rc::new(TracerCore {
                level: tape_level,
                data: TracerData::Tape { var, aval },
            }))
        })
        .collect();
    let jvp_guard = push_interp(Interp::Jvp);
    let jvp_level = jvp_guard.level;
    let args: Vec<Val> = primals
        .iter()
        .zip(&tangent_args)
        .map(|(p, t)| {
            Val::Tracer(Rc::new(TracerCore {
                level: jvp_level,
                data: TracerData::Jvp {
                    primal: p.clone(),
                    tangent: t.clone(),
                },
            }))
        })
        .collect();
    let outs = f(&args)?;
    drop(jvp_guard);

    let mut primal_outs = Vec::with_capacity(outs.len());
    let mut out_vars = Vec::with_capacity(outs.len());
    for out in &outs {
        let (p, t) = match out {
            Val::Tracer(core) if core.level == jvp_level => match &core.data {
                TracerData::Jvp { primal, tangent } => (primal.clone(), tangent.clone()),
                _ => (out.clone(), zeros_like_aval(&out.aval())?),
            },
            other => (other.clone(), zeros_like_aval(&other.aval())?),
        };
        primal_outs.push(p);
        let var = match &t {
            Val::Tracer(core) if core.level == tape_level => match &core.data {
                TracerData::Tape { var, .. } => *var,
                _ => {
                    return Err(Error::Internal(
                        "tangent escaped to an unexpected interpreter".into(),
                    ))
                }
            },
            Val::Concrete(tensor) => builder.borrow_mut().lift_const(tensor),
            Val::Tracer(_) => {
                return Err(Error::Internal(
                    "tangent escaped to an unexpected interpreter".into(),
                ))
            }
        };
        out_vars.push(var);
    }
    drop(tape_guard);
    let builder = Rc::try_unwrap(builder)
        .map_err(|_| Error::Internal("tangent tape still shared after linearize".into()))?;
    Ok((primal_outs, builder.into_inner().finish(out_vars)))
}

fn accumulate(slot: &mut Option<Val>, contribution: Val) -> Result<()> {
    *slot = Some(match slot.take() {
        None => contribution,
        Some(prev) => ops::add(&prev, &contribution)?,
    });
    Ok(())
}

/// Sum `v` down to `aval`'s shape (the adjoint of broadcasting).
fn unbroadcast(v: &Val, aval: &Aval) -> Result<Val> {
    if v.shape() == aval.shape {
        return Ok(v.clone());
    }
    let v_shape = v.shape();
    let offset = v_shape.len() - aval.shape.len();
    let axes: Vec<i64> = (0..v_shape.len())
        .filter(|&d| d < offset || aval.shape[d - offset] != v_shape[d])
        .map(|d| d as i64)
        .collect();
    let summed = ops::sum(v, Some(&axes), true)?;
    let target: Vec<i64> = aval.shape.iter().map(|&d| d as i64).collect();
    ops::reshape(&summed, &target)
}

fn transpose_last2(v: &Val) -> Result<Val> {
    let rank = v.aval().rank();
    let mut axes: Vec<usize> = (0..rank).collect();
    axes.swap(rank - 2, rank - 1);
    ops::transpose(v, Some(&axes))
}

struct TIn<'a> {
    var: VarId,
    known: Option<&'a Val>,
    aval: &'a Aval,
}

/// Per-primitive transpose: cotangent contributions for the linear inputs.
/// `None` entries are knowns (no cotangent flows into them).
fn transpose_rule(
    prim: &Primitive,
    params: &Params,
    ct: &Val,
    ins: &[TIn<'_>],
) -> Result<Vec<Option<Val>>> {
    use Primitive::*;
    let linear = |i: usize| ins[i].known.is_none();
    let known = |i: usize| -> Result<&Val> {
        ins[i].known.ok_or_else(|| {
            Error::Internal(format!("transpose of {:?} requires input {} known", prim, i))
        })
    };
    let out = match prim {
        Add => vec![
            linear(0).then(|| unbroadcast(ct, ins[0].aval)).transpose()?,
            linear(1).then(|| unbroadcast(ct, ins[1].aval)).transpose()?,
        ],
        Sub => vec![
            linear(0).then(|| unbroadcast(ct, ins[0].aval)).transpose()?,
            linear(1)
                .then(|| ops::neg(ct).and_then(|n| unbroadcast(&n, ins[1].aval)))
                .transpose()?,
        ],
        Neg => vec![Some(ops::neg(ct)?)],
        Mul => {
            if linear(0) && linear(1) {
                return Err(Error::Internal("nonlinear multiply in linear tape".into()));
            }
            vec![
                if linear(0) {
                    Some(unbroadcast(&ops::mul(ct, known(1)?)?, ins[0].aval)?)
                } else {
                    None
                },
                if linear(1) {
                    Some(unbroadcast(&ops::mul(ct, known(0)?)?, ins[1].aval)?)
                } else {
                    None
                },
            ]
        }
        Div => {
            if linear(1) {
                return Err(Error::Internal(
                    "linear tape divides by a tracked value".into(),
                ));
            }
            vec![
                linear(0)
                    .then(|| ops::div(ct, known(1)?).and_then(|v| unbroadcast(&v, ins[0].aval)))
                    .transpose()?,
                None,
            ]
        }
        Where => {
            // The condition is primal data.
            let cond = known(0)?;
            let zero = ops::zeros_like(ct)?;
            vec![
                None,
                linear(1)
                    .then(|| {
                        ops::where_(cond, ct, &zero).and_then(|v| unbroadcast(&v, ins[1].aval))
                    })
                    .transpose()?,
                linear(2)
                    .then(|| {
                        ops::where_(cond, &zero, ct).and_then(|v| unbroadcast(&v, ins[2].aval))
                    })
                    .transpose()?,
            ]
        }
        Cast => vec![Some(ops::cast(ct, ins[0].aval.dtype)?)],
        Reshape => {
            let target: Vec<i64> = ins[0].aval.shape.iter().map(|&d| d as i64).collect();
            vec![Some(ops::reshape(ct, &target)?)]
        }
        Transpose => {
            let axes = params.axes.clone().unwrap_or_default();
            let mut inverse = vec![0usize; axes.len()];
            for (i, &a) in axes.iter().enumerate() {
                inverse[a] = i;
            }
            vec![Some(ops::transpose(ct, Some(&inverse))?)]
        }
        Broadcast => vec![Some(unbroadcast(ct, ins[0].aval)?)],
        Slice => {
            let starts = params.starts.clone().unwrap_or_default();
            let stops = params.stops.clone().unwrap_or_default();
            if params
                .steps
                .as_ref()
                .is_some_and(|s| s.iter().any(|&x| x != 1))
            {
                return Err(Error::Unsupported {
                    device: crate::backend::get_default(),
                    what: "transposing a strided slice".to_string(),
                });
            }
            let widths: Vec<(usize, usize)> = ins[0]
                .aval
                .shape
                .iter()
                .zip(starts.iter().zip(&stops))
                .map(|(&size, (&a, &b))| (a as usize, size - b as usize))
                .collect();
            vec![Some(ops::pad(ct, &widths)?)]
        }
        Flip => {
            let flips = params.flips.clone().unwrap_or_default();
            let axes: Vec<i64> = flips
                .iter()
                .enumerate()
                .filter_map(|(d, &f)| f.then_some(d as i64))
                .collect();
            vec![Some(if axes.is_empty() {
                ct.clone()
            } else {
                ops::flip(ct, &axes)?
            })]
        }
        Pad => {
            let pads = params.pads.clone().unwrap_or_default();
            let starts: Vec<i64> = pads.iter().map(|&(b, _)| b as i64).collect();
            let stops: Vec<i64> = ins[0]
                .aval
                .shape
                .iter()
                .zip(&pads)
                .map(|(&s, &(b, _))| (b + s) as i64)
                .collect();
            vec![Some(ops::slice(ct, &starts, &stops, None)?)]
        }
        Concat => {
            let axis = params.axis.unwrap_or(0);
            let mut out = Vec::with_capacity(ins.len());
            let mut offset = 0i64;
            for input in ins {
                let len = input.aval.shape[axis] as i64;
                if input.known.is_some() {
                    out.push(None);
                } else {
                    let mut starts = vec![0i64; input.aval.rank()];
                    let mut stops: Vec<i64> =
                        ct.shape().iter().map(|&d| d as i64).collect();
                    starts[axis] = offset;
                    stops[axis] = offset + len;
                    out.push(Some(ops::slice(ct, &starts, &stops, None)?));
                }
                offset += len;
            }
            out
        }
        Reduce(ReduceOp::Sum) => {
            let axes = params.axes.clone().unwrap_or_default();
            let keepdims = params.keepdims.unwrap_or(false);
            let kept = if keepdims {
                ct.clone()
            } else {
                let mut shape: Vec<i64> = Vec::with_capacity(ins[0].aval.rank());
                for (d, &s) in ins[0].aval.shape.iter().enumerate() {
                    shape.push(if axes.contains(&d) { 1 } else { s as i64 });
                }
                ops::reshape(ct, &shape)?
            };
            vec![Some(ops::broadcast_to(&kept, &ins[0].aval.shape)?)]
        }
        MatMul => {
            if linear(0) && linear(1) {
                return Err(Error::Internal("nonlinear matmul in linear tape".into()));
            }
            vec![
                if linear(0) {
                    let v = ops::matmul(ct, &transpose_last2(known(1)?)?)?;
                    Some(unbroadcast(&v, ins[0].aval)?)
                } else {
                    None
                },
                if linear(1) {
                    let v = ops::matmul(&transpose_last2(known(0)?)?, ct)?;
                    Some(unbroadcast(&v, ins[1].aval)?)
                } else {
                    None
                },
            ]
        }
        other => {
            return Err(Error::Internal(format!(
                "{:?} appeared in a linear tape",
                other
            )))
        }
    };
    Ok(out)
}

/// Run the backward pass of a linear tape.
fn transpose_tape(tape: &Tape, cts: &[Val]) -> Result<Vec<Val>> {
    if cts.len() != tape.outvars.len() {
        return Err(Error::Internal(format!(
            "expected {} cotangents, got {}",
            tape.outvars.len(),
            cts.len()
        )));
    }
    // Forward pass: everything derivable from constants is "known".
    let mut known: std::collections::HashMap<VarId, Val> = std::collections::HashMap::new();
    for (var, t) in tape.constvars.iter().zip(&tape.consts) {
        known.insert(*var, Val::Concrete(t.clone()));
    }
    for eqn in &tape.eqns {
        if eqn.inputs.iter().all(|v| known.contains_key(v)) {
            let ins: Vec<Val> = eqn.inputs.iter().map(|v| known[v].clone()).collect();
            let outs = crate::trace::bind(eqn.prim, eqn.params.clone(), &ins)?;
            for (var, out) in eqn.outs.iter().zip(outs) {
                known.insert(*var, out);
            }
        }
    }
    // Backward pass.
    let mut ct: std::collections::HashMap<VarId, Option<Val>> = std::collections::HashMap::new();
    for (var, c) in tape.outvars.iter().zip(cts) {
        let slot = ct.entry(*var).or_insert(None);
        accumulate(slot, c.clone())?;
    }
    for eqn in tape.eqns.iter().rev() {
        if eqn.inputs.iter().all(|v| known.contains_key(v)) {
            continue;
        }
        let out_ct = match eqn.outs.iter().find_map(|o| ct.get(o).cloned().flatten()) {
            Some(c) => c,
            None => continue,
        };
        let ins: Vec<TIn<'_>> = eqn
            .inputs
            .iter()
            .map(|&var| TIn {
                var,
                known: known.get(&var),
                aval: tape.aval(var),
            })
            .collect();
        let contributions = transpose_rule(&eqn.prim, &eqn.params, &out_ct, &ins)?;
        for (input, contribution) in ins.iter().zip(contributions) {
            if let Some(c) = contribution {
                let slot = ct.entry(input.var).or_insert(None);
                accumulate(slot, c)?;
            }
        }
    }
    tape.invars
        .iter()
        .map(|var| match ct.get(var).cloned().flatten() {
            Some(c) => Ok(c),
            None => zeros_like_aval(tape.aval(*var)),
        })
        .collect()
}

/// The pullback returned by [`vjp`]: maps output cotangents to input
/// cotangents by transposing the linear tape.
#[derive(Debug)]
pub struct Pullback {
    tape: Tape,
}

impl Pullback {
    pub fn call(&self, cotangents: &[Val]) -> Result<Vec<Val>> {
        transpose_tape(&self.tape, cotangents)
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }
}

/// Reverse-mode split: primal outputs plus a pullback closure state.
pub fn vjp<F>(f: F, primals: &[Val]) -> Result<(Vec<Val>, Pullback)>
where
    F: FnOnce(&[Val]) -> Result<Vec<Val>>,
{
    let (outs, tape) = linearize(f, primals)?;
    Ok((outs, Pullback { tape }))
}

/// Gradient of a scalar-valued function: the input cotangents for a unit
/// output cotangent.
pub fn grad<F>(f: F) -> impl Fn(&[Val]) -> Result<Vec<Val>>
where
    F: Fn(&[Val]) -> Result<Vec<Val>>,
{
    move |args: &[Val]| {
        let (outs, pullback) = vjp(&f, args)?;
        let out = outs
            .first()
            .ok_or(Error::EmptyOperandList)?;
        if outs.len() != 1 || out.aval().size() != 1 || !out.dtype().is_float() {
            return Err(Error::InvalidOperand {
                op: "grad",
                message: "function must return a single scalar float value".into(),
            });
        }
        let ct = ops::ones_like(out)?;
        pullback.call(&[ct])
    }
}
