//! Trace-compile-cache: `jit(f)` traces `f` once per input signature and
//! replays the recorded tape on later calls.
//!
//! Fusion falls out of replay: consecutive elementwise equations build one
//! lazy expression, a reduction or routine breaks the group, and the
//! backends cache each kernel executable by content hash, so a cache hit
//! issues the stored dispatch sequence without recompiling anything.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use gradix_ir::DType;

use crate::backend::Device;
use crate::debug::log_sched;
use crate::error::{Error, Result};
use crate::trace::primitive::{abstract_eval, Params, Primitive};
use crate::trace::tape::{eval_tape, Tape, TapeBuilder, VarId};
use crate::trace::{push_interp, Aval, Interp, TracerCore, TracerData, Val};

fn tape_tracer(level: usize, var: VarId, aval: Aval) -> Val {
    Val::Tracer(Rc::new(TracerCore {
        level,
        data: TracerData::Tape { var, aval },
    }))
}

fn as_tape_var(v: &Val, level: usize) -> Option<VarId> {
    if let Val::Tracer(core) = v {
        if core.level == level {
            if let TracerData::Tape { var, .. } = &core.data {
                return Some(*var);
            }
        }
    }
    None
}

pub(crate) fn process_tape(
    builder: &Rc<RefCell<TapeBuilder>>,
    prim: Primitive,
    params: Params,
    inputs: &[Val],
    level: usize,
) -> Result<Vec<Val>> {
    let mut vars = Vec::with_capacity(inputs.len());
    for v in inputs {
        match as_tape_var(v, level) {
            Some(var) => vars.push(var),
            None => match v {
                Val::Concrete(t) => vars.push(builder.borrow_mut().lift_const(t)),
                Val::Tracer(_) => {
                    return Err(Error::Internal(
                        "traced function closed over a tracer from an outer transformation"
                            .into(),
                    ))
                }
            },
        }
    }
    let in_avals: Vec<Aval> = inputs.iter().map(Val::aval).collect();
    let aval_refs: Vec<&Aval> = in_avals.iter().collect();
    let out_avals = abstract_eval(&prim, &params, &aval_refs)?;
    let outs = builder
        .borrow_mut()
        .add_eqn(prim, params, vars, out_avals.clone());
    Ok(outs
        .into_iter()
        .zip(out_avals)
        .map(|(var, aval)| tape_tracer(level, var, aval))
        .collect())
}

/// Trace `f` against abstract inputs, producing a tape.
pub fn trace_to_tape<F>(f: F, in_avals: &[Aval]) -> Result<Tape>
where
    F: FnOnce(&[Val]) -> Result<Vec<Val>>,
{
    let builder = Rc::new(RefCell::new(TapeBuilder::default()));
    let guard = push_interp(Interp::Tape(builder.clone()));
    let level = guard.level;
    let args: Vec<Val> = in_avals
        .iter()
        .map(|aval| {
            let var = builder.borrow_mut().new_invar(aval.clone());
            tape_tracer(level, var, aval.clone())
        })
        .collect();
    let outs = f(&args)?;
    let mut outvars = Vec::with_capacity(outs.len());
    for out in &outs {
        match as_tape_var(out, level) {
            Some(var) => outvars.push(var),
            None => match out {
                // An output independent of the inputs is captured as a
                // constant so replay can still produce it.
                Val::Concrete(t) => outvars.push(builder.borrow_mut().lift_const(t)),
                Val::Tracer(_) => {
                    return Err(Error::Internal(
                        "traced function returned a tracer from an outer transformation".into(),
                    ))
                }
            },
        }
    }
    drop(guard);
    let builder = Rc::try_unwrap(builder)
        .map_err(|_| Error::Internal("tape builder still shared after trace".into()))?;
    Ok(builder.into_inner().finish(outvars))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SigKey {
    avals: Vec<(Vec<usize>, DType)>,
    device: Option<Device>,
    static_bytes: Vec<Vec<u8>>,
}

/// A traced, cached function.
pub struct Jit<F> {
    f: F,
    static_argnums: Vec<usize>,
    cache: RefCell<HashMap<SigKey, Rc<Tape>>>,
    hits: std::cell::Cell<usize>,
}

impl<F> std::fmt::Debug for Jit<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jit")
            .field("cache_entries", &self.cache.borrow().len())
            .field("hits", &self.hits.get())
            .finish()
    }
}

/// Wrap `f` in a trace-and-cache layer.
pub fn jit<F>(f: F) -> Jit<F>
where
    F: Fn(&[Val]) -> Result<Vec<Val>>,
{
    jit_with_static(f, &[])
}

/// `jit` with static argument positions: those arguments are baked into the
/// trace, and their concrete bytes join the cache key.
pub fn jit_with_static<F>(f: F, static_argnums: &[usize]) -> Jit<F>
where
    F: Fn(&[Val]) -> Result<Vec<Val>>,
{
    Jit {
        f,
        static_argnums: static_argnums.to_vec(),
        cache: RefCell::new(HashMap::new()),
        hits: std::cell::Cell::new(0),
    }
}

impl<F> Jit<F>
where
    F: Fn(&[Val]) -> Result<Vec<Val>>,
{
    pub fn call(&self, args: &[Val]) -> Result<Vec<Val>> {
        let mut static_bytes = Vec::new();
        for &i in &self.static_argnums {
            let t = args
                .get(i)
                .ok_or_else(|| Error::Internal(format!("static argnum {} out of range", i)))?
                .tensor()?;
            let data = t.to_vec()?;
            static_bytes.push(format!("{:?}", data).into_bytes());
        }
        let dynamic: Vec<Val> = args
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.static_argnums.contains(i))
            .map(|(_, v)| v.clone())
            .collect();
        let device = dynamic.iter().find_map(|v| match v {
            Val::Concrete(t) => Some(t.device()),
            Val::Tracer(_) => None,
        });
        let key = SigKey {
            avals: dynamic
                .iter()
                .map(|v| (v.shape(), v.dtype()))
                .collect(),
            device,
            static_bytes,
        };
        let cached = self.cache.borrow().get(&key).cloned();
        let tape = match cached {
            Some(tape) => {
                self.hits.set(self.hits.get() + 1);
                log_sched("jit cache hit");
                tape
            }
            None => {
                let in_avals: Vec<Aval> = dynamic.iter().map(Val::aval).collect();
                let statics: Vec<(usize, Val)> = self
                    .static_argnums
                    .iter()
                    .map(|&i| (i, args[i].clone()))
                    .collect();
                let n_args = args.len();
                let f = &self.f;
                let tape = trace_to_tape(
                    move |tracers: &[Val]| {
                        // Reassemble the full argument list: tracers for
                        // dynamic positions, baked values for static ones.
                        let mut full: Vec<Option<Val>> = vec![None; n_args];
                        for (i, v) in &statics {
                            full[*i] = Some(v.clone());
                        }
                        let mut it = tracers.iter();
                        for slot in full.iter_mut() {
                            if slot.is_none() {
                                *slot = it.next().cloned();
                            }
                        }
                        let full: Vec<Val> = full
                            .into_iter()
                            .map(|v| v.ok_or_else(|| Error::Internal("argument mismatch".into())))
                            .collect::<Result<_>>()?;
                        f(&full)
                    },
                    &in_avals,
                )?;
                let tape = Rc::new(tape);
                self.cache.borrow_mut().insert(key, tape.clone());
                tape
            }
        };
        eval_tape(&tape, &dynamic)
    }

    pub fn cache_size(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn cache_hits(&self) -> usize {
        self.hits.get()
    }
}
