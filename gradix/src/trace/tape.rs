//! The trace tape: a linear sequence of primitive equations recorded by the
//! tape interpreter, replayed by `jit` and transposed by `vjp`.

use std::collections::HashMap;

use super::primitive::{Params, Primitive};
use super::{bind, Aval, Val};
use crate::array::Tensor;
use crate::error::{Error, Result};

pub type VarId = usize;

/// One recorded primitive application. Inputs are variables: invars,
/// constvars, or outputs of earlier equations.
#[derive(Debug, Clone)]
pub struct Eqn {
    pub prim: Primitive,
    pub params: Params,
    pub inputs: Vec<VarId>,
    pub outs: Vec<VarId>,
}

/// A finished trace. The tape owns clones of every captured constant for
/// its whole lifetime, so a cached compiled program can never observe a
/// freed buffer.
#[derive(Debug, Clone)]
pub struct Tape {
    pub avals: Vec<Aval>,
    pub constvars: Vec<VarId>,
    pub consts: Vec<Tensor>,
    pub invars: Vec<VarId>,
    pub eqns: Vec<Eqn>,
    pub outvars: Vec<VarId>,
}

impl Tape {
    pub fn aval(&self, var: VarId) -> &Aval {
        &self.avals[var]
    }
}

/// Builder used by the tape interpreter while a trace is in progress.
#[derive(Debug, Default)]
pub struct TapeBuilder {
    avals: Vec<Aval>,
    consts: Vec<(VarId, Tensor)>,
    invars: Vec<VarId>,
    eqns: Vec<Eqn>,
}

impl TapeBuilder {
    fn fresh(&mut self, aval: Aval) -> VarId {
        self.avals.push(aval);
        self.avals.len() - 1
    }

    pub fn new_invar(&mut self, aval: Aval) -> VarId {
        let var = self.fresh(aval);
        self.invars.push(var);
        var
    }

    /// Capture a concrete value; the tape owns a clone.
    pub fn lift_const(&mut self, t: &Tensor) -> VarId {
        let var = self.fresh(Aval::of(t));
        self.consts.push((var, t.clone()));
        var
    }

    pub fn add_eqn(
        &mut self,
        prim: Primitive,
        params: Params,
        inputs: Vec<VarId>,
        out_avals: Vec<Aval>,
    ) -> Vec<VarId> {
        let outs: Vec<VarId> = out_avals.into_iter().map(|a| self.fresh(a)).collect();
        self.eqns.push(Eqn {
            prim,
            params,
            inputs,
            outs: outs.clone(),
        });
        outs
    }

    pub fn finish(self, outvars: Vec<VarId>) -> Tape {
        let (constvars, consts) = self.consts.into_iter().unzip();
        Tape {
            avals: self.avals,
            constvars,
            consts,
            invars: self.invars,
            eqns: self.eqns,
            outvars,
        }
    }
}

/// Replay a tape against arguments. Replaying goes through [`bind`], so a
/// tape evaluated under another transformation picks up that
/// transformation's rewrites.
pub fn eval_tape(tape: &Tape, args: &[Val]) -> Result<Vec<Val>> {
    if args.len() != tape.invars.len() {
        return Err(Error::Internal(format!(
            "tape expects {} arguments, got {}",
            tape.invars.len(),
            args.len()
        )));
    }
    let mut env: HashMap<VarId, Val> = HashMap::new();
    for (var, value) in tape.constvars.iter().zip(&tape.consts) {
        env.insert(*var, Val::Concrete(value.clone()));
    }
    for (var, value) in tape.invars.iter().zip(args) {
        env.insert(*var, value.clone());
    }
    for eqn in &tape.eqns {
        let inputs: Vec<Val> = eqn
            .inputs
            .iter()
            .map(|v| {
                env.get(v)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("tape variable {} undefined", v)))
            })
            .collect::<Result<_>>()?;
        let outs = bind(eqn.prim, eqn.params.clone(), &inputs)?;
        for (var, value) in eqn.outs.iter().zip(outs) {
            env.insert(*var, value);
        }
    }
    tape.outvars
        .iter()
        .map(|v| {
            env.get(v)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("tape output {} undefined", v)))
        })
        .collect()
}

/// Render a tape for debugging and snapshot tests.
pub fn format_tape(tape: &Tape) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let fmt_var = |v: VarId| format!("v{}", v);
    let _ = writeln!(
        out,
        "tape {{ in: [{}], const: [{}]",
        tape.invars.iter().map(|&v| fmt_var(v)).collect::<Vec<_>>().join(", "),
        tape.constvars.iter().map(|&v| fmt_var(v)).collect::<Vec<_>>().join(", "),
    );
    for eqn in &tape.eqns {
        let _ = writeln!(
            out,
            "  [{}] = {:?} [{}]",
            eqn.outs.iter().map(|&v| fmt_var(v)).collect::<Vec<_>>().join(", "),
            eqn.prim,
            eqn.inputs.iter().map(|&v| fmt_var(v)).collect::<Vec<_>>().join(", "),
        );
    }
    let _ = writeln!(
        out,
        "  out: [{}] }}",
        tape.outvars.iter().map(|&v| fmt_var(v)).collect::<Vec<_>>().join(", "),
    );
    out
}
