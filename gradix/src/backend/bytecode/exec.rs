//! Run loop of the kernel stack machine.
//!
//! One executable holds the body program, the reduction descriptor and the
//! optional epilogue program. The driver re-runs the body per output index
//! (and per reduction step), folding into an accumulator register.
//! Transcendentals use the software f32 implementations; f64 operands are
//! evaluated at f32 precision (the ALU is an f32/i32/u32 machine).

use gradix_ir::{scalar_binary, scalar_compare, scalar_unary, AluOp, DType, ReduceOp, Scalar};
use half::f16;

use super::instr::{Instr, Program};
use super::softfloat as sf;
use crate::backend::{read_scalar, write_scalar};
use crate::error::{Error, Result};

/// A prepared bytecode executable.
#[derive(Debug, Clone)]
pub struct Exec {
    pub body: Program,
    pub epilogue: Option<Program>,
    pub reduce: Option<(ReduceOp, usize)>,
    pub size: usize,
    pub acc_dtype: DType,
    pub out_dtype: DType,
}

fn soft_unary(op: AluOp, x: f32) -> f32 {
    match op {
        AluOp::Exp => sf::exp_f32(x),
        AluOp::Log => sf::log_f32(x),
        AluOp::Sin => sf::sin_f32(x),
        AluOp::Cos => sf::cos_f32(x),
        AluOp::Tan => sf::tan_f32(x),
        AluOp::Atan => sf::atan_f32(x),
        AluOp::Asin => sf::asin_f32(x),
        AluOp::Erf => sf::erf_f32(x),
        AluOp::Erfc => sf::erfc_f32(x),
        _ => unreachable!(),
    }
}

fn transcendental(op: AluOp, s: Scalar) -> Result<Scalar> {
    Ok(match s {
        Scalar::F32(x) => Scalar::F32(soft_unary(op, x)),
        Scalar::F16(x) => Scalar::F16(f16::from_f32(soft_unary(op, x.to_f32()))),
        Scalar::F64(x) => Scalar::F64(soft_unary(op, x as f32) as f64),
        other => {
            return Err(Error::Internal(format!(
                "{:?} applied to {}",
                op,
                other.dtype()
            )))
        }
    })
}

fn pow_value(a: Scalar, b: Scalar) -> Scalar {
    match (a, b) {
        (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32(sf::pow_f32(x, y)),
        (Scalar::F16(x), Scalar::F16(y)) => {
            Scalar::F16(f16::from_f32(sf::pow_f32(x.to_f32(), y.to_f32())))
        }
        (Scalar::F64(x), Scalar::F64(y)) => Scalar::F64(sf::pow_f32(x as f32, y as f32) as f64),
        (a, b) => scalar_binary(AluOp::Pow, a, b),
    }
}

struct Machine<'a> {
    stack: Vec<Scalar>,
    locals: Vec<Scalar>,
    inputs: &'a [&'a [u8]],
    gidx: i64,
    ridx: i64,
    acc: Scalar,
}

impl<'a> Machine<'a> {
    fn new(locals: u16, inputs: &'a [&'a [u8]]) -> Machine<'a> {
        Machine {
            stack: Vec::with_capacity(16),
            locals: vec![Scalar::I32(0); locals as usize],
            inputs,
            gidx: 0,
            ridx: 0,
            acc: Scalar::I32(0),
        }
    }

    #[inline]
    fn pop(&mut self) -> Result<Scalar> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Internal("stack underflow".into()))
    }

    fn run(&mut self, prog: &Program) -> Result<Scalar> {
        self.stack.clear();
        for instr in &prog.code {
            match instr {
                Instr::Push(s) => self.stack.push(*s),
                Instr::LoadGidx => self.stack.push(Scalar::I32(self.gidx as i32)),
                Instr::LoadRidx => self.stack.push(Scalar::I32(self.ridx as i32)),
                Instr::LoadAcc => self.stack.push(self.acc),
                Instr::StoreLocal(slot) => {
                    let v = self.pop()?;
                    self.locals[*slot as usize] = v;
                }
                Instr::LoadLocal(slot) => self.stack.push(self.locals[*slot as usize]),
                Instr::LoadGlobal { gid, dtype } => {
                    let idx = self.pop()?.to_i64();
                    let buf = self.inputs.get(*gid as usize).ok_or_else(|| {
                        Error::Internal(format!("kernel reads missing input {}", gid))
                    })?;
                    let count = buf.len() / dtype.size_of();
                    // Masked lanes may compute wild indices; the value is
                    // discarded by a Select, so clamp instead of trapping.
                    let v = if count == 0 {
                        Scalar::zero(*dtype)
                    } else {
                        read_scalar(buf, (idx.max(0) as usize).min(count - 1), *dtype)
                    };
                    self.stack.push(v);
                }
                Instr::Select => {
                    let else_v = self.pop()?;
                    let then_v = self.pop()?;
                    let cond = self.pop()?;
                    self.stack.push(if cond.to_bool() { then_v } else { else_v });
                }
                Instr::Cast(dtype) => {
                    let v = self.pop()?;
                    self.stack.push(v.cast(*dtype));
                }
                Instr::Neg | Instr::Recip | Instr::Sqrt | Instr::Abs => {
                    let v = self.pop()?;
                    let op = match instr {
                        Instr::Neg => AluOp::Neg,
                        Instr::Recip => AluOp::Recip,
                        Instr::Sqrt => AluOp::Sqrt,
                        _ => AluOp::Abs,
                    };
                    self.stack.push(scalar_unary(op, v));
                }
                Instr::Exp
                | Instr::Log
                | Instr::Sin
                | Instr::Cos
                | Instr::Tan
                | Instr::Atan
                | Instr::Asin
                | Instr::Erf
                | Instr::Erfc => {
                    let v = self.pop()?;
                    let op = match instr {
                        Instr::Exp => AluOp::Exp,
                        Instr::Log => AluOp::Log,
                        Instr::Sin => AluOp::Sin,
                        Instr::Cos => AluOp::Cos,
                        Instr::Tan => AluOp::Tan,
                        Instr::Atan => AluOp::Atan,
                        Instr::Asin => AluOp::Asin,
                        Instr::Erf => AluOp::Erf,
                        _ => AluOp::Erfc,
                    };
                    self.stack.push(transcendental(op, v)?);
                }
                Instr::Pow => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(pow_value(a, b));
                }
                Instr::Add
                | Instr::Sub
                | Instr::Mul
                | Instr::Div
                | Instr::IDiv
                | Instr::Mod
                | Instr::Min
                | Instr::Max => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let op = match instr {
                        Instr::Add => AluOp::Add,
                        Instr::Sub => AluOp::Sub,
                        Instr::Mul => AluOp::Mul,
                        Instr::Div => AluOp::Div,
                        Instr::IDiv => AluOp::IDiv,
                        Instr::Mod => AluOp::Mod,
                        Instr::Min => AluOp::Min,
                        _ => AluOp::Max,
                    };
                    self.stack.push(scalar_binary(op, a, b));
                }
                Instr::CmpEq
                | Instr::CmpNe
                | Instr::CmpLt
                | Instr::CmpLe
                | Instr::CmpGt
                | Instr::CmpGe => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let op = match instr {
                        Instr::CmpEq => AluOp::Eq,
                        Instr::CmpNe => AluOp::Ne,
                        Instr::CmpLt => AluOp::Lt,
                        Instr::CmpLe => AluOp::Le,
                        Instr::CmpGt => AluOp::Gt,
                        _ => AluOp::Ge,
                    };
                    self.stack.push(Scalar::Bool(scalar_compare(op, a, b)));
                }
            }
        }
        self.pop()
    }
}

/// Execute a prepared kernel over input slices into the output buffer.
pub fn run_kernel(exec: &Exec, inputs: &[&[u8]], out: &mut [u8]) -> Result<()> {
    let mut m = Machine::new(
        exec.body
            .locals
            .max(exec.epilogue.as_ref().map_or(0, |p| p.locals)),
        inputs,
    );
    for gidx in 0..exec.size as i64 {
        m.gidx = gidx;
        let value = match exec.reduce {
            None => m.run(&exec.body)?,
            Some((op, r)) => {
                let mut acc = op.identity(exec.acc_dtype);
                for ridx in 0..r as i64 {
                    m.ridx = ridx;
                    let v = m.run(&exec.body)?;
                    acc = op.combine(acc, v);
                }
                match &exec.epilogue {
                    None => acc,
                    Some(ep) => {
                        m.acc = acc;
                        m.run(ep)?
                    }
                }
            }
        };
        write_scalar(out, gidx as usize, value.cast(exec.out_dtype));
    }
    Ok(())
}
