//! Assembler: ALU expressions to straight-line stack programs.
//!
//! Emission is a post-order walk. Nodes referenced more than once in the
//! DAG are computed once and spilled to a local slot, so fused kernels do
//! not re-evaluate shared subtrees.

use std::collections::HashMap;

use gradix_ir::{AluArg, AluExp, AluOp, SpecialKind};

use super::instr::{Instr, Program};
use crate::error::{Error, Result};

#[derive(Default)]
struct Assembler {
    code: Vec<Instr>,
    slots: HashMap<u64, u16>,
    refs: HashMap<u64, usize>,
    next_slot: u16,
}

fn node_key(e: &AluExp) -> u64 {
    // Content hash: structurally equal subtrees share one slot even when
    // they are distinct allocations.
    e.hash64()
}

impl Assembler {
    fn count_refs(&mut self, e: &AluExp) {
        let n = self.refs.entry(node_key(e)).or_insert(0);
        *n += 1;
        if *n > 1 {
            return;
        }
        for child in e.src() {
            self.count_refs(child);
        }
    }

    fn emit(&mut self, e: &AluExp) -> Result<()> {
        if let Some(&slot) = self.slots.get(&node_key(e)) {
            self.code.push(Instr::LoadLocal(slot));
            return Ok(());
        }
        match e.op() {
            AluOp::Const => {
                let s = e
                    .as_const()
                    .ok_or_else(|| Error::Internal("const node without payload".into()))?;
                self.code.push(Instr::Push(s));
            }
            AluOp::Special => {
                let (kind, _) = e
                    .as_special()
                    .ok_or_else(|| Error::Internal("special node without kind".into()))?;
                self.code.push(match kind {
                    SpecialKind::Gidx => Instr::LoadGidx,
                    SpecialKind::Ridx => Instr::LoadRidx,
                    SpecialKind::Acc => Instr::LoadAcc,
                    other => {
                        return Err(Error::Internal(format!(
                            "special `{}` reached the bytecode assembler",
                            other.name()
                        )))
                    }
                });
            }
            AluOp::GlobalIndex => {
                self.emit(&e.src()[0])?;
                let gid = match e.arg() {
                    AluArg::Global { gid } => *gid as u16,
                    _ => return Err(Error::Internal("global index without gid".into())),
                };
                self.code.push(Instr::LoadGlobal {
                    gid,
                    dtype: e.dtype(),
                });
            }
            AluOp::GlobalView => {
                return Err(Error::Internal(
                    "unresolved global view reached the bytecode assembler".into(),
                ))
            }
            AluOp::Where => {
                // Stack order: condition, then-value, else-value.
                self.emit(&e.src()[0])?;
                self.emit(&e.src()[1])?;
                self.emit(&e.src()[2])?;
                self.code.push(Instr::Select);
            }
            AluOp::Cast => {
                self.emit(&e.src()[0])?;
                self.code.push(Instr::Cast(e.dtype()));
            }
            op => {
                for child in e.src() {
                    self.emit(child)?;
                }
                self.code.push(match op {
                    AluOp::Add => Instr::Add,
                    AluOp::Sub => Instr::Sub,
                    AluOp::Mul => Instr::Mul,
                    AluOp::Div => Instr::Div,
                    AluOp::IDiv => Instr::IDiv,
                    AluOp::Mod => Instr::Mod,
                    AluOp::Min => Instr::Min,
                    AluOp::Max => Instr::Max,
                    AluOp::Pow => Instr::Pow,
                    AluOp::Neg => Instr::Neg,
                    AluOp::Recip => Instr::Recip,
                    AluOp::Sqrt => Instr::Sqrt,
                    AluOp::Abs => Instr::Abs,
                    AluOp::Exp => Instr::Exp,
                    AluOp::Log => Instr::Log,
                    AluOp::Sin => Instr::Sin,
                    AluOp::Cos => Instr::Cos,
                    AluOp::Tan => Instr::Tan,
                    AluOp::Atan => Instr::Atan,
                    AluOp::Asin => Instr::Asin,
                    AluOp::Erf => Instr::Erf,
                    AluOp::Erfc => Instr::Erfc,
                    AluOp::Eq => Instr::CmpEq,
                    AluOp::Ne => Instr::CmpNe,
                    AluOp::Lt => Instr::CmpLt,
                    AluOp::Le => Instr::CmpLe,
                    AluOp::Gt => Instr::CmpGt,
                    AluOp::Ge => Instr::CmpGe,
                    other => {
                        return Err(Error::Internal(format!(
                            "op {:?} has no bytecode lowering",
                            other
                        )))
                    }
                });
            }
        }
        // Spill shared subtrees once; leaves are cheaper re-pushed.
        if self.refs.get(&node_key(e)).copied().unwrap_or(0) > 1 && !e.src().is_empty() {
            let slot = self.next_slot;
            self.next_slot += 1;
            self.slots.insert(node_key(e), slot);
            self.code.push(Instr::StoreLocal(slot));
            self.code.push(Instr::LoadLocal(slot));
        }
        Ok(())
    }
}

/// Assemble an expression into a stack program.
pub fn assemble(exp: &AluExp) -> Result<Program> {
    let mut asm = Assembler::default();
    asm.count_refs(exp);
    asm.emit(exp)?;
    Ok(Program {
        code: asm.code,
        locals: asm.next_slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradix_ir::DType;

    #[test]
    fn test_shared_subtree_spills_once() {
        let x = AluExp::gidx(8).cast(DType::F32);
        let e = x.mul(&x).add(&x);
        let prog = assemble(&e).unwrap();
        assert_eq!(prog.locals, 1);
        let stores = prog
            .code
            .iter()
            .filter(|i| matches!(i, Instr::StoreLocal(_)))
            .count();
        assert_eq!(stores, 1);
        let loads = prog
            .code
            .iter()
            .filter(|i| matches!(i, Instr::LoadLocal(_)))
            .count();
        // one reload right after the store, two at the use sites
        assert_eq!(loads, 3);
    }

    #[test]
    fn test_leaves_are_not_spilled() {
        let g = AluExp::gidx(8);
        let e = g.add(&g);
        let prog = assemble(&e).unwrap();
        assert_eq!(prog.locals, 0);
        assert_eq!(
            prog.code,
            vec![Instr::LoadGidx, Instr::LoadGidx, Instr::Add]
        );
    }
}
