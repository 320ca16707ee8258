//! The ALU expression IR: a small, pure, typed expression language.
//!
//! Expressions are immutable reference-counted DAG nodes. Structural equality
//! is backed by a content hash computed at construction, which also drives
//! the commutative canonicalization in the simplifier. Building an
//! ill-formed node (wrong arity, inconsistent child dtypes) is a fatal usage
//! error and panics with a description of the violation.

mod eval;
mod simplify;

pub use eval::{scalar_binary, scalar_compare, scalar_unary, EvalCtx, GlobalRead, NoGlobals};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::dtype::{DType, Scalar};
use crate::view::ShapeTracker;

/// Operation tag of an ALU expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AluOp {
    // leaves
    Const,
    Special,
    GlobalIndex,
    GlobalView,
    // element-wise binary
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Min,
    Max,
    Pow,
    // element-wise unary
    Neg,
    Recip,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Atan,
    Asin,
    Sqrt,
    Abs,
    Erf,
    Erfc,
    // comparisons (bool result)
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // selection and conversion
    Where,
    Cast,
}

impl AluOp {
    /// Child count, or None for the variadic `GlobalView`.
    pub fn arity(self) -> Option<usize> {
        use AluOp::*;
        match self {
            Const | Special => Some(0),
            GlobalIndex | Neg | Recip | Exp | Log | Sin | Cos | Tan | Atan | Asin | Sqrt
            | Abs | Erf | Erfc | Cast => Some(1),
            Add | Sub | Mul | Div | IDiv | Mod | Min | Max | Pow | Eq | Ne | Lt | Le | Gt
            | Ge => Some(2),
            Where => Some(3),
            GlobalView => None,
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            AluOp::Add | AluOp::Mul | AluOp::Min | AluOp::Max | AluOp::Eq | AluOp::Ne
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            AluOp::Eq | AluOp::Ne | AluOp::Lt | AluOp::Le | AluOp::Gt | AluOp::Ge
        )
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            AluOp::Add
                | AluOp::Sub
                | AluOp::Mul
                | AluOp::Div
                | AluOp::IDiv
                | AluOp::Mod
                | AluOp::Min
                | AluOp::Max
                | AluOp::Pow
        ) || self.is_comparison()
    }

    pub fn is_unary(self) -> bool {
        matches!(
            self,
            AluOp::Neg
                | AluOp::Recip
                | AluOp::Exp
                | AluOp::Log
                | AluOp::Sin
                | AluOp::Cos
                | AluOp::Tan
                | AluOp::Atan
                | AluOp::Asin
                | AluOp::Sqrt
                | AluOp::Abs
                | AluOp::Erf
                | AluOp::Erfc
        )
    }
}

/// Thread-index and accumulator specials available inside a kernel body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialKind {
    /// Flat output index.
    Gidx,
    /// Reduction loop index.
    Ridx,
    /// Cooperating thread index within a reduction group.
    Group,
    /// Reduction accumulator (epilogue fusion only).
    Acc,
    /// Unroll lane index.
    Unroll,
    /// Upcast lane index.
    Upcast,
}

impl SpecialKind {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SpecialKind::Gidx => "gidx",
            SpecialKind::Ridx => "ridx",
            SpecialKind::Group => "group",
            SpecialKind::Acc => "acc",
            SpecialKind::Unroll => "unroll",
            SpecialKind::Upcast => "upcast",
        }
    }
}

/// Immutable auxiliary payload of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum AluArg {
    None,
    Const(Scalar),
    Special { kind: SpecialKind, size: usize },
    /// Read by precomputed linear index from input `gid`.
    Global { gid: usize },
    /// Read by logical multi-index from input `gid` through a tracker.
    View { gid: usize, tracker: ShapeTracker },
}

impl AluArg {
    fn feed(&self, h: &mut DefaultHasher) {
        match self {
            AluArg::None => h.write_u8(0),
            AluArg::Const(s) => {
                h.write_u8(1);
                h.write_u64(s.bits());
            }
            AluArg::Special { kind, size } => {
                h.write_u8(2);
                h.write_u8(kind.index() as u8);
                h.write_u64(*size as u64);
            }
            AluArg::Global { gid } => {
                h.write_u8(3);
                h.write_u64(*gid as u64);
            }
            AluArg::View { gid, tracker } => {
                h.write_u8(4);
                h.write_u64(*gid as u64);
                for view in tracker.views() {
                    for &s in &view.shape {
                        h.write_u64(s as u64);
                    }
                    for &s in &view.strides {
                        h.write_i64(s);
                    }
                    h.write_i64(view.offset);
                    if let Some(mask) = &view.mask {
                        for &(lo, hi) in mask {
                            h.write_i64(lo);
                            h.write_i64(hi);
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct AluNode {
    op: AluOp,
    dtype: DType,
    src: Vec<AluExp>,
    arg: AluArg,
    hash: u64,
}

/// A reference to an immutable ALU expression node.
#[derive(Clone)]
pub struct AluExp(Rc<AluNode>);

impl fmt::Debug for AluExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.0.op, &self.0.arg) {
            (AluOp::Const, AluArg::Const(s)) => write!(f, "{}", s),
            (AluOp::Special, AluArg::Special { kind, size }) => {
                write!(f, "{}[{}]", kind.name(), size)
            }
            (AluOp::GlobalIndex, AluArg::Global { gid }) => {
                write!(f, "g{}[{:?}]", gid, self.0.src[0])
            }
            (AluOp::GlobalView, AluArg::View { gid, .. }) => {
                write!(f, "g{}{:?}", gid, self.0.src)
            }
            (AluOp::Cast, _) => write!(f, "cast<{}>({:?})", self.0.dtype, self.0.src[0]),
            (op, _) => {
                write!(f, "{:?}(", op)?;
                for (i, s) in self.0.src.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", s)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl PartialEq for AluExp {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        if self.0.hash != other.0.hash {
            return false;
        }
        self.0.op == other.0.op
            && self.0.dtype == other.0.dtype
            && self.0.arg == other.0.arg
            && self.0.src == other.0.src
    }
}

impl Eq for AluExp {}

impl Hash for AluExp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl AluExp {
    /// Generic constructor. Panics on arity or dtype violations: building an
    /// ill-typed expression is a programmer error, never a data error.
    pub fn new(op: AluOp, dtype: DType, src: Vec<AluExp>, arg: AluArg) -> AluExp {
        if let Some(arity) = op.arity() {
            assert!(
                src.len() == arity,
                "{:?} expects {} children, got {}",
                op,
                arity,
                src.len()
            );
        }
        match op {
            AluOp::Const => assert!(
                matches!(&arg, AluArg::Const(s) if s.dtype() == dtype),
                "const node requires a matching scalar payload"
            ),
            AluOp::Special => {
                assert!(matches!(arg, AluArg::Special { .. }), "special node requires a kind")
            }
            AluOp::GlobalIndex => {
                assert!(matches!(arg, AluArg::Global { .. }), "global index requires a gid");
                assert!(src[0].dtype().is_int(), "global index must be integer-typed");
            }
            AluOp::GlobalView => match &arg {
                AluArg::View { tracker, .. } => {
                    assert_eq!(
                        src.len(),
                        tracker.rank(),
                        "global view expects one index per tracker dimension"
                    );
                    assert!(
                        src.iter().all(|i| i.dtype().is_int()),
                        "global view indices must be integer-typed"
                    );
                }
                _ => panic!("global view requires a tracker payload"),
            },
            AluOp::Where => {
                assert_eq!(src[0].dtype(), DType::Bool, "where condition must be bool");
                assert!(
                    src[1].dtype() == dtype && src[2].dtype() == dtype,
                    "where branches must match the node dtype"
                );
            }
            AluOp::Cast => {}
            op if op.is_comparison() => {
                assert_eq!(dtype, DType::Bool, "comparisons produce bool");
                assert_eq!(src[0].dtype(), src[1].dtype(), "comparison operands must match");
            }
            op if op.is_binary() => assert!(
                src[0].dtype() == dtype && src[1].dtype() == dtype,
                "{:?} operands must match the node dtype",
                op
            ),
            op if op.is_unary() => {
                assert_eq!(src[0].dtype(), dtype, "{:?} operand must match the node dtype", op)
            }
            _ => {}
        }
        let mut h = DefaultHasher::new();
        h.write_u8(op as u8);
        h.write_u8(dtype as u8);
        arg.feed(&mut h);
        for child in &src {
            h.write_u64(child.0.hash);
        }
        AluExp(Rc::new(AluNode {
            op,
            dtype,
            src,
            arg,
            hash: h.finish(),
        }))
    }

    // ---- leaf factories ----

    pub fn constant(s: Scalar) -> AluExp {
        AluExp::new(AluOp::Const, s.dtype(), vec![], AluArg::Const(s))
    }

    pub fn const_i32(v: i32) -> AluExp {
        AluExp::constant(Scalar::I32(v))
    }

    pub fn const_bool(v: bool) -> AluExp {
        AluExp::constant(Scalar::Bool(v))
    }

    pub fn const_of(dtype: DType, v: f64) -> AluExp {
        AluExp::constant(Scalar::from_f64(dtype, v))
    }

    /// Thread-index special. All index specials are i32; `Acc` carries the
    /// accumulator dtype instead.
    pub fn special(dtype: DType, kind: SpecialKind, size: usize) -> AluExp {
        AluExp::new(AluOp::Special, dtype, vec![], AluArg::Special { kind, size })
    }

    pub fn gidx(size: usize) -> AluExp {
        AluExp::special(DType::I32, SpecialKind::Gidx, size)
    }

    pub fn ridx(size: usize) -> AluExp {
        AluExp::special(DType::I32, SpecialKind::Ridx, size)
    }

    pub fn acc(dtype: DType) -> AluExp {
        AluExp::special(dtype, SpecialKind::Acc, 0)
    }

    pub fn global_index(dtype: DType, gid: usize, index: AluExp) -> AluExp {
        AluExp::new(AluOp::GlobalIndex, dtype, vec![index], AluArg::Global { gid })
    }

    pub fn global_view(
        dtype: DType,
        gid: usize,
        tracker: ShapeTracker,
        indices: Vec<AluExp>,
    ) -> AluExp {
        AluExp::new(AluOp::GlobalView, dtype, indices, AluArg::View { gid, tracker })
    }

    // ---- accessors ----

    pub fn op(&self) -> AluOp {
        self.0.op
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn src(&self) -> &[AluExp] {
        &self.0.src
    }

    pub fn arg(&self) -> &AluArg {
        &self.0.arg
    }

    /// Content hash; stable for structurally equal expressions.
    pub fn hash64(&self) -> u64 {
        self.0.hash
    }

    pub fn as_const(&self) -> Option<Scalar> {
        match &self.0.arg {
            AluArg::Const(s) if self.0.op == AluOp::Const => Some(*s),
            _ => None,
        }
    }

    pub fn as_special(&self) -> Option<(SpecialKind, usize)> {
        match &self.0.arg {
            AluArg::Special { kind, size } if self.0.op == AluOp::Special => Some((*kind, *size)),
            _ => None,
        }
    }

    fn key(&self) -> *const AluNode {
        Rc::as_ptr(&self.0)
    }

    // ---- element-wise builders ----

    fn binary(&self, op: AluOp, other: &AluExp) -> AluExp {
        AluExp::new(op, self.dtype(), vec![self.clone(), other.clone()], AluArg::None)
    }

    fn compare(&self, op: AluOp, other: &AluExp) -> AluExp {
        AluExp::new(op, DType::Bool, vec![self.clone(), other.clone()], AluArg::None)
    }

    fn unary(&self, op: AluOp) -> AluExp {
        AluExp::new(op, self.dtype(), vec![self.clone()], AluArg::None)
    }

    pub fn add(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::Add, o)
    }
    pub fn sub(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::Sub, o)
    }
    pub fn mul(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::Mul, o)
    }
    pub fn div(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::Div, o)
    }
    pub fn idiv(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::IDiv, o)
    }
    pub fn rem(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::Mod, o)
    }
    pub fn min_(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::Min, o)
    }
    pub fn max_(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::Max, o)
    }
    pub fn pow(&self, o: &AluExp) -> AluExp {
        self.binary(AluOp::Pow, o)
    }

    pub fn neg(&self) -> AluExp {
        self.unary(AluOp::Neg)
    }
    pub fn recip(&self) -> AluExp {
        self.unary(AluOp::Recip)
    }
    pub fn exp(&self) -> AluExp {
        self.unary(AluOp::Exp)
    }
    pub fn log(&self) -> AluExp {
        self.unary(AluOp::Log)
    }
    pub fn sin(&self) -> AluExp {
        self.unary(AluOp::Sin)
    }
    pub fn cos(&self) -> AluExp {
        self.unary(AluOp::Cos)
    }
    pub fn tan(&self) -> AluExp {
        self.unary(AluOp::Tan)
    }
    pub fn atan(&self) -> AluExp {
        self.unary(AluOp::Atan)
    }
    pub fn asin(&self) -> AluExp {
        self.unary(AluOp::Asin)
    }
    pub fn sqrt(&self) -> AluExp {
        self.unary(AluOp::Sqrt)
    }
    pub fn abs(&self) -> AluExp {
        self.unary(AluOp::Abs)
    }
    pub fn erf(&self) -> AluExp {
        self.unary(AluOp::Erf)
    }
    pub fn erfc(&self) -> AluExp {
        self.unary(AluOp::Erfc)
    }

    pub fn eq_(&self, o: &AluExp) -> AluExp {
        self.compare(AluOp::Eq, o)
    }
    pub fn ne_(&self, o: &AluExp) -> AluExp {
        self.compare(AluOp::Ne, o)
    }
    pub fn lt(&self, o: &AluExp) -> AluExp {
        self.compare(AluOp::Lt, o)
    }
    pub fn le(&self, o: &AluExp) -> AluExp {
        self.compare(AluOp::Le, o)
    }
    pub fn gt(&self, o: &AluExp) -> AluExp {
        self.compare(AluOp::Gt, o)
    }
    pub fn ge(&self, o: &AluExp) -> AluExp {
        self.compare(AluOp::Ge, o)
    }

    /// Boolean conjunction, expressed through `where` (the op set carries no
    /// dedicated logical ops).
    pub fn and(&self, o: &AluExp) -> AluExp {
        assert_eq!(self.dtype(), DType::Bool);
        if let Some(Scalar::Bool(true)) = self.as_const() {
            return o.clone();
        }
        if let Some(Scalar::Bool(true)) = o.as_const() {
            return self.clone();
        }
        AluExp::select(self, o, &AluExp::const_bool(false))
    }

    pub fn select(cond: &AluExp, x: &AluExp, y: &AluExp) -> AluExp {
        AluExp::new(
            AluOp::Where,
            x.dtype(),
            vec![cond.clone(), x.clone(), y.clone()],
            AluArg::None,
        )
    }

    pub fn cast(&self, dtype: DType) -> AluExp {
        if self.dtype() == dtype {
            return self.clone();
        }
        AluExp::new(AluOp::Cast, dtype, vec![self.clone()], AluArg::None)
    }

    // ---- traversal ----

    /// Post-order gather of all distinct nodes matching `pred`.
    pub fn collect(&self, pred: &dyn Fn(&AluExp) -> bool) -> Vec<AluExp> {
        let mut seen = HashMap::new();
        let mut out = Vec::new();
        self.collect_into(pred, &mut seen, &mut out);
        out
    }

    fn collect_into(
        &self,
        pred: &dyn Fn(&AluExp) -> bool,
        seen: &mut HashMap<*const AluNode, ()>,
        out: &mut Vec<AluExp>,
    ) {
        if seen.insert(self.key(), ()).is_some() {
            return;
        }
        for child in self.src() {
            child.collect_into(pred, seen, out);
        }
        if pred(self) {
            out.push(self.clone());
        }
    }

    /// Bottom-up term rewriting. Children are rewritten first; `f` then sees
    /// the rebuilt node and may replace it. Shared nodes are rewritten once.
    pub fn rewrite(&self, f: &mut dyn FnMut(&AluExp) -> Option<AluExp>) -> AluExp {
        let mut memo: HashMap<*const AluNode, AluExp> = HashMap::new();
        self.rewrite_memo(f, &mut memo)
    }

    fn rewrite_memo(
        &self,
        f: &mut dyn FnMut(&AluExp) -> Option<AluExp>,
        memo: &mut HashMap<*const AluNode, AluExp>,
    ) -> AluExp {
        if let Some(done) = memo.get(&self.key()) {
            return done.clone();
        }
        let mut changed = false;
        let src: Vec<AluExp> = self
            .src()
            .iter()
            .map(|c| {
                let r = c.rewrite_memo(f, memo);
                changed |= r != *c;
                r
            })
            .collect();
        let node = if changed {
            AluExp::new(self.op(), self.dtype(), src, self.arg().clone())
        } else {
            self.clone()
        };
        let out = f(&node).unwrap_or(node);
        memo.insert(self.key(), out.clone());
        out
    }

    /// Replace named specials with sub-expressions.
    pub fn substitute(&self, map: &HashMap<SpecialKind, AluExp>) -> AluExp {
        self.rewrite(&mut |e| {
            let (kind, _) = e.as_special()?;
            map.get(&kind).cloned()
        })
    }

    /// All distinct specials appearing in the expression.
    pub fn specials(&self) -> Vec<(SpecialKind, usize)> {
        let mut out: Vec<(SpecialKind, usize)> = self
            .collect(&|e| e.as_special().is_some())
            .iter()
            .filter_map(|e| e.as_special())
            .collect();
        out.sort_by_key(|&(k, s)| (k.index(), s));
        out.dedup();
        out
    }

    /// Highest input id referenced, if any; `num_inputs` is that plus one.
    pub fn max_gid(&self) -> Option<usize> {
        self.collect(&|e| matches!(e.op(), AluOp::GlobalIndex | AluOp::GlobalView))
            .iter()
            .filter_map(|e| match e.arg() {
                AluArg::Global { gid } => Some(*gid),
                AluArg::View { gid, .. } => Some(*gid),
                _ => None,
            })
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality_and_hash() {
        let a = AluExp::gidx(8).add(&AluExp::const_i32(1));
        let b = AluExp::gidx(8).add(&AluExp::const_i32(1));
        assert_eq!(a, b);
        assert_eq!(a.hash64(), b.hash64());
        let c = AluExp::gidx(8).add(&AluExp::const_i32(2));
        assert_ne!(a, c);
    }

    #[test]
    #[should_panic(expected = "operands must match")]
    fn test_dtype_mismatch_panics() {
        let _ = AluExp::const_i32(1).add(&AluExp::const_of(DType::F32, 1.0));
    }

    #[test]
    #[should_panic(expected = "children")]
    fn test_arity_violation_panics() {
        let _ = AluExp::new(AluOp::Add, DType::I32, vec![AluExp::const_i32(1)], AluArg::None);
    }

    #[test]
    fn test_collect_postorder() {
        let x = AluExp::gidx(4);
        let e = x.add(&AluExp::const_i32(3)).mul(&x);
        let consts = e.collect(&|n| n.as_const().is_some());
        assert_eq!(consts.len(), 1);
        let all = e.collect(&|_| true);
        // gidx, 3, add, mul — the shared gidx is visited once.
        assert_eq!(all.len(), 4);
        assert_eq!(all[all.len() - 1], e);
    }

    #[test]
    fn test_substitute_replaces_specials() {
        let e = AluExp::gidx(8).mul(&AluExp::const_i32(2));
        let mut map = HashMap::new();
        map.insert(SpecialKind::Gidx, AluExp::const_i32(3));
        let r = e.substitute(&map).simplify();
        assert_eq!(r.as_const(), Some(Scalar::I32(6)));
    }

    #[test]
    fn test_rewrite_bottom_up() {
        let e = AluExp::const_i32(1).add(&AluExp::const_i32(2));
        let r = e.rewrite(&mut |n| {
            n.as_const().map(|s| AluExp::constant(Scalar::I32(s.to_i64() as i32 * 10)))
        });
        // Leaves are rewritten before the parent is folded.
        let folded = r.simplify();
        assert_eq!(folded.as_const(), Some(Scalar::I32(30)));
    }

    #[test]
    fn test_specials_listing() {
        let e = AluExp::gidx(8).add(&AluExp::ridx(4));
        let sp = e.specials();
        assert_eq!(
            sp,
            vec![(SpecialKind::Gidx, 8), (SpecialKind::Ridx, 4)]
        );
    }
}
