//! Algebraic simplification of ALU expressions.
//!
//! `simplify` rewrites bottom-up to a fixed point: constant folding,
//! identity laws, commutative canonicalization (constants to the right,
//! otherwise ordered by content hash so structural equality exposes common
//! subexpressions), and the integer rewrites the indexing math relies on
//! (factor extraction, mod/div elimination for bounded expressions).

use super::eval::EvalCtx;
use super::{AluExp, AluOp, NoGlobals, SpecialKind};
use crate::dtype::Scalar;

impl AluExp {
    pub fn simplify(&self) -> AluExp {
        let mut cur = self.clone();
        loop {
            let next = cur.rewrite(&mut simplify_node);
            if next == cur {
                return cur;
            }
            cur = next;
        }
    }
}

fn is_const_value(e: &AluExp, v: f64) -> bool {
    e.as_const().is_some_and(|s| !s.is_nan() && s.to_f64() == v)
}

/// Conservative integer interval analysis. Specials carry their extent, so
/// index expressions built from them usually have known bounds.
fn bounds(e: &AluExp) -> Option<(i64, i64)> {
    if !e.dtype().is_int() {
        return None;
    }
    match e.op() {
        AluOp::Const => {
            let v = e.as_const()?.to_i64();
            Some((v, v))
        }
        AluOp::Special => {
            let (kind, size) = e.as_special()?;
            match kind {
                SpecialKind::Acc => None,
                _ if size > 0 => Some((0, size as i64 - 1)),
                _ => None,
            }
        }
        AluOp::Add => {
            let (a0, a1) = bounds(&e.src()[0])?;
            let (b0, b1) = bounds(&e.src()[1])?;
            Some((a0.checked_add(b0)?, a1.checked_add(b1)?))
        }
        AluOp::Sub => {
            let (a0, a1) = bounds(&e.src()[0])?;
            let (b0, b1) = bounds(&e.src()[1])?;
            Some((a0.checked_sub(b1)?, a1.checked_sub(b0)?))
        }
        AluOp::Mul => {
            let (a0, a1) = bounds(&e.src()[0])?;
            let (b0, b1) = bounds(&e.src()[1])?;
            let corners = [
                a0.checked_mul(b0)?,
                a0.checked_mul(b1)?,
                a1.checked_mul(b0)?,
                a1.checked_mul(b1)?,
            ];
            Some((*corners.iter().min()?, *corners.iter().max()?))
        }
        AluOp::Neg => {
            let (a0, a1) = bounds(&e.src()[0])?;
            Some((-a1, -a0))
        }
        AluOp::Mod => {
            let n = e.src()[1].as_const()?.to_i64();
            let (lo, _) = bounds(&e.src()[0])?;
            if n > 0 && lo >= 0 {
                Some((0, n - 1))
            } else {
                None
            }
        }
        AluOp::IDiv => {
            let n = e.src()[1].as_const()?.to_i64();
            let (lo, hi) = bounds(&e.src()[0])?;
            if n > 0 && lo >= 0 {
                Some((lo / n, hi / n))
            } else {
                None
            }
        }
        AluOp::Min => {
            let (a0, a1) = bounds(&e.src()[0])?;
            let (b0, b1) = bounds(&e.src()[1])?;
            Some((a0.min(b0), a1.min(b1)))
        }
        AluOp::Max => {
            let (a0, a1) = bounds(&e.src()[0])?;
            let (b0, b1) = bounds(&e.src()[1])?;
            Some((a0.max(b0), a1.max(b1)))
        }
        AluOp::Where => {
            let (a0, a1) = bounds(&e.src()[1])?;
            let (b0, b1) = bounds(&e.src()[2])?;
            Some((a0.min(b0), a1.max(b1)))
        }
        _ => None,
    }
}

fn fold_constants(e: &AluExp) -> Option<AluExp> {
    match e.op() {
        AluOp::Const | AluOp::Special | AluOp::GlobalIndex | AluOp::GlobalView => None,
        // A constant condition folds even when the branches do not.
        AluOp::Where => match e.src()[0].as_const() {
            Some(Scalar::Bool(true)) => Some(e.src()[1].clone()),
            Some(Scalar::Bool(false)) => Some(e.src()[2].clone()),
            _ => None,
        },
        _ if e.src().iter().all(|c| c.as_const().is_some()) => {
            let ctx = EvalCtx::new(&NoGlobals);
            Some(AluExp::constant(e.evaluate(&ctx)))
        }
        _ => None,
    }
}

fn simplify_node(e: &AluExp) -> Option<AluExp> {
    if let Some(folded) = fold_constants(e) {
        return Some(folded);
    }
    let src = e.src();
    match e.op() {
        AluOp::Add => {
            if is_const_value(&src[1], 0.0) {
                return Some(src[0].clone());
            }
            if is_const_value(&src[0], 0.0) {
                return Some(src[1].clone());
            }
            // (x + c1) + c2 -> x + (c1 + c2)
            if let (AluOp::Add, Some(_)) = (src[0].op(), src[1].as_const()) {
                if src[0].src()[1].as_const().is_some() {
                    let folded = src[0].src()[1].add(&src[1]);
                    return Some(src[0].src()[0].add(&folded));
                }
            }
            // a*k + b*k -> (a + b)*k for integer index math
            if e.dtype().is_int() && src[0].op() == AluOp::Mul && src[1].op() == AluOp::Mul {
                let (al, ar) = (&src[0].src()[0], &src[0].src()[1]);
                let (bl, br) = (&src[1].src()[0], &src[1].src()[1]);
                for (a, k1, b, k2) in [
                    (al, ar, bl, br),
                    (al, ar, br, bl),
                    (ar, al, bl, br),
                    (ar, al, br, bl),
                ] {
                    if k1 == k2 {
                        return Some(a.add(b).mul(k1));
                    }
                }
            }
            canonicalize(e)
        }
        AluOp::Sub => {
            if is_const_value(&src[1], 0.0) {
                return Some(src[0].clone());
            }
            if src[0] == src[1] {
                return Some(AluExp::constant(Scalar::zero(e.dtype())));
            }
            None
        }
        AluOp::Mul => {
            if is_const_value(&src[1], 1.0) {
                return Some(src[0].clone());
            }
            if is_const_value(&src[0], 1.0) {
                return Some(src[1].clone());
            }
            if is_const_value(&src[0], 0.0) || is_const_value(&src[1], 0.0) {
                return Some(AluExp::constant(Scalar::zero(e.dtype())));
            }
            canonicalize(e)
        }
        AluOp::Div => {
            if is_const_value(&src[1], 1.0) {
                return Some(src[0].clone());
            }
            None
        }
        AluOp::IDiv => {
            if is_const_value(&src[1], 1.0) {
                return Some(src[0].clone());
            }
            if let (Some((lo, hi)), Some(n)) = (bounds(&src[0]), src[1].as_const()) {
                let n = n.to_i64();
                if n > 0 && lo >= 0 && hi < n {
                    return Some(AluExp::constant(Scalar::zero(e.dtype())));
                }
            }
            None
        }
        AluOp::Mod => {
            if is_const_value(&src[1], 1.0) {
                return Some(AluExp::constant(Scalar::zero(e.dtype())));
            }
            if let (Some((lo, hi)), Some(n)) = (bounds(&src[0]), src[1].as_const()) {
                let n = n.to_i64();
                if n > 0 && lo >= 0 && hi < n {
                    return Some(src[0].clone());
                }
            }
            None
        }
        AluOp::Min | AluOp::Max => {
            if src[0] == src[1] {
                return Some(src[0].clone());
            }
            canonicalize(e)
        }
        AluOp::Neg => {
            if src[0].op() == AluOp::Neg {
                return Some(src[0].src()[0].clone());
            }
            None
        }
        AluOp::Cast => {
            let inner = &src[0];
            if inner.dtype() == e.dtype() {
                return Some(inner.clone());
            }
            // cast(cast(x)) collapses when the inner cast is lossless.
            if inner.op() == AluOp::Cast {
                let base = &inner.src()[0];
                if base.dtype().lossless_into(inner.dtype()) {
                    return Some(base.cast(e.dtype()));
                }
            }
            None
        }
        AluOp::Where => {
            if src[1] == src[2] {
                return Some(src[1].clone());
            }
            // Flatten nested selects that test the same condition.
            if src[1].op() == AluOp::Where && src[1].src()[0] == src[0] {
                return Some(AluExp::select(&src[0], &src[1].src()[1], &src[2]));
            }
            if src[2].op() == AluOp::Where && src[2].src()[0] == src[0] {
                return Some(AluExp::select(&src[0], &src[1], &src[2].src()[2]));
            }
            None
        }
        AluOp::Eq => {
            if !src[0].dtype().is_float() && src[0] == src[1] {
                return Some(AluExp::const_bool(true));
            }
            canonicalize(e)
        }
        AluOp::Ne => {
            if !src[0].dtype().is_float() && src[0] == src[1] {
                return Some(AluExp::const_bool(false));
            }
            canonicalize(e)
        }
        _ => None,
    }
}

/// Order commutative operands: constants to the right, otherwise ascending
/// by content hash. Returns None when already canonical.
fn canonicalize(e: &AluExp) -> Option<AluExp> {
    debug_assert!(e.op().is_commutative());
    let (a, b) = (&e.src()[0], &e.src()[1]);
    let swap = if a.as_const().is_some() && b.as_const().is_none() {
        true
    } else if b.as_const().is_some() {
        false
    } else {
        a.hash64() > b.hash64()
    };
    if !swap {
        return None;
    }
    Some(AluExp::new(
        e.op(),
        e.dtype(),
        vec![b.clone(), a.clone()],
        e.arg().clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn gidx8() -> AluExp {
        AluExp::gidx(8)
    }

    #[test]
    fn test_fold_where_with_constant_condition() {
        let e = AluExp::select(&AluExp::const_bool(true), &gidx8(), &AluExp::const_i32(0));
        assert_eq!(e.simplify(), gidx8());
    }

    #[test]
    fn test_add_zero_and_mul_one() {
        let x = gidx8();
        assert_eq!(x.add(&AluExp::const_i32(0)).simplify(), x);
        assert_eq!(x.mul(&AluExp::const_i32(1)).simplify(), x);
        assert_eq!(
            x.mul(&AluExp::const_i32(0)).simplify().as_const(),
            Some(Scalar::I32(0))
        );
    }

    #[test]
    fn test_sub_self_is_zero() {
        let x = gidx8();
        assert_eq!(x.sub(&x).simplify().as_const(), Some(Scalar::I32(0)));
    }

    #[test]
    fn test_mod_of_bounded_expression_vanishes() {
        // gidx in [0, 8): gidx % 8 -> gidx, gidx / 8 -> 0
        let x = gidx8();
        assert_eq!(x.rem(&AluExp::const_i32(8)).simplify(), x);
        assert_eq!(
            x.idiv(&AluExp::const_i32(8)).simplify().as_const(),
            Some(Scalar::I32(0))
        );
        // but gidx % 4 must survive
        let kept = x.rem(&AluExp::const_i32(4)).simplify();
        assert_eq!(kept.op(), AluOp::Mod);
    }

    #[test]
    fn test_unflatten_flatten_collapses() {
        // (gidx / 4) * 4 + gidx % 4 has the same bounds as gidx but is not
        // syntactically collapsed; the pieces however simplify individually.
        let x = AluExp::gidx(4);
        let flat = x.idiv(&AluExp::const_i32(1)).rem(&AluExp::const_i32(4));
        assert_eq!(flat.simplify(), x);
    }

    #[test]
    fn test_factor_extraction() {
        let a = AluExp::gidx(8);
        let b = AluExp::ridx(8);
        let k = AluExp::const_i32(16);
        let e = a.mul(&k).add(&b.mul(&k));
        let s = e.simplify();
        assert_eq!(s.op(), AluOp::Mul);
        assert_eq!(s.src()[1].as_const(), Some(Scalar::I32(16)));
    }

    #[test]
    fn test_cast_collapse() {
        let x = AluExp::const_of(DType::F16, 1.5);
        let e = AluExp::new(
            super::super::AluOp::Cast,
            DType::F64,
            vec![AluExp::new(
                super::super::AluOp::Cast,
                DType::F32,
                vec![AluExp::gidx(4).cast(DType::F16)],
                super::super::AluArg::None,
            )],
            super::super::AluArg::None,
        );
        // f16 -> f32 is lossless, so the chain collapses to f16 -> f64.
        let s = e.simplify();
        assert_eq!(s.op(), AluOp::Cast);
        assert_eq!(s.dtype(), DType::F64);
        assert_eq!(s.src()[0].dtype(), DType::F16);
        // and constants fold straight through
        assert_eq!(
            x.cast(DType::F32).cast(DType::F64).simplify().as_const(),
            Some(Scalar::F64(1.5))
        );
    }

    #[test]
    fn test_double_negation() {
        let x = AluExp::const_of(DType::F32, 0.0).add(&AluExp::gidx(4).cast(DType::F32));
        assert_eq!(x.neg().neg().simplify(), x.simplify());
    }

    #[test]
    fn test_commutative_canonicalization_exposes_sharing() {
        let a = AluExp::gidx(8);
        let b = AluExp::ridx(8);
        let ab = a.add(&b).simplify();
        let ba = b.add(&a).simplify();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_constant_reassociation() {
        let x = gidx8();
        let e = x.add(&AluExp::const_i32(3)).add(&AluExp::const_i32(4));
        let s = e.simplify();
        assert_eq!(s.op(), AluOp::Add);
        assert_eq!(s.src()[1].as_const(), Some(Scalar::I32(7)));
    }

    #[test]
    fn test_nested_where_flattening() {
        let c = AluExp::gidx(2).eq_(&AluExp::const_i32(0));
        let inner = AluExp::select(&c, &AluExp::const_i32(1), &AluExp::const_i32(2));
        let outer = AluExp::select(&c, &inner, &AluExp::const_i32(3)).simplify();
        // where(c, where(c, 1, 2), 3) -> where(c, 1, 3)
        assert_eq!(outer.src()[1].as_const(), Some(Scalar::I32(1)));
        assert_eq!(outer.src()[2].as_const(), Some(Scalar::I32(3)));
    }
}
