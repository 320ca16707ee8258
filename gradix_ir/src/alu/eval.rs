//! Tree-walk evaluation of ALU expressions over [`Scalar`] values.
//!
//! Used by the reference backend and by constant folding in the simplifier.
//! Float math follows IEEE-754 (0/0 is NaN, not an error); integer division
//! and remainder by zero yield 0 so that masked-out lanes can never trap.

use half::f16;

use super::{AluExp, AluOp, SpecialKind};
use crate::dtype::{DType, Scalar};

/// Source of values for `GlobalIndex`/`GlobalView` reads.
pub trait GlobalRead {
    fn load(&self, gid: usize, index: i64, dtype: DType) -> Scalar;
}

/// Evaluation context for expressions that read no inputs.
#[derive(Debug, Clone, Copy)]
pub struct NoGlobals;

impl GlobalRead for NoGlobals {
    fn load(&self, gid: usize, _index: i64, _dtype: DType) -> Scalar {
        panic!("expression reads input {} but no globals were provided", gid)
    }
}

/// Bindings for specials plus the global reader.
pub struct EvalCtx<'a> {
    specials: [Option<Scalar>; SpecialKind::COUNT],
    globals: &'a dyn GlobalRead,
}

impl std::fmt::Debug for EvalCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalCtx").field("specials", &self.specials).finish()
    }
}

impl<'a> EvalCtx<'a> {
    pub fn new(globals: &'a dyn GlobalRead) -> EvalCtx<'a> {
        EvalCtx {
            specials: [None; SpecialKind::COUNT],
            globals,
        }
    }

    pub fn set(&mut self, kind: SpecialKind, value: Scalar) -> &mut Self {
        self.specials[kind.index()] = Some(value);
        self
    }

    pub fn set_index(&mut self, kind: SpecialKind, value: i64) -> &mut Self {
        self.set(kind, Scalar::I32(value as i32))
    }

    fn get(&self, kind: SpecialKind) -> Option<Scalar> {
        self.specials[kind.index()]
    }
}

impl AluExp {
    /// Evaluate the expression. A special without a binding is a fatal usage
    /// error and panics.
    pub fn evaluate(&self, ctx: &EvalCtx<'_>) -> Scalar {
        match self.op() {
            AluOp::Const => self.as_const().unwrap_or_else(|| unreachable!()),
            AluOp::Special => {
                let (kind, _) = self.as_special().unwrap_or_else(|| unreachable!());
                ctx.get(kind)
                    .unwrap_or_else(|| panic!("missing value for special `{}`", kind.name()))
            }
            AluOp::GlobalIndex => {
                let idx = self.src()[0].evaluate(ctx).to_i64();
                match self.arg() {
                    super::AluArg::Global { gid } => ctx.globals.load(*gid, idx, self.dtype()),
                    _ => unreachable!(),
                }
            }
            AluOp::GlobalView => {
                let idxs: Vec<i64> = self.src().iter().map(|i| i.evaluate(ctx).to_i64()).collect();
                match self.arg() {
                    super::AluArg::View { gid, tracker } => {
                        let (off, valid) = tracker.offset_of(&idxs);
                        if valid {
                            ctx.globals.load(*gid, off, self.dtype())
                        } else {
                            Scalar::zero(self.dtype())
                        }
                    }
                    _ => unreachable!(),
                }
            }
            AluOp::Where => {
                if self.src()[0].evaluate(ctx).to_bool() {
                    self.src()[1].evaluate(ctx)
                } else {
                    self.src()[2].evaluate(ctx)
                }
            }
            AluOp::Cast => self.src()[0].evaluate(ctx).cast(self.dtype()),
            op if op.is_comparison() => Scalar::Bool(scalar_compare(
                op,
                self.src()[0].evaluate(ctx),
                self.src()[1].evaluate(ctx),
            )),
            op if op.is_binary() => {
                scalar_binary(op, self.src()[0].evaluate(ctx), self.src()[1].evaluate(ctx))
            }
            op if op.is_unary() => scalar_unary(op, self.src()[0].evaluate(ctx)),
            op => panic!("cannot evaluate {:?}", op),
        }
    }
}

fn i32_pow(base: i32, e: i32) -> i32 {
    match e {
        e if e >= 0 => base.wrapping_pow(e as u32),
        _ if base == 1 => 1,
        _ if base == -1 => {
            if e % 2 == 0 {
                1
            } else {
                -1
            }
        }
        _ => 0,
    }
}

fn f64_binary(op: AluOp, a: f64, b: f64) -> f64 {
    match op {
        AluOp::Add => a + b,
        AluOp::Sub => a - b,
        AluOp::Mul => a * b,
        AluOp::Div => a / b,
        AluOp::IDiv => (a / b).floor(),
        AluOp::Mod => a % b,
        AluOp::Min => a.min(b),
        AluOp::Max => a.max(b),
        AluOp::Pow => a.powf(b),
        _ => unreachable!(),
    }
}

/// Apply a binary arithmetic op. Operand dtypes are already equal by IR
/// construction.
pub fn scalar_binary(op: AluOp, a: Scalar, b: Scalar) -> Scalar {
    match (a, b) {
        (Scalar::I32(x), Scalar::I32(y)) => Scalar::I32(match op {
            AluOp::Add => x.wrapping_add(y),
            AluOp::Sub => x.wrapping_sub(y),
            AluOp::Mul => x.wrapping_mul(y),
            AluOp::Div | AluOp::IDiv => {
                if y == 0 {
                    0
                } else {
                    x.wrapping_div(y)
                }
            }
            AluOp::Mod => {
                if y == 0 {
                    0
                } else {
                    x.wrapping_rem(y)
                }
            }
            AluOp::Min => x.min(y),
            AluOp::Max => x.max(y),
            AluOp::Pow => i32_pow(x, y),
            _ => unreachable!(),
        }),
        (Scalar::U32(x), Scalar::U32(y)) => Scalar::U32(match op {
            AluOp::Add => x.wrapping_add(y),
            AluOp::Sub => x.wrapping_sub(y),
            AluOp::Mul => x.wrapping_mul(y),
            AluOp::Div | AluOp::IDiv => {
                if y == 0 {
                    0
                } else {
                    x / y
                }
            }
            AluOp::Mod => {
                if y == 0 {
                    0
                } else {
                    x % y
                }
            }
            AluOp::Min => x.min(y),
            AluOp::Max => x.max(y),
            AluOp::Pow => x.wrapping_pow(y),
            _ => unreachable!(),
        }),
        (Scalar::F64(x), Scalar::F64(y)) => Scalar::F64(f64_binary(op, x, y)),
        (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32(match op {
            AluOp::Add => x + y,
            AluOp::Sub => x - y,
            AluOp::Mul => x * y,
            AluOp::Div => x / y,
            AluOp::IDiv => (x / y).floor(),
            AluOp::Mod => x % y,
            AluOp::Min => x.min(y),
            AluOp::Max => x.max(y),
            AluOp::Pow => x.powf(y),
            _ => unreachable!(),
        }),
        (Scalar::F16(x), Scalar::F16(y)) => {
            let r = f64_binary(op, x.to_f64(), y.to_f64());
            Scalar::F16(f16::from_f64(r))
        }
        (a, b) => panic!("no {:?} for {} and {}", op, a.dtype(), b.dtype()),
    }
}

fn f64_unary(op: AluOp, x: f64) -> f64 {
    match op {
        AluOp::Neg => -x,
        AluOp::Recip => 1.0 / x,
        AluOp::Exp => x.exp(),
        AluOp::Log => x.ln(),
        AluOp::Sin => x.sin(),
        AluOp::Cos => x.cos(),
        AluOp::Tan => x.tan(),
        AluOp::Atan => x.atan(),
        AluOp::Asin => x.asin(),
        AluOp::Sqrt => x.sqrt(),
        AluOp::Abs => x.abs(),
        AluOp::Erf => erf(x),
        AluOp::Erfc => erfc(x),
        _ => unreachable!(),
    }
}

/// Apply a unary op.
pub fn scalar_unary(op: AluOp, a: Scalar) -> Scalar {
    match a {
        Scalar::I32(x) => Scalar::I32(match op {
            AluOp::Neg => x.wrapping_neg(),
            AluOp::Abs => x.wrapping_abs(),
            _ => panic!("no {:?} for i32", op),
        }),
        Scalar::U32(x) => Scalar::U32(match op {
            AluOp::Abs => x,
            _ => panic!("no {:?} for u32", op),
        }),
        Scalar::F64(x) => Scalar::F64(f64_unary(op, x)),
        Scalar::F32(x) => Scalar::F32(f64_unary(op, x as f64) as f32),
        Scalar::F16(x) => Scalar::F16(f16::from_f64(f64_unary(op, x.to_f64()))),
        Scalar::Bool(_) => panic!("no {:?} for bool", op),
    }
}

/// Apply a comparison. NaN compares false except through `Ne`.
pub fn scalar_compare(op: AluOp, a: Scalar, b: Scalar) -> bool {
    let ord = match (a, b) {
        (Scalar::Bool(x), Scalar::Bool(y)) => x.partial_cmp(&y),
        (Scalar::I32(x), Scalar::I32(y)) => x.partial_cmp(&y),
        (Scalar::U32(x), Scalar::U32(y)) => x.partial_cmp(&y),
        (Scalar::F16(x), Scalar::F16(y)) => x.to_f64().partial_cmp(&y.to_f64()),
        (Scalar::F32(x), Scalar::F32(y)) => x.partial_cmp(&y),
        (Scalar::F64(x), Scalar::F64(y)) => x.partial_cmp(&y),
        (a, b) => panic!("no {:?} for {} and {}", op, a.dtype(), b.dtype()),
    };
    match (op, ord) {
        (AluOp::Ne, None) => true,
        (_, None) => false,
        (AluOp::Eq, Some(o)) => o == std::cmp::Ordering::Equal,
        (AluOp::Ne, Some(o)) => o != std::cmp::Ordering::Equal,
        (AluOp::Lt, Some(o)) => o == std::cmp::Ordering::Less,
        (AluOp::Le, Some(o)) => o != std::cmp::Ordering::Greater,
        (AluOp::Gt, Some(o)) => o == std::cmp::Ordering::Greater,
        (AluOp::Ge, Some(o)) => o != std::cmp::Ordering::Less,
        _ => unreachable!(),
    }
}

/// Error function, Abramowitz & Stegun 7.1.26. Absolute error below 1.5e-7,
/// which dominates the f32 surface this library exposes.
pub fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

pub fn erfc(x: f64) -> f64 {
    1.0 - erf(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alu::AluExp;

    #[test]
    fn test_evaluate_constant_expression() {
        let e = AluExp::const_i32(3).mul(&AluExp::const_i32(4)).add(&AluExp::const_i32(5));
        let ctx = EvalCtx::new(&NoGlobals);
        assert_eq!(e.evaluate(&ctx), Scalar::I32(17));
    }

    #[test]
    fn test_evaluate_specials() {
        let e = AluExp::gidx(8).add(&AluExp::ridx(4));
        let mut ctx = EvalCtx::new(&NoGlobals);
        ctx.set_index(SpecialKind::Gidx, 5).set_index(SpecialKind::Ridx, 2);
        assert_eq!(e.evaluate(&ctx), Scalar::I32(7));
    }

    #[test]
    #[should_panic(expected = "missing value for special")]
    fn test_evaluate_missing_special_panics() {
        let e = AluExp::gidx(8);
        let ctx = EvalCtx::new(&NoGlobals);
        let _ = e.evaluate(&ctx);
    }

    #[test]
    fn test_where_short_circuits() {
        let cond = AluExp::const_bool(false);
        let e = AluExp::select(&cond, &AluExp::const_i32(1), &AluExp::const_i32(2));
        assert_eq!(e.evaluate(&EvalCtx::new(&NoGlobals)), Scalar::I32(2));
    }

    #[test]
    fn test_float_division_by_zero_is_ieee() {
        let z = AluExp::const_of(DType::F32, 0.0);
        let nan = z.div(&z).evaluate(&EvalCtx::new(&NoGlobals));
        assert!(nan.is_nan());
    }

    #[test]
    fn test_int_division_by_zero_is_zero() {
        let e = AluExp::const_i32(7).idiv(&AluExp::const_i32(0));
        assert_eq!(e.evaluate(&EvalCtx::new(&NoGlobals)), Scalar::I32(0));
    }

    #[test]
    fn test_erf_reference_values() {
        assert!((erf(0.0)).abs() < 1e-12);
        assert!((erf(1.0) - 0.8427007929497149).abs() < 1.5e-7);
        assert!((erf(-1.0) + 0.8427007929497149).abs() < 1.5e-7);
        assert!((erfc(2.0) - 0.004677734981063127).abs() < 1.5e-7);
    }

    #[test]
    fn test_nan_comparisons() {
        let nan = Scalar::F32(f32::NAN);
        assert!(!scalar_compare(AluOp::Eq, nan, nan));
        assert!(scalar_compare(AluOp::Ne, nan, nan));
        assert!(!scalar_compare(AluOp::Lt, nan, Scalar::F32(1.0)));
    }
}
