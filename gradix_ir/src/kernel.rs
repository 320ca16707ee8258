//! Kernel bundles: a fused single-output computation plus an optional
//! reduction descriptor.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use crate::alu::{scalar_binary, AluExp, AluOp};
use crate::dtype::{DType, Scalar};

/// Combining operation of a reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

impl ReduceOp {
    /// Identity element; also the value of a reduction over an empty axis.
    pub fn identity(self, dtype: DType) -> Scalar {
        match self {
            ReduceOp::Sum => Scalar::zero(dtype),
            ReduceOp::Prod => Scalar::one(dtype),
            ReduceOp::Min => match dtype {
                DType::Bool => Scalar::Bool(true),
                DType::I32 => Scalar::I32(i32::MAX),
                DType::U32 => Scalar::U32(u32::MAX),
                DType::F16 => Scalar::F16(half::f16::INFINITY),
                DType::F32 => Scalar::F32(f32::INFINITY),
                DType::F64 => Scalar::F64(f64::INFINITY),
            },
            ReduceOp::Max => match dtype {
                DType::Bool => Scalar::Bool(false),
                DType::I32 => Scalar::I32(i32::MIN),
                DType::U32 => Scalar::U32(0),
                DType::F16 => Scalar::F16(half::f16::NEG_INFINITY),
                DType::F32 => Scalar::F32(f32::NEG_INFINITY),
                DType::F64 => Scalar::F64(f64::NEG_INFINITY),
            },
        }
    }

    pub fn combine(self, acc: Scalar, x: Scalar) -> Scalar {
        let op = match self {
            ReduceOp::Sum => AluOp::Add,
            ReduceOp::Prod => AluOp::Mul,
            ReduceOp::Min => AluOp::Min,
            ReduceOp::Max => AluOp::Max,
        };
        if acc.dtype() == DType::Bool {
            // Bool reductions are logical: sum = any, prod/min = all, max = any.
            let (a, b) = (acc.to_bool(), x.to_bool());
            return Scalar::Bool(match self {
                ReduceOp::Sum | ReduceOp::Max => a | b,
                ReduceOp::Prod | ReduceOp::Min => a & b,
            });
        }
        scalar_binary(op, acc, x)
    }

    /// ALU expression combining `acc` with `x`.
    pub fn combine_alu(self, acc: &AluExp, x: &AluExp) -> AluExp {
        match self {
            ReduceOp::Sum => acc.add(x),
            ReduceOp::Prod => acc.mul(x),
            ReduceOp::Min => acc.min_(x),
            ReduceOp::Max => acc.max_(x),
        }
    }
}

/// Reduction descriptor: fold `size` elements per output with `op`, then
/// apply the optional epilogue over the `acc` special.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub op: ReduceOp,
    pub size: usize,
    pub fusion: Option<AluExp>,
}

/// A fused computation producing one output element per index in
/// `0..size`. `exp` may read `ridx` when a reduction is present.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub num_inputs: usize,
    pub size: usize,
    pub exp: AluExp,
    pub reduction: Option<Reduction>,
}

impl Kernel {
    pub fn elementwise(num_inputs: usize, size: usize, exp: AluExp) -> Kernel {
        Kernel {
            num_inputs,
            size,
            exp,
            reduction: None,
        }
    }

    /// Output element dtype (the epilogue may change it).
    pub fn dtype(&self) -> DType {
        match &self.reduction {
            Some(r) => r.fusion.as_ref().map_or(self.exp.dtype(), |f| f.dtype()),
            None => self.exp.dtype(),
        }
    }

    /// Content hash for executable caching: equal kernels compile once.
    pub fn cache_key(&self) -> u64 {
        let mut h = DefaultHasher::new();
        h.write_u64(self.num_inputs as u64);
        h.write_u64(self.size as u64);
        h.write_u64(self.exp.hash64());
        match &self.reduction {
            None => h.write_u8(0),
            Some(r) => {
                h.write_u8(1 + r.op as u8);
                h.write_u64(r.size as u64);
                h.write_u64(r.fusion.as_ref().map_or(0, |f| f.hash64()));
            }
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities() {
        assert_eq!(ReduceOp::Sum.identity(DType::F32), Scalar::F32(0.0));
        assert_eq!(ReduceOp::Prod.identity(DType::I32), Scalar::I32(1));
        assert_eq!(ReduceOp::Min.identity(DType::I32), Scalar::I32(i32::MAX));
        assert_eq!(ReduceOp::Max.identity(DType::F32), Scalar::F32(f32::NEG_INFINITY));
    }

    #[test]
    fn test_combine_matches_op() {
        let a = Scalar::I32(3);
        let b = Scalar::I32(5);
        assert_eq!(ReduceOp::Sum.combine(a, b), Scalar::I32(8));
        assert_eq!(ReduceOp::Prod.combine(a, b), Scalar::I32(15));
        assert_eq!(ReduceOp::Min.combine(a, b), Scalar::I32(3));
        assert_eq!(ReduceOp::Max.combine(a, b), Scalar::I32(5));
    }

    #[test]
    fn test_cache_key_stability() {
        let exp = AluExp::gidx(8).cast(crate::dtype::DType::F32);
        let k1 = Kernel::elementwise(0, 8, exp.clone());
        let k2 = Kernel::elementwise(0, 8, exp);
        assert_eq!(k1.cache_key(), k2.cache_key());
        let k3 = Kernel::elementwise(0, 4, k1.exp.clone());
        assert_ne!(k1.cache_key(), k3.cache_key());
    }
}
