//! Primitive element types and tagged scalar values.

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

/// Element type of a buffer or ALU expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I32,
    U32,
    F16,
    F32,
    F64,
}

impl DType {
    pub const ALL: [DType; 6] = [
        DType::Bool,
        DType::I32,
        DType::U32,
        DType::F16,
        DType::F32,
        DType::F64,
    ];

    /// Storage size of one element in bytes. Bool is stored as one byte.
    pub fn size_of(self) -> usize {
        match self {
            DType::Bool => 1,
            DType::F16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    pub fn is_int(self) -> bool {
        matches!(self, DType::I32 | DType::U32)
    }

    pub fn is_signed(self) -> bool {
        !matches!(self, DType::Bool | DType::U32)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// True when every value of `self` survives a round trip through `other`.
    pub fn lossless_into(self, other: DType) -> bool {
        match self {
            DType::Bool => true,
            DType::I32 => matches!(other, DType::I32 | DType::F64),
            DType::U32 => matches!(other, DType::U32 | DType::F64),
            DType::F16 => matches!(other, DType::F16 | DType::F32 | DType::F64),
            DType::F32 => matches!(other, DType::F32 | DType::F64),
            DType::F64 => matches!(other, DType::F64),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single scalar value, tagged with its dtype.
///
/// Used for constants in the ALU IR, for the tree-walk evaluator, and for
/// host readback. Casting follows Rust `as` semantics (truncation on
/// float-to-int, wrapping on int-to-int).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    I32(i32),
    U32(u32),
    F16(f16),
    F32(f32),
    F64(f64),
}

impl Scalar {
    pub fn dtype(self) -> DType {
        match self {
            Scalar::Bool(_) => DType::Bool,
            Scalar::I32(_) => DType::I32,
            Scalar::U32(_) => DType::U32,
            Scalar::F16(_) => DType::F16,
            Scalar::F32(_) => DType::F32,
            Scalar::F64(_) => DType::F64,
        }
    }

    pub fn zero(dtype: DType) -> Scalar {
        Scalar::from_f64(dtype, 0.0)
    }

    pub fn one(dtype: DType) -> Scalar {
        Scalar::from_f64(dtype, 1.0)
    }

    /// Build a scalar of `dtype` from an f64 value.
    pub fn from_f64(dtype: DType, v: f64) -> Scalar {
        match dtype {
            DType::Bool => Scalar::Bool(v != 0.0),
            DType::I32 => Scalar::I32(v as i32),
            DType::U32 => Scalar::U32(v as u32),
            DType::F16 => Scalar::F16(f16::from_f64(v)),
            DType::F32 => Scalar::F32(v as f32),
            DType::F64 => Scalar::F64(v),
        }
    }

    pub fn from_i64(dtype: DType, v: i64) -> Scalar {
        match dtype {
            DType::Bool => Scalar::Bool(v != 0),
            DType::I32 => Scalar::I32(v as i32),
            DType::U32 => Scalar::U32(v as u32),
            DType::F16 => Scalar::F16(f16::from_f64(v as f64)),
            DType::F32 => Scalar::F32(v as f32),
            DType::F64 => Scalar::F64(v as f64),
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => b as i32 as f64,
            Scalar::I32(v) => v as f64,
            Scalar::U32(v) => v as f64,
            Scalar::F16(v) => v.to_f64(),
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
        }
    }

    pub fn to_i64(self) -> i64 {
        match self {
            Scalar::Bool(b) => b as i64,
            Scalar::I32(v) => v as i64,
            Scalar::U32(v) => v as i64,
            Scalar::F16(v) => v.to_f64() as i64,
            Scalar::F32(v) => v as i64,
            Scalar::F64(v) => v as i64,
        }
    }

    pub fn to_bool(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            other => other.to_f64() != 0.0,
        }
    }

    pub fn is_nan(self) -> bool {
        match self {
            Scalar::F16(v) => v.is_nan(),
            Scalar::F32(v) => v.is_nan(),
            Scalar::F64(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Cast to another dtype with `as` semantics.
    pub fn cast(self, dtype: DType) -> Scalar {
        if self.dtype() == dtype {
            return self;
        }
        match (self, dtype) {
            // Int-to-int goes through the bit-honest i64 path so that e.g.
            // u32 -> i32 wraps instead of saturating.
            (Scalar::I32(v), DType::U32) => Scalar::U32(v as u32),
            (Scalar::U32(v), DType::I32) => Scalar::I32(v as i32),
            (s, DType::Bool) => Scalar::Bool(s.to_bool()),
            (s, d) if s.dtype().is_float() || d.is_float() => Scalar::from_f64(d, s.to_f64()),
            (s, d) => Scalar::from_i64(d, s.to_i64()),
        }
    }

    /// Raw bits, used for hashing so that structurally equal constants
    /// (including NaN payloads) hash identically.
    pub fn bits(self) -> u64 {
        match self {
            Scalar::Bool(b) => b as u64,
            Scalar::I32(v) => v as u32 as u64,
            Scalar::U32(v) => v as u64,
            Scalar::F16(v) => v.to_bits() as u64,
            Scalar::F32(v) => v.to_bits() as u64,
            Scalar::F64(v) => v.to_bits(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::I32(v) => write!(f, "{}", v),
            Scalar::U32(v) => write!(f, "{}u", v),
            Scalar::F16(v) => write!(f, "{}h", v),
            Scalar::F32(v) => write!(f, "{}f", v),
            Scalar::F64(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::Bool.size_of(), 1);
        assert_eq!(DType::F16.size_of(), 2);
        assert_eq!(DType::F32.size_of(), 4);
        assert_eq!(DType::F64.size_of(), 8);
    }

    #[test]
    fn test_scalar_cast_float_to_int_truncates() {
        assert_eq!(Scalar::F32(2.9).cast(DType::I32), Scalar::I32(2));
        assert_eq!(Scalar::F32(-2.9).cast(DType::I32), Scalar::I32(-2));
    }

    #[test]
    fn test_scalar_cast_int_wraps() {
        assert_eq!(Scalar::I32(-1).cast(DType::U32), Scalar::U32(u32::MAX));
        assert_eq!(Scalar::U32(u32::MAX).cast(DType::I32), Scalar::I32(-1));
    }

    #[test]
    fn test_scalar_bool_cast() {
        assert_eq!(Scalar::F64(0.0).cast(DType::Bool), Scalar::Bool(false));
        assert_eq!(Scalar::F64(-3.5).cast(DType::Bool), Scalar::Bool(true));
        assert_eq!(Scalar::Bool(true).cast(DType::F32), Scalar::F32(1.0));
    }

    #[test]
    fn test_scalar_identity_elements() {
        for dtype in DType::ALL {
            assert_eq!(Scalar::zero(dtype).to_f64(), 0.0);
            assert_eq!(Scalar::one(dtype).to_f64(), 1.0);
        }
    }

    #[test]
    fn test_nan_bits_stable() {
        let a = Scalar::F32(f32::NAN);
        let b = Scalar::F32(f32::NAN);
        assert_eq!(a.bits(), b.bits());
        assert!(a.is_nan());
    }
}
