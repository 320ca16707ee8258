//! Counter-based random numbers on Threefry-2x32.
//!
//! Keys are `u32[2]` tensors. Draws are pure functions of (key, counter),
//! so batching a key with `vmap` produces bit-identical streams to stacking
//! per-key draws. Everything here is written against the traceable `ops`
//! surface for exactly that reason.

use gradix_ir::{DType, Scalar};

use crate::array::Tensor;
use crate::error::{Error, Result};
use crate::trace::{ops, Val};

/// Build a PRNG key from a seed: `[seed >> 32, seed & 0xffffffff]`.
pub fn key(seed: u64) -> Result<Val> {
    let words = [(seed >> 32) as u32, seed as u32];
    Ok(Val::Concrete(Tensor::from_u32(&[2], &words, None)?))
}

fn key_word(key: &Val, at: i64) -> Result<Val> {
    let k = ops::slice(key, &[at], &[at + 1], None)?;
    ops::reshape(&k, &[])
}

/// `n` words of random bits from (key, counter-lane `salt`).
fn random_bits(key: &Val, n: usize, salt: u32) -> Result<Val> {
    let k0 = key_word(key, 0)?;
    let k1 = key_word(key, 1)?;
    let c0 = Val::Concrete(Tensor::arange(0.0, n as f64, 1.0, DType::U32, None)?);
    let c1 = Val::Concrete(Tensor::full(&[n], Scalar::U32(salt), None)?);
    let (bits, _) = ops::threefry(&k0, &k1, &c0, &c1)?;
    Ok(bits)
}

/// Split a key into `n` statistically independent keys, shape `[n, 2]`.
pub fn split(key: &Val, n: usize) -> Result<Val> {
    let bits = random_bits(key, 2 * n, 0)?;
    ops::reshape(&bits, &[n as i64, 2])
}

/// Uniform draws in `[0, 1)`.
///
/// Bits convert through `(bits div 256) * 2^-24`: the division is an exact
/// truncating shift on u32 and 24-bit integers convert to float exactly.
pub fn uniform(key: &Val, shape: &[usize], dtype: DType) -> Result<Val> {
    if !dtype.is_float() {
        return Err(Error::InvalidOperand {
            op: "uniform",
            message: format!("requires a float dtype, got {}", dtype),
        });
    }
    let n: usize = shape.iter().product();
    let bits = random_bits(key, n, 0)?;
    let hi = ops::div(&bits, &Val::Concrete(Tensor::full(&[], Scalar::U32(256), None)?))?;
    let u = ops::muls(&ops::cast(&hi, dtype)?, 1.0 / ((1u64 << 24) as f64))?;
    let target: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    ops::reshape(&u, &target)
}

/// Standard normal draws via the Box-Muller transform over two independent
/// uniform draws.
pub fn normal(key: &Val, shape: &[usize], dtype: DType) -> Result<Val> {
    if !dtype.is_float() {
        return Err(Error::InvalidOperand {
            op: "normal",
            message: format!("requires a float dtype, got {}", dtype),
        });
    }
    let n: usize = shape.iter().product();
    let to_unit = |bits: &Val| -> Result<Val> {
        let hi = ops::div(bits, &Val::Concrete(Tensor::full(&[], Scalar::U32(256), None)?))?;
        ops::muls(&ops::cast(&hi, dtype)?, 1.0 / ((1u64 << 24) as f64))
    };
    let u1 = to_unit(&random_bits(key, n, 0)?)?;
    let u2 = to_unit(&random_bits(key, n, 1)?)?;
    // r = sqrt(-2 ln(1 - u1)) in (0, inf); 1 - u1 never reaches 0.
    let r = ops::sqrt(&ops::muls(&ops::log(&ops::subs(&ops::neg(&u1)?, -1.0)?)?, -2.0)?)?;
    let theta = ops::muls(&u2, 2.0 * std::f64::consts::PI)?;
    let z = ops::mul(&r, &ops::cos(&theta)?)?;
    let target: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    ops::reshape(&z, &target)
}

/// Bernoulli draws with success probability `p`.
pub fn bernoulli(key: &Val, p: f64, shape: &[usize]) -> Result<Val> {
    let u = uniform(key, shape, DType::F32)?;
    ops::lt(&u, &ops::full_like(&u, p)?)
}

/// Sample category indices from unnormalized log-probabilities over the
/// trailing axis, by the Gumbel-max trick.
pub fn categorical(key: &Val, logits: &Val) -> Result<Val> {
    let u = uniform(key, &logits.shape(), logits.dtype())?;
    let gumbel = ops::neg(&ops::log(&ops::neg(&ops::log(&u)?)?)?)?;
    let perturbed = ops::add(logits, &gumbel)?;
    ops::argmax(&perturbed, Some(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{init, Device};

    fn setup() {
        init(&[Device::Cpu]);
    }

    #[test]
    fn test_key_layout() {
        setup();
        let k = key(0x1234_5678_9abc_def0).unwrap();
        let data = k.tensor().unwrap().to_vec().unwrap();
        assert_eq!(
            data,
            crate::array::HostData::U32(vec![0x1234_5678, 0x9abc_def0])
        );
    }

    #[test]
    fn test_uniform_range_and_determinism() {
        setup();
        let k = key(42).unwrap();
        let a = uniform(&k, &[64], DType::F32).unwrap();
        let b = uniform(&k, &[64], DType::F32).unwrap();
        let av = a.tensor().unwrap().to_f64_vec().unwrap();
        let bv = b.tensor().unwrap().to_f64_vec().unwrap();
        assert_eq!(av, bv);
        assert!(av.iter().all(|&x| (0.0..1.0).contains(&x)));
        // not all equal
        assert!(av.iter().any(|&x| x != av[0]));
    }

    #[test]
    fn test_split_changes_streams() {
        setup();
        let k = key(7).unwrap();
        let ks = split(&k, 3).unwrap();
        assert_eq!(ks.shape(), vec![3, 2]);
        let k0 = ops::reshape(&ops::slice(&ks, &[0, 0], &[1, 2], None).unwrap(), &[2]).unwrap();
        let k1 = ops::reshape(&ops::slice(&ks, &[1, 0], &[2, 2], None).unwrap(), &[2]).unwrap();
        let a = uniform(&k0, &[8], DType::F32).unwrap().tensor().unwrap().to_f64_vec().unwrap();
        let b = uniform(&k1, &[8], DType::F32).unwrap().tensor().unwrap().to_f64_vec().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_normal_moments() {
        setup();
        let k = key(1).unwrap();
        let z = normal(&k, &[4096], DType::F32).unwrap();
        let v = z.tensor().unwrap().to_f64_vec().unwrap();
        let mean = v.iter().sum::<f64>() / v.len() as f64;
        let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / v.len() as f64;
        assert!(mean.abs() < 0.1, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.15, "var {}", var);
    }

    #[test]
    fn test_bernoulli_rate() {
        setup();
        let k = key(3).unwrap();
        let b = bernoulli(&k, 0.25, &[4096]).unwrap();
        let v = b.tensor().unwrap().to_f64_vec().unwrap();
        let rate = v.iter().sum::<f64>() / v.len() as f64;
        assert!((rate - 0.25).abs() < 0.05, "rate {}", rate);
    }
}
