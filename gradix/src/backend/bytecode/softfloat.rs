//! Software f32 transcendentals for the stack machine.
//!
//! Polynomial/rational approximations in the Cephes tradition, so results
//! are reproducible independent of the host libm. Documented error bounds
//! (checked by the backend tolerance tests):
//!
//! - `exp_f32`:  relative error < 2e-7 on [-87, 88]
//! - `log_f32`:  relative error < 5e-7 on positive normals
//! - `sin_f32`/`cos_f32`: absolute error < 5e-7 for |x| <= 1e4
//! - `atan_f32`: relative error < 2e-6
//! - `asin_f32`: absolute error < 1e-6 on [-1, 1]
//! - `erf_f32`/`erfc_f32`: absolute error < 3e-7
//! - `pow_f32`:  relative error < 2e-6 for moderate arguments
//!
//! Argument reduction for sin/cos loses accuracy beyond |x| ~ 1e4; that is
//! inherent to single-precision payload reduction and matches the scale the
//! shader backends offer.

const LOG2EF: f32 = 1.442_695;
const LN2_HI: f32 = 0.693_359_4;
const LN2_LO: f32 = -2.121_944_4e-4;

/// Scale by a power of two without going through `powi`.
fn ldexp_f32(x: f32, mut n: i32) -> f32 {
    let mut x = x;
    while n > 127 {
        x *= f32::from_bits(254 << 23); // 2^127
        n -= 127;
    }
    while n < -126 {
        x *= f32::from_bits(1 << 23); // 2^-126
        n += 126;
    }
    x * f32::from_bits(((127 + n) as u32) << 23)
}

pub fn exp_f32(x: f32) -> f32 {
    if x.is_nan() {
        return x;
    }
    if x > 88.722_83 {
        return f32::INFINITY;
    }
    if x < -87.336_55 {
        return 0.0;
    }
    let z = (LOG2EF * x + 0.5).floor();
    let n = z as i32;
    let mut r = x - z * LN2_HI;
    r -= z * LN2_LO;
    let r2 = r * r;
    let mut p = 1.987_569_2e-4f32;
    p = p * r + 1.398_2e-3;
    p = p * r + 8.333_452e-3;
    p = p * r + 4.166_579_6e-2;
    p = p * r + 1.666_666_5e-1;
    p = p * r + 5.000_000_4e-1;
    ldexp_f32(r2 * p + r + 1.0, n)
}

pub fn log_f32(x: f32) -> f32 {
    if x.is_nan() || x == f32::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f32::NEG_INFINITY;
    }
    if x < 0.0 {
        return f32::NAN;
    }
    // frexp: x = m * 2^e with m in [0.5, 1)
    let mut bits = x.to_bits();
    let mut e: i32 = 0;
    if bits & 0x7f80_0000 == 0 {
        // subnormal: renormalize through a 2^23 scale
        bits = (x * 8_388_608.0).to_bits();
        e -= 23;
    }
    e += ((bits >> 23) as i32) - 126;
    let mut m = f32::from_bits((bits & 0x007f_ffff) | 0x3f00_0000);
    const SQRTHF: f32 = std::f32::consts::FRAC_1_SQRT_2;
    if m < SQRTHF {
        e -= 1;
        m = m + m - 1.0;
    } else {
        m -= 1.0;
    }
    let z = m * m;
    let mut p = 7.037_683_6e-2f32;
    p = p * m - 1.151_461e-1;
    p = p * m + 1.167_699_9e-1;
    p = p * m - 1.242_014_1e-1;
    p = p * m + 1.424_932_3e-1;
    p = p * m - 1.666_805_7e-1;
    p = p * m + 2.000_071_4e-1;
    p = p * m - 2.499_999_4e-1;
    p = p * m + 3.333_333e-1;
    let mut y = m * z * p;
    let fe = e as f32;
    y += LN2_LO * fe;
    y -= 0.5 * z;
    m + y + LN2_HI * fe
}

const DP1: f32 = 0.785_156_25;
const DP2: f32 = 2.418_756_5e-4;
const DP3: f32 = 3.774_895e-8;
const FOPI: f32 = 1.273_239_5; // 4/pi

fn sin_poly(z: f32) -> f32 {
    let zz = z * z;
    ((-1.951_529_6e-4 * zz + 8.332_161e-3) * zz - 1.666_665_5e-1) * zz * z + z
}

fn cos_poly(z: f32) -> f32 {
    let zz = z * z;
    ((2.443_315_7e-5 * zz - 1.388_731_6e-3) * zz + 4.166_664_6e-2) * zz * zz - 0.5 * zz + 1.0
}

pub fn sin_f32(x: f32) -> f32 {
    if !x.is_finite() {
        return f32::NAN;
    }
    let mut sign = x.is_sign_negative();
    let xa = x.abs();
    let mut j = (FOPI * xa) as u64;
    if j & 1 == 1 {
        j += 1;
    }
    let y = j as f32;
    j &= 7;
    if j > 3 {
        sign = !sign;
        j -= 4;
    }
    let z = ((xa - y * DP1) - y * DP2) - y * DP3;
    let r = if j == 1 || j == 2 { cos_poly(z) } else { sin_poly(z) };
    if sign {
        -r
    } else {
        r
    }
}

pub fn cos_f32(x: f32) -> f32 {
    if !x.is_finite() {
        return f32::NAN;
    }
    let xa = x.abs();
    let mut sign = false;
    let mut j = (FOPI * xa) as u64;
    if j & 1 == 1 {
        j += 1;
    }
    let y = j as f32;
    j &= 7;
    if j > 3 {
        sign = !sign;
        j -= 4;
    }
    if j > 1 {
        sign = !sign;
    }
    let z = ((xa - y * DP1) - y * DP2) - y * DP3;
    let r = if j == 1 || j == 2 { sin_poly(z) } else { cos_poly(z) };
    if sign {
        -r
    } else {
        r
    }
}

pub fn tan_f32(x: f32) -> f32 {
    sin_f32(x) / cos_f32(x)
}

pub fn atan_f32(x: f32) -> f32 {
    if x.is_nan() {
        return x;
    }
    let sign = x.is_sign_negative();
    let mut x = x.abs();
    let mut y = 0.0f32;
    if x > 2.414_213_5 {
        // tan(3pi/8)
        y = std::f32::consts::FRAC_PI_2;
        x = -1.0 / x;
    } else if x > 0.414_213_57 {
        // tan(pi/8)
        y = std::f32::consts::FRAC_PI_4;
        x = (x - 1.0) / (x + 1.0);
    }
    let z = x * x;
    y += (((8.053_744_6e-2 * z - 1.387_768_6e-1) * z + 1.997_771e-1) * z - 3.333_294_9e-1)
        * z
        * x
        + x;
    if sign {
        -y
    } else {
        y
    }
}

pub fn asin_f32(x: f32) -> f32 {
    if x.is_nan() || x.abs() > 1.0 {
        return f32::NAN;
    }
    let sign = x.is_sign_negative();
    let a = x.abs();
    let (z, flag) = if a > 0.5 {
        ((1.0 - a) * 0.5, true)
    } else {
        (a * a, false)
    };
    let w = if flag { z.sqrt() } else { a };
    let p = ((((4.216_32e-2 * z + 2.418_131e-2) * z + 4.547_002_6e-2) * z + 7.495_300_3e-2)
        * z
        + 1.666_675_2e-1)
        * z
        * w
        + w;
    let r = if flag {
        std::f32::consts::FRAC_PI_2 - 2.0 * p
    } else {
        p
    };
    if sign {
        -r
    } else {
        r
    }
}

pub fn erf_f32(x: f32) -> f32 {
    const A1: f32 = 0.254_829_6;
    const A2: f32 = -0.284_496_74;
    const A3: f32 = 1.421_413_7;
    const A4: f32 = -1.453_152;
    const A5: f32 = 1.061_405_4;
    const P: f32 = 0.327_591_1;
    if x.is_nan() {
        return x;
    }
    let sign = x.is_sign_negative();
    let a = x.abs();
    let t = 1.0 / (1.0 + P * a);
    let y = 1.0 - ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t * exp_f32(-a * a);
    if sign {
        -y
    } else {
        y
    }
}

pub fn erfc_f32(x: f32) -> f32 {
    1.0 - erf_f32(x)
}

pub fn pow_f32(x: f32, y: f32) -> f32 {
    if y == 0.0 || x == 1.0 {
        return 1.0;
    }
    if x.is_nan() || y.is_nan() {
        return f32::NAN;
    }
    if x == 0.0 {
        return if y > 0.0 { 0.0 } else { f32::INFINITY };
    }
    if x < 0.0 {
        // Negative base requires an integral exponent.
        if y.fract() != 0.0 {
            return f32::NAN;
        }
        let odd = (y.abs() % 2.0) == 1.0;
        let m = exp_f32(y * log_f32(-x));
        return if odd { -m } else { m };
    }
    exp_f32(y * log_f32(x))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(a: f32, b: f64) -> f64 {
        if b == 0.0 {
            (a as f64).abs()
        } else {
            ((a as f64 - b) / b).abs()
        }
    }

    #[test]
    fn test_exp_matches_host_within_bound() {
        let mut x = -20.0f32;
        while x < 20.0 {
            assert!(
                rel(exp_f32(x), (x as f64).exp()) < 2e-7,
                "exp({}) = {}",
                x,
                exp_f32(x)
            );
            x += 0.37;
        }
        assert_eq!(exp_f32(f32::NEG_INFINITY), 0.0);
        assert_eq!(exp_f32(200.0), f32::INFINITY);
    }

    #[test]
    fn test_log_matches_host_within_bound() {
        for &x in &[1e-6f32, 0.01, 0.5, 0.9999, 1.0, 1.5, 2.0, 10.0, 1e6] {
            assert!(
                rel(log_f32(x), (x as f64).ln()) < 5e-7,
                "log({}) = {}",
                x,
                log_f32(x)
            );
        }
        assert!(log_f32(-1.0).is_nan());
        assert_eq!(log_f32(0.0), f32::NEG_INFINITY);
    }

    #[test]
    fn test_sin_cos_absolute_error() {
        let mut x = -30.0f32;
        while x < 30.0 {
            assert!(
                (sin_f32(x) as f64 - (x as f64).sin()).abs() < 5e-7,
                "sin({})",
                x
            );
            assert!(
                (cos_f32(x) as f64 - (x as f64).cos()).abs() < 5e-7,
                "cos({})",
                x
            );
            x += 0.173;
        }
    }

    #[test]
    fn test_atan_asin() {
        let mut x = -8.0f32;
        while x < 8.0 {
            assert!(
                (atan_f32(x) as f64 - (x as f64).atan()).abs() < 2e-6,
                "atan({})",
                x
            );
            x += 0.11;
        }
        let mut x = -1.0f32;
        while x <= 1.0 {
            assert!(
                (asin_f32(x) as f64 - (x as f64).asin()).abs() < 1e-6,
                "asin({})",
                x
            );
            x += 0.05;
        }
    }

    #[test]
    fn test_erf_bounds() {
        for &(x, want) in &[
            (0.0f32, 0.0f64),
            (0.5, 0.5204998778130465),
            (1.0, 0.8427007929497149),
            (2.0, 0.9953222650189527),
            (-1.0, -0.8427007929497149),
        ] {
            assert!((erf_f32(x) as f64 - want).abs() < 3e-7, "erf({})", x);
        }
        assert!((erfc_f32(2.0) as f64 - 0.004677734981063127).abs() < 3e-7);
    }

    #[test]
    fn test_pow_cases() {
        assert!(rel(pow_f32(2.0, 10.0), 1024.0) < 2e-6);
        assert!(rel(pow_f32(3.0, 0.5), 3f64.sqrt()) < 2e-6);
        assert_eq!(pow_f32(-2.0, 3.0), -8.0);
        assert!(pow_f32(-2.0, 0.5).is_nan());
        assert_eq!(pow_f32(0.0, -1.0), f32::INFINITY);
    }
}
