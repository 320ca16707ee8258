//! Host linear-algebra routines: Cholesky factorization and triangular
//! solves, batched over leading dimensions.

use num_traits::Float;

use gradix_ir::DType;

use crate::error::{Error, Result};

fn square_dims(shape: &[usize], op: &'static str) -> Result<(usize, usize)> {
    if shape.len() < 2 {
        return Err(Error::InvalidOperand {
            op,
            message: format!("expected a matrix, got shape {:?}", shape),
        });
    }
    let n = shape[shape.len() - 1];
    if shape[shape.len() - 2] != n {
        return Err(Error::InvalidOperand {
            op,
            message: format!("matrix is not square: {:?}", shape),
        });
    }
    Ok((shape[..shape.len() - 2].iter().product(), n))
}

/// Cholesky-Banachiewicz: row-by-row lower factor. A non-positive pivot
/// turns into NaN through the square root, as IEEE prescribes.
fn cholesky<T: Float>(a: &[T], n: usize, out: &mut [T]) {
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum = sum - out[i * n + k] * out[j * n + k];
            }
            if i == j {
                out[i * n + j] = sum.sqrt();
            } else {
                out[i * n + j] = sum / out[j * n + j];
            }
        }
        for j in i + 1..n {
            out[i * n + j] = T::zero();
        }
    }
}

/// Substitution solve of `a x = b` for one batch element. `b` holds `m`
/// right-hand sides laid out row-major `[n, m]`.
fn solve_tri<T: Float>(a: &[T], b: &[T], n: usize, m: usize, lower: bool, unit: bool, x: &mut [T]) {
    x.copy_from_slice(b);
    for col in 0..m {
        if lower {
            for i in 0..n {
                let mut v = x[i * m + col];
                for k in 0..i {
                    v = v - a[i * n + k] * x[k * m + col];
                }
                x[i * m + col] = if unit { v } else { v / a[i * n + i] };
            }
        } else {
            for i in (0..n).rev() {
                let mut v = x[i * m + col];
                for k in i + 1..n {
                    v = v - a[i * n + k] * x[k * m + col];
                }
                x[i * m + col] = if unit { v } else { v / a[i * n + i] };
            }
        }
    }
}

fn to_floats<T: Float>(bytes: &[u8], dtype: DType, read: fn(&[u8]) -> T) -> Vec<T> {
    bytes.chunks_exact(dtype.size_of()).map(read).collect()
}

/// Run a batched float routine in the element precision of `dtype`.
macro_rules! float_dispatch {
    ($dtype:expr, $op:literal, $f32_block:expr, $f64_block:expr) => {
        match $dtype {
            DType::F32 => $f32_block,
            DType::F64 => $f64_block,
            other => Err(Error::InvalidOperand {
                op: $op,
                message: format!("expected f32 or f64, got {}", other),
            }),
        }
    };
}

pub fn cholesky_host(bytes: &[u8], shape: &[usize], dtype: DType) -> Result<Vec<u8>> {
    let (batch, n) = square_dims(shape, "cholesky")?;
    float_dispatch!(
        dtype,
        "cholesky",
        {
            let a = to_floats::<f32>(bytes, dtype, |c| {
                f32::from_le_bytes([c[0], c[1], c[2], c[3]])
            });
            let mut out = vec![0f32; a.len()];
            for b in 0..batch {
                let at = b * n * n;
                cholesky(&a[at..at + n * n], n, &mut out[at..at + n * n]);
            }
            Ok(out.iter().flat_map(|v| v.to_le_bytes()).collect())
        },
        {
            let a = to_floats::<f64>(bytes, dtype, |c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            });
            let mut out = vec![0f64; a.len()];
            for b in 0..batch {
                let at = b * n * n;
                cholesky(&a[at..at + n * n], n, &mut out[at..at + n * n]);
            }
            Ok(out.iter().flat_map(|v| v.to_le_bytes()).collect())
        }
    )
}

pub fn solve_triangular_host(
    a_bytes: &[u8],
    a_shape: &[usize],
    b_bytes: &[u8],
    b_shape: &[usize],
    dtype: DType,
    lower: bool,
    unit_diagonal: bool,
) -> Result<Vec<u8>> {
    let (batch, n) = square_dims(a_shape, "solve_triangular")?;
    // b: [..., n] or [..., n, m]
    let (b_batch, m) = if b_shape.len() + 1 == a_shape.len() {
        (b_shape[..b_shape.len() - 1].iter().product::<usize>(), 1)
    } else if b_shape.len() == a_shape.len() {
        (
            b_shape[..b_shape.len() - 2].iter().product::<usize>(),
            b_shape[b_shape.len() - 1],
        )
    } else {
        return Err(Error::InvalidOperand {
            op: "solve_triangular",
            message: format!("rhs shape {:?} does not match {:?}", b_shape, a_shape),
        });
    };
    if b_batch != batch || b_shape[a_shape.len() - 2] != n {
        return Err(Error::InvalidOperand {
            op: "solve_triangular",
            message: format!("rhs shape {:?} does not match {:?}", b_shape, a_shape),
        });
    }
    float_dispatch!(
        dtype,
        "solve_triangular",
        {
            let a = to_floats::<f32>(a_bytes, dtype, |c| {
                f32::from_le_bytes([c[0], c[1], c[2], c[3]])
            });
            let b = to_floats::<f32>(b_bytes, dtype, |c| {
                f32::from_le_bytes([c[0], c[1], c[2], c[3]])
            });
            let mut out = vec![0f32; b.len()];
            for i in 0..batch {
                solve_tri(
                    &a[i * n * n..(i + 1) * n * n],
                    &b[i * n * m..(i + 1) * n * m],
                    n,
                    m,
                    lower,
                    unit_diagonal,
                    &mut out[i * n * m..(i + 1) * n * m],
                );
            }
            Ok(out.iter().flat_map(|v| v.to_le_bytes()).collect())
        },
        {
            let a = to_floats::<f64>(a_bytes, dtype, |c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            });
            let b = to_floats::<f64>(b_bytes, dtype, |c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            });
            let mut out = vec![0f64; b.len()];
            for i in 0..batch {
                solve_tri(
                    &a[i * n * n..(i + 1) * n * n],
                    &b[i * n * m..(i + 1) * n * m],
                    n,
                    m,
                    lower,
                    unit_diagonal,
                    &mut out[i * n * m..(i + 1) * n * m],
                );
            }
            Ok(out.iter().flat_map(|v| v.to_le_bytes()).collect())
        }
    )
}
