//! Forward- and reverse-mode differentiation.

mod common;
use common::*;

use gradix::{grad, jvp, ops, vjp, DType, Tensor, Val};

#[test]
fn test_jvp_polynomial() {
    setup();
    // f(x) = x^2 + 3x, df = (2x + 3) dx
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        let x = &args[0];
        Ok(vec![ops::add(&ops::mul(x, x)?, &ops::muls(x, 3.0)?)?])
    };
    let x = Val::from(f32s(&[3], &[1.0, 2.0, 3.0]));
    let dx = Val::from(f32s(&[3], &[1.0, 1.0, 1.0]));
    let (primals, tangents) = jvp(f, &[x], &[dx]).unwrap();
    assert_close(&read(&primals[0]), &[4.0, 10.0, 18.0], 1e-6);
    assert_close(&read(&tangents[0]), &[5.0, 7.0, 9.0], 1e-6);
}

#[test]
fn test_jvp_transcendentals() {
    setup();
    // d exp = exp, d sin = cos, d log = 1/x
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![
            ops::exp(&args[0])?,
            ops::sin(&args[0])?,
            ops::log(&args[0])?,
        ])
    };
    let x = Val::from(f32s(&[2], &[0.5, 2.0]));
    let dx = Val::from(f32s(&[2], &[1.0, 1.0]));
    let (_, tangents) = jvp(f, &[x], &[dx]).unwrap();
    assert_close(&read(&tangents[0]), &[0.5f64.exp(), 2.0f64.exp()], 1e-5);
    assert_close(&read(&tangents[1]), &[0.5f64.cos(), 2.0f64.cos()], 1e-6);
    assert_close(&read(&tangents[2]), &[2.0, 0.5], 1e-6);
}

#[test]
fn test_grad_sum_reciprocal() {
    setup();
    // f(x) = sum(1/x); grad = -1/x^2
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::sum(&ops::reciprocal(&args[0])?, None, false)?])
    };
    let x = Val::from(f32s(&[3], &[1.0, 2.0, 3.0]));
    let g = grad(f)(&[x]).unwrap();
    assert_close(&read(&g[0]), &[-1.0, -0.25, -1.0 / 9.0], 1e-6);
}

#[test]
fn test_grad_matches_finite_differences() {
    setup();
    // f(x) = sum(sin(x) * x); grad = sin(x) + x cos(x)
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::sum(&ops::mul(&ops::sin(&args[0])?, &args[0])?, None, false)?])
    };
    let xs = [0.3f64, 1.1, -0.7, 2.4];
    let x = Val::from(Tensor::from_f64(&[4], &xs, None).unwrap());
    let grads = grad(f)(&[x]).unwrap();
    let g = read(&grads[0]);
    // central differences in f64
    let h = 1e-6;
    for (i, &xi) in xs.iter().enumerate() {
        let scalar_f = |v: f64| v.sin() * v;
        let fd = (scalar_f(xi + h) - scalar_f(xi - h)) / (2.0 * h);
        assert!(
            (g[i] - fd).abs() < 1e-5,
            "element {}: grad {} vs finite difference {}",
            i,
            g[i],
            fd
        );
    }
}

#[test]
fn test_grad_through_movement() {
    setup();
    // f(x) = sum(x[1..3] reversed) — the cotangent routes back through
    // flip and slice into the right slots.
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        let s = ops::slice(&args[0], &[1], &[3], None)?;
        let r = ops::flip(&s, &[0])?;
        Ok(vec![ops::sum(&r, None, false)?])
    };
    let x = Val::from(f32s(&[4], &[10.0, 20.0, 30.0, 40.0]));
    let g = grad(f)(&[x]).unwrap();
    assert_eq!(read(&g[0]), vec![0.0, 1.0, 1.0, 0.0]);
}

#[test]
fn test_grad_broadcast_unbroadcasts() {
    setup();
    // f(a) = sum(a + b) with b bigger: grad(a) counts the broadcast fan-out
    let b = Val::from(f32s(&[2, 3], &[1.0; 6]));
    let f = move |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::sum(&ops::add(&args[0], &b)?, None, false)?])
    };
    let a = Val::from(f32s(&[3], &[1.0, 2.0, 3.0]));
    let g = grad(f)(&[a]).unwrap();
    assert_eq!(g[0].shape(), vec![3]);
    assert_eq!(read(&g[0]), vec![2.0, 2.0, 2.0]);
}

#[test]
fn test_grad_matmul() {
    setup();
    // f(a) = sum(a @ b); grad(a) = ones @ b^T (row sums of b broadcast)
    let b = Val::from(f32s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]));
    let f = move |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::sum(&ops::matmul(&args[0], &b)?, None, false)?])
    };
    let a = Val::from(f32s(&[2, 2], &[0.0; 4]));
    let g = grad(f)(&[a]).unwrap();
    assert_eq!(read(&g[0]), vec![3.0, 7.0, 3.0, 7.0]);
}

#[test]
fn test_grad_where_and_extrema() {
    setup();
    // f(x) = sum(max(x, 0)) — relu gradient
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        let zero = ops::zeros_like(&args[0])?;
        Ok(vec![ops::sum(&ops::maximum(&args[0], &zero)?, None, false)?])
    };
    let x = Val::from(f32s(&[4], &[1.0, -2.0, 3.0, -4.0]));
    let g = grad(f)(&[x]).unwrap();
    assert_eq!(read(&g[0]), vec![1.0, 0.0, 1.0, 0.0]);
}

#[test]
fn test_vjp_multiple_inputs() {
    setup();
    // f(a, b) = sum(a * b): grad a = b, grad b = a
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::sum(&ops::mul(&args[0], &args[1])?, None, false)?])
    };
    let a = Val::from(f32s(&[2], &[2.0, 3.0]));
    let b = Val::from(f32s(&[2], &[5.0, 7.0]));
    let (outs, pullback) = vjp(f, &[a, b]).unwrap();
    assert_eq!(read(&outs[0]), vec![31.0]);
    let cts = pullback.call(&[Val::from(f32s(&[], &[1.0]))]).unwrap();
    assert_eq!(read(&cts[0]), vec![5.0, 7.0]);
    assert_eq!(read(&cts[1]), vec![2.0, 3.0]);
}

#[test]
fn test_grad_requires_scalar_output() {
    setup();
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> { Ok(vec![args[0].clone()]) };
    let x = Val::from(f32s(&[2], &[1.0, 2.0]));
    assert!(grad(f)(&[x]).is_err());
}

#[test]
fn test_grad_int_input_gets_zero_cotangent() {
    setup();
    // An integer input cannot carry a float cotangent; the tangent side
    // treats it as constant and its cotangent is zero.
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        let as_float = ops::cast(&args[1], DType::F32)?;
        Ok(vec![ops::sum(&ops::mul(&args[0], &as_float)?, None, false)?])
    };
    let x = Val::from(f32s(&[2], &[1.0, 2.0]));
    let n = Val::from(i32s(&[2], &[3, 4]));
    let g = grad(f)(&[x, n]).unwrap();
    assert_eq!(read(&g[0]), vec![3.0, 4.0]);
    assert_eq!(read(&g[1]), vec![0.0, 0.0]);
}
