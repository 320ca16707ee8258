//! Trace-compile-cache behaviour.

mod common;
use common::*;

use gradix::trace::tape::format_tape;
use gradix::transform::jit::trace_to_tape;
use gradix::{grad, jit, jit_with_static, ops, vmap, Aval, DType, Tensor, Val};

fn poly(args: &[Val]) -> gradix::Result<Vec<Val>> {
    // (x + x) * (x - 1)
    let x = &args[0];
    Ok(vec![ops::mul(&ops::add(x, x)?, &ops::subs(x, 1.0)?)?])
}

#[test]
fn test_jit_matches_eager() {
    setup();
    let jitted = jit(poly);
    let x = Val::from(f32s(&[4], &[0.0, 1.0, 2.0, 3.0]));
    let eager = poly(&[x.clone()]).unwrap();
    let traced = jitted.call(&[x]).unwrap();
    assert_eq!(read(&traced[0]), read(&eager[0]));
}

#[test]
fn test_jit_caches_by_signature() {
    setup();
    let jitted = jit(poly);
    let a = Val::from(f32s(&[4], &[0.0, 1.0, 2.0, 3.0]));
    let b = Val::from(f32s(&[4], &[5.0, 6.0, 7.0, 8.0]));
    let c = Val::from(f32s(&[2], &[1.0, 2.0]));
    jitted.call(&[a]).unwrap();
    assert_eq!(jitted.cache_size(), 1);
    assert_eq!(jitted.cache_hits(), 0);
    // same avals: replay the cached tape
    jitted.call(&[b]).unwrap();
    assert_eq!(jitted.cache_size(), 1);
    assert_eq!(jitted.cache_hits(), 1);
    // new shape: fresh trace
    jitted.call(&[c]).unwrap();
    assert_eq!(jitted.cache_size(), 2);
    // dtype change also re-traces
    let d = Val::from(Tensor::from_f64(&[4], &[1.0; 4], None).unwrap());
    jitted.call(&[d]).unwrap();
    assert_eq!(jitted.cache_size(), 3);
}

#[test]
fn test_jit_replay_values_differ_per_input() {
    setup();
    let jitted = jit(poly);
    let a = Val::from(f32s(&[2], &[2.0, 3.0]));
    let b = Val::from(f32s(&[2], &[4.0, 5.0]));
    assert_eq!(read(&jitted.call(&[a]).unwrap()[0]), vec![4.0 * 1.0, 6.0 * 2.0]);
    assert_eq!(read(&jitted.call(&[b]).unwrap()[0]), vec![8.0 * 3.0, 10.0 * 4.0]);
}

#[test]
fn test_jit_with_static_argument() {
    setup();
    // static second argument participates in the cache key by value
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::mul(&args[0], &args[1])?])
    };
    let jitted = jit_with_static(f, &[1]);
    let x = Val::from(f32s(&[2], &[1.0, 2.0]));
    let two = Val::from(f32s(&[], &[2.0]));
    let three = Val::from(f32s(&[], &[3.0]));
    assert_eq!(read(&jitted.call(&[x.clone(), two.clone()]).unwrap()[0]), vec![2.0, 4.0]);
    assert_eq!(jitted.cache_size(), 1);
    assert_eq!(read(&jitted.call(&[x.clone(), three]).unwrap()[0]), vec![3.0, 6.0]);
    assert_eq!(jitted.cache_size(), 2);
    assert_eq!(read(&jitted.call(&[x, two]).unwrap()[0]), vec![2.0, 4.0]);
    assert_eq!(jitted.cache_size(), 2);
    assert_eq!(jitted.cache_hits(), 1);
}

#[test]
fn test_jit_composes_with_grad_and_vmap() {
    setup();
    // grad of a jitted scalar function
    let jitted = jit(|args: &[Val]| {
        Ok(vec![ops::sum(&ops::mul(&args[0], &args[0])?, None, false)?])
    });
    let g = grad(move |args: &[Val]| jitted.call(args));
    let x = Val::from(f32s(&[3], &[1.0, 2.0, 3.0]));
    assert_eq!(read(&g(&[x]).unwrap()[0]), vec![2.0, 4.0, 6.0]);

    // vmap of a jitted function
    let jitted2 = jit(poly);
    let batched = vmap(move |args: &[Val]| jitted2.call(args), vec![Some(0)]);
    let xs = Val::from(f32s(&[2, 2], &[0.0, 1.0, 2.0, 3.0]));
    assert_eq!(read(&batched(&[xs]).unwrap()[0]), vec![-0.0, 0.0, 4.0, 12.0]);
}

#[test]
fn test_tape_structure_snapshot() {
    setup();
    let tape = trace_to_tape(
        |args: &[Val]| Ok(vec![ops::muls(&args[0], 2.0)?]),
        &[Aval::new(vec![4], DType::F32)],
    )
    .unwrap();
    insta::assert_snapshot!(format_tape(&tape), @r"
    tape { in: [v0], const: [v1]
      [v2] = Mul [v0, v1]
      out: [v2] }
    ");
}

#[test]
fn test_traced_tape_owns_its_constants() {
    setup();
    // The closed-over tensor may be dropped by the caller; the cached tape
    // keeps its own reference and replays correctly.
    let jitted = {
        let weights = Val::from(f32s(&[2], &[10.0, 20.0]));
        jit(move |args: &[Val]| Ok(vec![ops::mul(&args[0], &weights)?]))
    };
    let x = Val::from(f32s(&[2], &[1.0, 2.0]));
    assert_eq!(read(&jitted.call(&[x.clone()]).unwrap()[0]), vec![10.0, 40.0]);
    assert_eq!(read(&jitted.call(&[x]).unwrap()[0]), vec![10.0, 40.0]);
    assert_eq!(jitted.cache_hits(), 1);
}
