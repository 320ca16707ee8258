//! Batching.

mod common;
use common::*;

use gradix::{ops, random, vmap, DType, Tensor, Val};

#[test]
fn test_vmap_elementwise() {
    setup();
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::mul(&args[0], &args[0])?])
    };
    let x = Val::from(f32s(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
    let out = vmap(f, vec![Some(0)])(&[x]).unwrap();
    assert_eq!(out[0].shape(), vec![3, 2]);
    assert_eq!(read(&out[0]), vec![1.0, 4.0, 9.0, 16.0, 25.0, 36.0]);
}

#[test]
fn test_vmap_axis_one() {
    setup();
    // mapping over axis 1 transposes the result to axis 0
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::sum(&args[0], None, false)?])
    };
    let x = Val::from(f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
    let out = vmap(f, vec![Some(1)])(&[x]).unwrap();
    // column sums
    assert_eq!(read(&out[0]), vec![5.0, 7.0, 9.0]);
}

#[test]
fn test_vmap_unmapped_argument_broadcasts() {
    setup();
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::add(&args[0], &args[1])?])
    };
    let x = Val::from(f32s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]));
    let y = Val::from(f32s(&[2], &[10.0, 20.0]));
    let out = vmap(f, vec![Some(0), None])(&[x, y]).unwrap();
    assert_eq!(read(&out[0]), vec![11.0, 22.0, 13.0, 24.0]);
}

#[test]
fn test_vmap_matmul() {
    setup();
    // batched matrix-vector products
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::matmul(&args[0], &args[1])?])
    };
    let ms = Val::from(f32s(&[2, 2, 2], &[1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0]));
    let v = Val::from(f32s(&[2, 1], &[3.0, 4.0]));
    let out = vmap(f, vec![Some(0), None])(&[ms, v]).unwrap();
    assert_eq!(out[0].shape(), vec![2, 2, 1]);
    assert_eq!(read(&out[0]), vec![3.0, 4.0, 6.0, 8.0]);
}

#[test]
fn test_nested_vmap() {
    setup();
    // outer product table via two nested maps
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::mul(&args[0], &args[1])?])
    };
    let inner = vmap(f, vec![None, Some(0)]);
    let outer = vmap(move |args: &[Val]| inner(args), vec![Some(0), None]);
    let a = Val::from(f32s(&[2], &[2.0, 3.0]));
    let b = Val::from(f32s(&[3], &[1.0, 10.0, 100.0]));
    let out = outer(&[a, b]).unwrap();
    assert_eq!(out[0].shape(), vec![2, 3]);
    assert_eq!(read(&out[0]), vec![2.0, 20.0, 200.0, 3.0, 30.0, 300.0]);
}

#[test]
fn test_vmap_reduction_axis_shift() {
    setup();
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![ops::max(&args[0], Some(&[0]), false)?])
    };
    let x = Val::from(f32s(&[2, 3], &[5.0, 1.0, 2.0, 0.0, 9.0, 4.0]));
    let out = vmap(f, vec![Some(0)])(&[x]).unwrap();
    assert_eq!(read(&out[0]), vec![5.0, 9.0]);
}

#[test]
fn test_vmap_uniform_matches_stacked_draws() {
    setup();
    // vmap(uniform) over split keys equals stacking per-key draws exactly.
    let k = random::key(1234).unwrap();
    let ks = random::split(&k, 5).unwrap();
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        Ok(vec![random::uniform(&args[0], &[100], DType::F32)?])
    };
    let batched = vmap(f, vec![Some(0)])(&[ks.clone()]).unwrap();
    let ks_t = ks.tensor().unwrap();
    let mut rows = Vec::new();
    for i in 0..5 {
        let ki = Val::from(
            ks_t.slice(&[i, 0], &[i + 1, 2], None)
                .unwrap()
                .reshape(&[2])
                .unwrap(),
        );
        rows.push(random::uniform(&ki, &[100], DType::F32).unwrap());
    }
    let row_refs: Vec<Tensor> = rows
        .iter()
        .map(|v| v.tensor().unwrap().clone())
        .collect();
    let stacked = Tensor::stack(&row_refs.iter().collect::<Vec<_>>(), 0).unwrap();
    assert_eq!(read(&batched[0]), read_t(&stacked));
}

#[test]
fn test_vmap_movement_rules() {
    setup();
    let f = |args: &[Val]| -> gradix::Result<Vec<Val>> {
        let r = ops::reshape(&args[0], &[4])?;
        let s = ops::slice(&r, &[1], &[3], None)?;
        Ok(vec![ops::flip(&s, &[0])?])
    };
    let x = Val::from(f32s(&[2, 2, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]));
    let out = vmap(f, vec![Some(0)])(&[x]).unwrap();
    assert_eq!(out[0].shape(), vec![2, 2]);
    assert_eq!(read(&out[0]), vec![2.0, 1.0, 6.0, 5.0]);
}
